//! Process plumbing shared by port-forwards and relay backends.
//!
//! - [`process`] — piped children in their own process group, group
//!   signalling, capped output capture, and the `kubectl exec` invocation.
//! - [`pty`] — pseudo-terminal allocation, spawning, and resize for relay
//!   backends.

pub mod process;
pub mod pty;

/// Quote `s` for a POSIX shell command line.
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:@=+,".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The line typed into a fresh local shell to make `context` current.
pub fn context_switch_line(kubectl: &str, context: &str) -> String {
    format!(
        "{} config use-context {}\r",
        quote(kubectl),
        quote(context)
    )
}
