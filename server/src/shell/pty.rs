//! PTY allocation, process spawning, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The master fd is kept alive for the
//! relay's lifetime so resizes can be applied to it; reads and writes go
//! through independent clones of it.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

use super::process::CommandSpec;

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn `spec` on the slave side of the PTY.
///
/// The child becomes a session leader with the slave as its controlling
/// terminal, so its pid is also its process group id. The caller must drop
/// its own copy of the slave afterwards, or reads from the master never see
/// the end of the session.
pub fn spawn_on_pty(
    pty: &PtyPair,
    spec: &CommandSpec,
    working_dir: &str,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(working_dir)
        .envs(&spec.env)
        .env("TERM", "xterm-256color")
        .kill_on_drop(true);

    // stdio is wired to the slave in pre_exec.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window. The foreground process group receives
/// `SIGWINCH`.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let size = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ reads a Winsize struct from the pointer.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(size),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}
