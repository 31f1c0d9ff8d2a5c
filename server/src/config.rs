//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `KUBEDECK_LISTEN`, `KUBEDECK_API_KEY`,
//!    `KUBEDECK_DATA_DIR`, `KUBECONFIG`
//! 2. **Config file** — path via `--config <path>`, or `kubedeck.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:4466"
//! data_dir = "~/.local/share/kubedeck"
//!
//! [auth]
//! api_key = "your-secret-key"   # omit for loopback-only use without auth
//!
//! [kube]
//! kubectl = "kubectl"
//! kubeconfig = "/home/me/.kube/config"
//!
//! [forward]
//! startup_timeout_ms = 5000
//! success_marker = "Forwarding from"
//! stop_grace_ms = 3000
//! fsync = false
//!
//! [shell]
//! default_shell = "/bin/zsh"
//! working_dir = "~"
//! seed_context = true
//! rows = 24
//! cols = 80
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:4466`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory holding the session store. A leading `~` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Optional shared secret for the local API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// When unset, every request is accepted.
    pub api_key: Option<String>,
}

/// How the cluster tooling is invoked.
#[derive(Debug, Clone, Deserialize)]
pub struct KubeConfig {
    /// `kubectl` binary, resolved through `PATH` when not absolute.
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    /// Exported as `KUBECONFIG` to every child process when set.
    pub kubeconfig: Option<String>,
}

/// Port-forward lifecycle tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// How long `start` waits for the success marker before assuming the
    /// forward is up (default 5000).
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Substring of forwarder stdout that confirms the tunnel is live.
    #[serde(default = "default_success_marker")]
    pub success_marker: String,
    /// Grace period between SIGTERM and SIGKILL during shutdown (default 3000).
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// fsync the store log after every write (default false).
    #[serde(default)]
    pub fsync: bool,
}

/// Local shell relay defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary (default `$SHELL`, else `/bin/sh`).
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Working directory for local shells (default `~`).
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Type `kubectl config use-context` into new shells (default true).
    #[serde(default = "default_seed_context")]
    pub seed_context: bool,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:4466".to_string()
}
fn default_data_dir() -> String {
    "~/.local/share/kubedeck".to_string()
}
fn default_kubectl() -> String {
    "kubectl".to_string()
}
fn default_startup_timeout_ms() -> u64 {
    5000
}
fn default_success_marker() -> String {
    "Forwarding from".to_string()
}
fn default_stop_grace_ms() -> u64 {
    3000
}
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_seed_context() -> bool {
    true
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            kubeconfig: None,
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            success_marker: default_success_marker(),
            stop_grace_ms: default_stop_grace_ms(),
            fsync: false,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            working_dir: default_working_dir(),
            seed_context: default_seed_context(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ForwardConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl KubeConfig {
    /// Environment merged into every kubectl child.
    pub fn child_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(ref path) = self.kubeconfig {
            env.insert("KUBECONFIG".to_string(), expand_tilde(path));
        }
        env
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `kubedeck.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("kubedeck.toml").exists() => Self::from_file("kubedeck.toml")?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("KUBEDECK_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(key) = lookup("KUBEDECK_API_KEY") {
            self.auth.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(dir) = lookup("KUBEDECK_DATA_DIR") {
            self.server.data_dir = dir;
        }
        if let Some(kubeconfig) = lookup("KUBECONFIG") {
            if self.kube.kubeconfig.is_none() {
                self.kube.kubeconfig = Some(kubeconfig);
            }
        }
    }

    /// Resolved data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.server.data_dir))
    }
}

/// Expand a leading `~` to `$HOME`; other paths pass through unchanged.
pub fn expand_tilde(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return path.to_string(),
    };
    match std::env::var("HOME") {
        Ok(home) => format!("{home}{rest}"),
        Err(_) => path.to_string(),
    }
}
