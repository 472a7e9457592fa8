//! TOML-based configuration for the daemon.
//!
//! The file lives at [`DEFAULT_CONFIG_PATH`] unless `--config` names another
//! one. Every section and every field is optional:
//!
//! ```toml
//! log_level = "debug"
//!
//! [listen]
//! listen_tcp = true
//! tcp_addr = "0.0.0.0:16509"
//!
//! [auth]
//! auth_unix_ro = "polkit"
//! auth_tcp = "none"
//!
//! [limits]
//! max_clients = 200
//!
//! [keepalive]
//! interval = 10
//! count = 3
//! ```
//!
//! Fields annotated with `#[serde(default = "some_fn")]` take the value of
//! `some_fn()` when absent, so a missing file and an empty file mean the same
//! thing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::auth::{AllowList, AuthType};

/// Where the daemon looks for its configuration by default.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtd/virtd.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An entry of `sasl_allowed_username_list` is not a valid pattern.
    #[error("invalid username pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// A value is out of range or names a backend this build lacks.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Listener addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// Read-write local socket.
    #[serde(default = "default_unix_sock_rw")]
    pub unix_sock_rw: PathBuf,
    /// Read-only local socket.
    #[serde(default = "default_unix_sock_ro")]
    pub unix_sock_ro: PathBuf,
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,
    /// Whether the TCP listener is bound at all.
    #[serde(default)]
    pub listen_tcp: bool,
}

/// Authentication each listener demands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    #[serde(default = "default_auth_unix")]
    pub auth_unix_rw: AuthType,
    #[serde(default = "default_auth_unix")]
    pub auth_unix_ro: AuthType,
    #[serde(default = "default_auth_tcp")]
    pub auth_tcp: AuthType,
    /// Glob patterns of SASL usernames allowed in. Absent means everyone;
    /// an empty list means nobody.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sasl_allowed_username_list: Option<Vec<String>>,
}

/// Admission caps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Concurrent client connections across all listeners.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Calls executing at once across all clients.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Calls executing at once for one client.
    #[serde(default = "default_max_client_requests")]
    pub max_client_requests: usize,
}

/// Keep-alive settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeepaliveConfig {
    /// Seconds between pings; `-1` disables keep-alive.
    #[serde(default = "default_keepalive_interval")]
    pub interval: i64,
    /// Silent intervals tolerated before the connection is dropped.
    #[serde(default = "default_keepalive_count")]
    pub count: u32,
    /// Refuse `ConnectOpen` from clients that did not declare keep-alive.
    #[serde(default)]
    pub required: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_unix_sock_rw() -> PathBuf {
    PathBuf::from("/run/virtd/virtd-sock")
}
fn default_unix_sock_ro() -> PathBuf {
    PathBuf::from("/run/virtd/virtd-sock-ro")
}
fn default_tcp_addr() -> String {
    "0.0.0.0:16509".to_string()
}
fn default_auth_unix() -> AuthType {
    AuthType::None
}
fn default_auth_tcp() -> AuthType {
    AuthType::Sasl
}
fn default_max_clients() -> usize {
    5000
}
fn default_max_workers() -> usize {
    20
}
fn default_max_client_requests() -> usize {
    5
}
fn default_keepalive_interval() -> i64 {
    5
}
fn default_keepalive_count() -> u32 {
    5
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            unix_sock_rw: default_unix_sock_rw(),
            unix_sock_ro: default_unix_sock_ro(),
            tcp_addr: default_tcp_addr(),
            listen_tcp: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_unix_rw: default_auth_unix(),
            auth_unix_ro: default_auth_unix(),
            auth_tcp: default_auth_tcp(),
            sasl_allowed_username_list: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            max_workers: default_max_workers(),
            max_client_requests: default_max_client_requests(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: default_keepalive_interval(),
            count: default_keepalive_count(),
            required: false,
        }
    }
}

impl DaemonConfig {
    /// Rejects values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("limits.max_clients", self.limits.max_clients),
            ("limits.max_workers", self.limits.max_workers),
            ("limits.max_client_requests", self.limits.max_client_requests),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.keepalive.interval == 0 || self.keepalive.interval < -1 {
            return Err(ConfigError::Invalid {
                field: "keepalive.interval",
                reason: format!("{} is neither positive nor -1", self.keepalive.interval),
            });
        }
        let mut bound = vec![
            ("auth.auth_unix_rw", self.auth.auth_unix_rw),
            ("auth.auth_unix_ro", self.auth.auth_unix_ro),
        ];
        if self.listen.listen_tcp {
            bound.push(("auth.auth_tcp", self.auth.auth_tcp));
        }
        for (field, auth) in bound {
            if auth == AuthType::Sasl {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "no SASL backend is built into this daemon".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl AuthConfig {
    /// Compiles `sasl_allowed_username_list`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Pattern`] for a malformed glob.
    pub fn allow_list(&self) -> Result<AllowList, ConfigError> {
        match &self.sasl_allowed_username_list {
            Some(patterns) => Ok(AllowList::from_patterns(patterns)?),
            None => Ok(AllowList::allow_all()),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads the configuration at `path`, returning `DaemonConfig::default()` if
/// the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and
/// [`ConfigError::Invalid`] if a value is out of range.
pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let cfg = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<DaemonConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &DaemonConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
