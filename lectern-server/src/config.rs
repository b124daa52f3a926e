//! Server configuration, read from `LECTERN_*` environment variables.

use std::path::PathBuf;

use lectern_hub::audit::DEFAULT_AUDIT_QUEUE;
use lectern_hub::hub::HubConfig;

pub const ENV_BIND_ADDR: &str = "LECTERN_BIND_ADDR";
pub const ENV_CHANNEL_CAPACITY: &str = "LECTERN_CHANNEL_CAPACITY";
pub const ENV_STORAGE_PATH: &str = "LECTERN_STORAGE_PATH";
pub const ENV_AUTO_OPEN_SESSIONS: &str = "LECTERN_AUTO_OPEN_SESSIONS";

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub hub: HubConfig,
    /// Audit store path (None = no audit persistence)
    pub storage_path: Option<PathBuf>,
    /// Open a session when its teacher connects
    pub auto_open_sessions: bool,
    /// Audit records buffered before new ones are dropped
    pub audit_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            hub: HubConfig::default(),
            storage_path: None,
            auto_open_sessions: true,
            audit_queue: DEFAULT_AUDIT_QUEUE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name}={value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(name: &'static str, value: &str, reason: &'static str) -> Self {
        ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = parse_bind_addr(&addr)?;
        }
        if let Some(raw) = lookup(ENV_CHANNEL_CAPACITY) {
            config.hub.channel_capacity = match raw.trim().parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::invalid(
                        ENV_CHANNEL_CAPACITY,
                        &raw,
                        "expected a positive integer",
                    ))
                }
                Ok(n) => n,
            };
        }
        if let Some(path) = lookup(ENV_STORAGE_PATH) {
            let path = path.trim();
            config.storage_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(raw) = lookup(ENV_AUTO_OPEN_SESSIONS) {
            config.auto_open_sessions = parse_flag(ENV_AUTO_OPEN_SESSIONS, &raw)?;
        }

        Ok(config)
    }
}

fn parse_bind_addr(raw: &str) -> Result<String, ConfigError> {
    let addr = raw.trim();
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(addr.to_string()),
        _ => Err(ConfigError::invalid(ENV_BIND_ADDR, raw, "expected host:port")),
    }
}

fn parse_flag(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(name, raw, "expected true or false")),
    }
}
