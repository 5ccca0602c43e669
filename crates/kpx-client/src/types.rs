use kpx_common::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::helpers::{default_socket_path, default_store_path, env_bool, env_secs};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Proxy endpoint: unix socket path or windows pipe name.
    pub socket_path: PathBuf,
    /// Where identification keys are persisted.
    pub store_path: PathBuf,
    /// Bound on replies that need no user interaction.
    pub request_timeout: Duration,
    /// Bound on replies that may wait for a dialog in the password manager.
    pub interactive_timeout: Duration,
    /// Ask the proxy to bring up the unlock dialog when the database is locked.
    pub trigger_unlock: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            store_path: default_store_path(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            interactive_timeout: DEFAULT_INTERACTIVE_TIMEOUT,
            trigger_unlock: false,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `KPX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = std::env::var_os("KPX_SOCKET_PATH") {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(path) = std::env::var_os("KPX_STORE_PATH") {
            config.store_path = PathBuf::from(path);
        }
        if let Some(timeout) = env_secs("KPX_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = timeout;
        }
        if let Some(timeout) = env_secs("KPX_INTERACTIVE_TIMEOUT_SECS")? {
            config.interactive_timeout = timeout;
        }
        config.trigger_unlock = env_bool("KPX_TRIGGER_UNLOCK", config.trigger_unlock);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() || self.interactive_timeout.is_zero() {
            return Err(Error::config("timeouts must be greater than zero"));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::config("socket path is empty"));
        }
        Ok(())
    }
}

/// Out-of-band notifications pushed by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEvent {
    DatabaseLocked,
    DatabaseUnlocked,
}

/// Association status of the current database on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssociationState {
    /// Not checked on this connection yet.
    #[default]
    Unknown,
    /// `test-associate` or `associate` succeeded on this connection.
    Validated,
    /// No record exists, or the proxy no longer accepts it.
    NotAssociated,
}

/// Result of `test-associate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Valid,
    Invalid,
    /// No record stored for the database.
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(!config.trigger_unlock);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ClientConfig {
            request_timeout: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
