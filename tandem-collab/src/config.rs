//! Adapter configuration.
//!
//! Loaded from TOML; every numeric knob has a default so a config file only
//! has to name the transport:
//!
//! ```toml
//! capture_timeout_ms = 500
//!
//! [transport]
//! kind = "direct"
//! ws_base = "ws://localhost:9090"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::Backoff;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which network channel backs the session. Exactly one provider exists per
/// adapter because the two are variants of one enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Direct WebSocket room server at `{ws_base}/rooms/{room_id}`.
    Direct { ws_base: String },
    /// Managed pub/sub broker; connection URLs come from `negotiate_url`.
    Managed { negotiate_url: String },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::Managed { .. } => "managed",
        }
    }
}

/// Adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Quiet period that seals an undo batch
    pub capture_timeout_ms: u64,
    /// Consecutive failed retries tolerated before giving up
    pub max_retry_attempts: u32,
    /// Upper bound on negotiation and on socket handshake, each
    pub connect_timeout_ms: u64,
    /// First retry delay; doubles per retry
    pub backoff_base_ms: u64,
    /// Retry delay ceiling
    pub backoff_max_ms: u64,
    /// Operations buffered while not connected
    pub offline_queue_capacity: usize,
    pub transport: TransportConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            capture_timeout_ms: 500,
            max_retry_attempts: 5,
            connect_timeout_ms: 10_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            offline_queue_capacity: 10_000,
            transport: TransportConfig::Direct {
                ws_base: "ws://127.0.0.1:9090".to_string(),
            },
        }
    }
}

impl CollabConfig {
    /// Direct-transport config with default knobs.
    pub fn direct(ws_base: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::Direct {
                ws_base: ws_base.into(),
            },
            ..Self::default()
        }
    }

    /// Managed-transport config with default knobs.
    pub fn managed(negotiate_url: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::Managed {
                negotiate_url: negotiate_url.into(),
            },
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path)?;
        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.transport {
            TransportConfig::Direct { ws_base } => {
                check_endpoint("direct ws_base", ws_base, &["ws://", "wss://"])?
            }
            TransportConfig::Managed { negotiate_url } => {
                check_endpoint("managed negotiate_url", negotiate_url, &["http://", "https://"])?
            }
        }
        self.validate_limits()
    }

    /// Checks everything except the transport section.
    pub(crate) fn validate_limits(&self) -> Result<(), ConfigError> {
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.offline_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "offline_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

/// `url` must use one of `schemes` and name a host.
fn check_endpoint(field: &str, url: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let Some(rest) = schemes.iter().find_map(|scheme| url.strip_prefix(scheme)) else {
        return Err(ConfigError::Invalid(format!(
            "{field} must be a {} URL, got {url:?}",
            schemes.join(" or ")
        )));
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    if host.is_empty() || host.starts_with(':') {
        return Err(ConfigError::Invalid(format!("{field} has no host: {url:?}")));
    }
    Ok(())
}
