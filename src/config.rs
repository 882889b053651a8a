//! Runtime configuration, loaded from JSON.
//!
//! Every field has a default, so a partial file (or `{}`) is valid:
//!
//! ```json
//! {
//!   "sync": { "liveness_timeout_ms": 30000, "resync_interval_ms": 10000, "max_decode_errors": 3 },
//!   "awareness": { "timeout_ms": 30000 },
//!   "limits": { "max_ops_per_message": 10000, "max_message_bytes": 10485760 }
//! }
//! ```

use crate::awareness::AwarenessConfig;
use crate::sync::{SyncConfig, ValidationLimits};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub awareness: AwarenessConfig,
    pub limits: ValidationLimits,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl Config {
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path)?;
        Self::from_json_str(&input)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.liveness_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.liveness_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        if self.awareness.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "awareness.timeout_ms",
                reason: "must be positive".into(),
            });
        }
        if self.limits.max_ops_per_message == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_ops_per_message",
                reason: "must be positive".into(),
            });
        }
        if self.limits.max_message_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_message_bytes",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}
