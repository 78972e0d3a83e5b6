use std::path::Path;
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_LOCK_GRACE_PERIOD_MS: u64 = 3_000;
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_MIN_APP_VERSION: &str = "1.0.0";
const DEFAULT_MAX_APP_VERSION: &str = "2.0.0";

/// Tunables of a [`DeviceSession`](crate::session::DeviceSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerConfig {
    /// How long opening the device may take before giving up.
    pub connect_timeout_ms: u64,
    /// Delay after a remove event before the wallet is locked.
    pub lock_grace_period_ms: u64,
    /// Commands accepted before submitters have to wait for room.
    pub queue_capacity: usize,
    /// Oldest supported companion app version (inclusive).
    pub min_app_version: String,
    /// First unsupported companion app version (exclusive).
    pub max_app_version: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            lock_grace_period_ms: DEFAULT_LOCK_GRACE_PERIOD_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            min_app_version: DEFAULT_MIN_APP_VERSION.to_string(),
            max_app_version: DEFAULT_MAX_APP_VERSION.to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, LedgerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let (min, max) = self.supported_versions()?;
        if min >= max {
            return Err(LedgerError::Config(format!(
                "minAppVersion {} must be below maxAppVersion {}",
                min, max
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn lock_grace_period(&self) -> Duration {
        Duration::from_millis(self.lock_grace_period_ms)
    }

    /// Parsed `(min, max)` bounds of the supported app version range.
    pub fn supported_versions(&self) -> Result<(Version, Version), LedgerError> {
        let parse = |field: &str, value: &str| {
            Version::parse(value).map_err(|e| {
                LedgerError::Config(format!("failed to parse {} '{}': {}", field, value, e))
            })
        };
        Ok((
            parse("minAppVersion", &self.min_app_version)?,
            parse("maxAppVersion", &self.max_app_version)?,
        ))
    }
}
