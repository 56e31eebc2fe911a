//! Handoff configuration.
//!
//! Durations are written as (fractional) seconds in the JSON form.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration shared by the publishing side and every waiting side of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Time between existence checks.
    /// Default: 3 seconds
    #[serde(with = "secs")]
    pub poll_interval: Duration,

    /// Longest a waiter waits for a bundle, and longest a published bundle waits for its
    /// consumers.
    /// Default: 30 minutes
    #[serde(with = "secs")]
    pub timeout: Duration,

    /// Distinct consumers that must retrieve the bundle before cleanup is allowed.
    /// Default: 1
    pub expected_consumers: usize,

    /// Whether the `snapshot` resource is part of the bundle.
    /// Default: true
    pub snapshot_enabled: bool,

    /// Whether the block storage resources (`volume1`, `volume2`, `metadata`,
    /// `attachment`) are part of the bundle.
    /// Default: true
    pub volumes_enabled: bool,

    /// Age after which an unconsumed bundle or a leftover temp file counts as stale.
    /// Default: 24 hours
    #[serde(with = "secs")]
    pub max_staleness: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            timeout: Duration::from_secs(30 * 60),
            expected_consumers: 1,
            snapshot_enabled: true,
            volumes_enabled: true,
            max_staleness: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl HandoffConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|err| Error::InvalidConfig(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll_interval must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("timeout must be positive".into()));
        }
        if self.expected_consumers == 0 {
            return Err(Error::InvalidConfig(
                "expected_consumers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_config_default() {
        let config = HandoffConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.timeout, Duration::from_secs(1800));
        assert_eq!(config.expected_consumers, 1);
        assert!(config.snapshot_enabled);
        assert!(config.volumes_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HandoffConfig =
            serde_json::from_str(r#"{"poll_interval": 0.5, "expected_consumers": 2}"#).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.expected_consumers, 2);
        assert_eq!(config.timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_json_round_trip() {
        let config = HandoffConfig {
            timeout: Duration::from_secs(5),
            snapshot_enabled: false,
            ..HandoffConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: HandoffConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_negative_duration_rejected() {
        assert!(serde_json::from_str::<HandoffConfig>(r#"{"timeout": -1}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = HandoffConfig {
            expected_consumers: 0,
            ..HandoffConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = HandoffConfig {
            poll_interval: Duration::ZERO,
            ..HandoffConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff.json");
        std::fs::write(&path, r#"{"timeout": 30, "poll_interval": 1}"#).unwrap();
        let config = HandoffConfig::load(&path).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(30));

        std::fs::write(&path, r#"{"expected_consumers": 0}"#).unwrap();
        assert!(matches!(HandoffConfig::load(&path), Err(Error::InvalidConfig(_))));
    }
}
