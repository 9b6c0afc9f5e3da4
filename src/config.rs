//! Configuration
//!
//! Stored as TOML. A missing file means defaults; every section and field is
//! optional.

use std::path::{Path, PathBuf};

use hidlink_transport::{Criteria, ServiceConfig};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default delay between poller iterations (ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default report buffer size (bytes per receive)
pub const DEFAULT_REPORT_BUFFER_SIZE: usize = 64;

/// Poller timing and buffer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Delay between the end of one iteration and the next receive (ms)
    pub interval_ms: u64,
    /// Maximum bytes taken from each input report
    pub report_buffer_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            report_buffer_size: DEFAULT_REPORT_BUFFER_SIZE,
        }
    }
}

impl PollerConfig {
    pub fn new(interval_ms: u64, report_buffer_size: usize) -> Result<Self, ConfigError> {
        let config = Self {
            interval_ms,
            report_buffer_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Raise zero values to 1 so the poller can never spin
    pub fn clamped(self) -> Self {
        Self {
            interval_ms: self.interval_ms.max(1),
            report_buffer_size: self.report_buffer_size.max(1),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poller.interval_ms",
                reason: "must be positive".into(),
            });
        }
        if self.report_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "poller.report_buffer_size",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HidLinkConfig {
    /// Which devices to connect to
    pub criteria: Criteria,
    pub poller: PollerConfig,
    /// hidapi backend tunables
    pub transport: ServiceConfig,
}

impl HidLinkConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hidlink")
            .join("hidlink.toml")
    }

    /// Load config from a file, or return default if not found
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HidLinkConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_toml()?).map_err(io_err)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poller.validate()?;
        if self.transport.read_timeout_ms <= 0 {
            return Err(ConfigError::Invalid {
                field: "transport.read_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        if self.transport.rescan_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "transport.rescan_interval_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("hidlink-test-{}-{}", std::process::id(), name))
            .join("hidlink.toml")
    }

    #[test]
    fn test_defaults() {
        let c = HidLinkConfig::default();
        assert_eq!(c.criteria, Criteria::new(4617, 1));
        assert_eq!(c.poller.interval_ms, 10);
        assert_eq!(c.poller.report_buffer_size, 64);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let c: HidLinkConfig = toml::from_str(
            r#"
            [criteria]
            vendor_id = 0x04D8
            product_id = 0x003F

            [poller]
            interval_ms = 25
            "#,
        )
        .unwrap();
        assert_eq!(c.criteria, Criteria::new(0x04D8, 0x003F));
        assert_eq!(c.poller.interval_ms, 25);
        assert_eq!(c.poller.report_buffer_size, 64);
        assert_eq!(c.transport, ServiceConfig::default());
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(PollerConfig::new(0, 64).is_err());
        assert!(PollerConfig::new(10, 0).is_err());
        assert!(PollerConfig::new(1, 1).is_ok());
    }

    #[test]
    fn test_clamped_raises_zeroes() {
        let c = PollerConfig {
            interval_ms: 0,
            report_buffer_size: 0,
        }
        .clamped();
        assert_eq!(c, PollerConfig::new(1, 1).unwrap());
        assert_eq!(PollerConfig::default().clamped(), PollerConfig::default());
    }

    #[test]
    fn test_missing_file_is_default() {
        let path = temp_path("missing");
        assert_eq!(HidLinkConfig::load(&path).unwrap(), HidLinkConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("save");
        let mut c = HidLinkConfig::default();
        c.poller.interval_ms = 40;
        c.transport.numbered_reports = true;
        c.save(&path).unwrap();

        let loaded = HidLinkConfig::load(&path).unwrap();
        assert_eq!(loaded, c);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let path = temp_path("invalid");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[poller]\ninterval_ms = 0\n").unwrap();

        let err = HidLinkConfig::load(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "poller.interval_ms",
                ..
            }
        ));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
