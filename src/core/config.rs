//! Configuration management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::usb::{Features, Timings};

/// USB discovery and capability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbConfig {
    /// Feature names excluded from every device (e.g. "notify")
    #[serde(default)]
    pub disabled_features: Vec<String>,
    /// Root directory for per-device control paths
    #[serde(default = "default_devnode_root")]
    pub devnode_root: PathBuf,
    /// Device scan interval in milliseconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
}

fn default_devnode_root() -> PathBuf {
    PathBuf::from("/var/run/chromakd")
}

fn default_scan_interval() -> u64 {
    1000
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            disabled_features: Vec::new(),
            devnode_root: default_devnode_root(),
            scan_interval_ms: default_scan_interval(),
        }
    }
}

impl UsbConfig {
    /// Exclusion mask applied to every device's feature set.
    pub fn feature_mask(&self) -> Features {
        let mut mask = Features::all();
        for name in &self.disabled_features {
            match Features::parse_name(name) {
                Some(feature) => mask &= !feature,
                None => warn!("unknown feature name in config: {}", name),
            }
        }
        mask
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

/// Link settling delays in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_delay_short")]
    pub delay_short_ms: u64,
    #[serde(default = "default_delay_medium")]
    pub delay_medium_ms: u64,
    #[serde(default = "default_delay_long")]
    pub delay_long_ms: u64,
}

fn default_delay_short() -> u64 {
    3
}
fn default_delay_medium() -> u64 {
    10
}
fn default_delay_long() -> u64 {
    100
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            delay_short_ms: default_delay_short(),
            delay_medium_ms: default_delay_medium(),
            delay_long_ms: default_delay_long(),
        }
    }
}

impl TimingConfig {
    pub fn timings(&self) -> Timings {
        Timings {
            short: Duration::from_millis(self.delay_short_ms),
            medium: Duration::from_millis(self.delay_medium_ms),
            long: Duration::from_millis(self.delay_long_ms),
        }
    }
}

/// Profile store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Snapshot file; defaults to the user data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn store_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let proj_dirs = ProjectDirs::from("org", "chromakd", "chromakd")
            .context("failed to determine data directory")?;
        Ok(proj_dirs.data_dir().join("profiles.json"))
    }
}

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// USB discovery and capability configuration
    #[serde(default)]
    pub usb: UsbConfig,
    /// Link settling delays
    #[serde(default)]
    pub timing: TimingConfig,
    /// Profile store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read config file: {:?}", config_path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {:?}", config_path))?;
            Ok(config)
        } else {
            // Return default config if file doesn't exist
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        // Create parent directories if needed
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "chromakd", "chromakd")
            .context("failed to determine config directory")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.usb.scan_interval_ms, 1000);
        assert_eq!(config.timing.delay_short_ms, 3);
        assert_eq!(config.timing.delay_medium_ms, 10);
        assert_eq!(config.timing.delay_long_ms, 100);
        assert!(config.usb.disabled_features.is_empty());
        assert_eq!(config.usb.feature_mask(), Features::all());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.usb.scan_interval_ms, config.usb.scan_interval_ms);
        assert_eq!(parsed.timing.delay_long_ms, config.timing.delay_long_ms);
    }

    #[test]
    fn test_disabled_features_build_mask() {
        let config: Config = toml::from_str(
            r#"
            [usb]
            disabled_features = ["notify", "adjrate", "warpdrive"]
            "#,
        )
        .unwrap();
        let mask = config.usb.feature_mask();
        assert!(!mask.contains(Features::NOTIFY));
        assert!(!mask.contains(Features::ADJRATE));
        assert!(mask.contains(Features::RGB));
    }

    #[test]
    fn test_timings_conversion() {
        let timing = TimingConfig {
            delay_short_ms: 1,
            delay_medium_ms: 2,
            delay_long_ms: 3,
        };
        let timings = timing.timings();
        assert_eq!(timings.short, Duration::from_millis(1));
        assert_eq!(timings.medium, Duration::from_millis(2));
        assert_eq!(timings.long, Duration::from_millis(3));
    }

    #[test]
    fn test_store_path_override() {
        let store = StoreConfig {
            path: Some(PathBuf::from("/tmp/profiles.json")),
        };
        assert_eq!(
            store.store_path().unwrap(),
            PathBuf::from("/tmp/profiles.json")
        );
    }
}
