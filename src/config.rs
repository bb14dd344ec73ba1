//! YAML configuration file for the poller and the metrics exporter.
//!
//! ```yaml
//! devices:
//!   - "A4:C1:37:00:11:22"
//!   - "A4:C1:37:00:33:44"
//! host: 127.0.0.1
//! port: 9100
//! notification_timeout: 150ms
//! settle_interval: 2s
//! ```

use crate::poller::{PollerConfig, DEFAULT_NOTIFICATION_TIMEOUT, DEFAULT_SETTLE_INTERVAL};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot open config file {path:?}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Cannot read config from file {path:?}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// BLE addresses of the batteries to poll.
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default = "Config::default_host")]
    pub host: String,
    #[serde(default = "Config::default_port")]
    pub port: u16,
    #[serde(
        default = "Config::default_notification_timeout",
        with = "humantime_serde"
    )]
    pub notification_timeout: Duration,
    #[serde(
        default = "Config::default_settle_interval",
        with = "humantime_serde"
    )]
    pub settle_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            host: Self::default_host(),
            port: Self::default_port(),
            notification_timeout: Self::default_notification_timeout(),
            settle_interval: Self::default_settle_interval(),
        }
    }
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &'static str = "jbdbms.yaml";

    fn default_host() -> String {
        "0.0.0.0".into()
    }

    fn default_port() -> u16 {
        8080
    }

    fn default_notification_timeout() -> Duration {
        DEFAULT_NOTIFICATION_TIMEOUT
    }

    fn default_settle_interval() -> Duration {
        DEFAULT_SETTLE_INTERVAL
    }

    pub fn load(config_file_path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = config_file_path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let config_file = std::fs::File::open(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_reader(&config_file).map_err(|source| Error::Yaml {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            notification_timeout: self.notification_timeout,
            settle_interval: self.settle_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "devices:\n  - \"A4:C1:37:00:11:22\"\n  - \"A4:C1:37:00:33:44\"\nhost: 127.0.0.1\nport: 9100\nnotification_timeout: 150ms\nsettle_interval: 2s"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.devices, vec!["A4:C1:37:00:11:22", "A4:C1:37:00:33:44"]);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9100);
        assert_eq!(
            config.poller_config(),
            PollerConfig {
                notification_timeout: Duration::from_millis(150),
                settle_interval: Duration::from_secs(2),
            }
        );
    }

    #[test]
    fn load_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "devices: [\"A4:C1:37:00:11:22\"]").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.poller_config(), PollerConfig::default());
    }

    #[test]
    fn load_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "device: \"A4:C1:37:00:11:22\"").unwrap();
        assert!(matches!(Config::load(file.path()), Err(Error::Yaml { .. })));
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("missing.yaml")),
            Err(Error::Io { .. })
        ));
    }
}
