//! Client configuration.
//!
//! Every tunable the client uses lives in [`ClientConfig`]. Defaults match
//! the compiled-in constants in [`crate::ble::uuids`]; a TOML file or the
//! builder methods override them.
//!
//! ```toml
//! scan_interval_secs = 0.5
//! scan_timeout_secs = 30
//! connect_timeout_secs = 20
//! notify_window_secs = 3
//!
//! [target]
//! manufacturer_id = 65535
//! manufacturer_payload = [177, 182, 65, 123]
//!
//! [uuids]
//! service = "00000000-b1b6-417b-af10-da8b3de984be"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use crate::ble::advertising::TargetSpec;
use crate::ble::connection::DEFAULT_CONNECT_TIMEOUT;
use crate::ble::scanner::{ScanOptions, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_SCAN_INTERVAL};
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// Default notification observation window.
pub const DEFAULT_NOTIFY_WINDOW: Duration = Duration::from_secs(3);

/// The four well-known UUIDs of the peripheral's custom service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceUuids {
    /// The custom service.
    pub service: Uuid,
    /// Brightness characteristic (notify).
    pub brightness: Uuid,
    /// Volume characteristic (read).
    pub volume: Uuid,
    /// Pause-volume characteristic (verify-write).
    pub pause_volume: Uuid,
}

impl Default for ServiceUuids {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID,
            brightness: BRIGHTNESS_UUID,
            volume: VOLUME_UUID,
            pause_volume: PAUSE_VOLUME_UUID,
        }
    }
}

/// Target section as written in the configuration file.
///
/// Exactly one of `address` or the manufacturer pair must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Literal peripheral address.
    pub address: Option<String>,
    /// Bluetooth company identifier.
    pub manufacturer_id: Option<u16>,
    /// Exact manufacturer payload.
    pub manufacturer_payload: Option<Vec<u8>>,
}

impl TargetConfig {
    fn into_spec(self) -> Result<TargetSpec> {
        match (self.address, self.manufacturer_id, self.manufacturer_payload) {
            (Some(address), None, None) => Ok(TargetSpec::Address(address)),
            (None, Some(company_id), Some(payload)) => {
                Ok(TargetSpec::Manufacturer {
                    company_id,
                    payload,
                })
            }
            (None, Some(_), None) | (None, None, Some(_)) => Err(Error::InvalidConfig {
                reason: "manufacturer_id and manufacturer_payload must be set together".into(),
            }),
            (None, None, None) => Err(Error::InvalidConfig {
                reason: "target needs an address or a manufacturer signature".into(),
            }),
            (Some(_), _, _) => Err(Error::InvalidConfig {
                reason: "target address and manufacturer signature are mutually exclusive".into(),
            }),
        }
    }
}

/// Configuration for a client run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Which peripheral to look for.
    pub target: TargetSpec,
    /// Service and characteristic UUIDs.
    pub uuids: ServiceUuids,
    /// Length of each discovery sub-scan.
    pub scan_interval: Duration,
    /// Overall scan deadline, `None` to wait until found or cancelled.
    pub scan_timeout: Option<Duration>,
    /// Timeout of each address lookup attempt.
    pub lookup_timeout: Duration,
    /// Time allowed to connect and enumerate services.
    pub connect_timeout: Duration,
    /// How long notifications are collected.
    pub notify_window: Duration,
    /// Value written to the verify-write characteristic.
    pub verify_write_value: String,
    /// Value the verify-write characteristic is expected to hold before
    /// the write.
    pub verify_baseline: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: TargetSpec::address(DEFAULT_TARGET_ADDRESS),
            uuids: ServiceUuids::default(),
            scan_interval: DEFAULT_SCAN_INTERVAL,
            scan_timeout: None,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            notify_window: DEFAULT_NOTIFY_WINDOW,
            verify_write_value: "1".to_string(),
            verify_baseline: "0".to_string(),
        }
    }
}

/// On-disk layout; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    target: Option<TargetConfig>,
    uuids: Option<ServiceUuids>,
    #[serde(deserialize_with = "opt_secs")]
    scan_interval_secs: Option<Duration>,
    #[serde(deserialize_with = "opt_secs")]
    scan_timeout_secs: Option<Duration>,
    #[serde(deserialize_with = "opt_secs")]
    lookup_timeout_secs: Option<Duration>,
    #[serde(deserialize_with = "opt_secs")]
    connect_timeout_secs: Option<Duration>,
    #[serde(deserialize_with = "opt_secs")]
    notify_window_secs: Option<Duration>,
    verify_write_value: Option<String>,
    verify_baseline: Option<String>,
}

fn opt_secs<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = Option::<f64>::deserialize(deserializer)?;
    secs.map(|s| {
        Duration::try_from_secs_f64(s).map_err(|_| {
            serde::de::Error::custom(format!("{} is not a valid number of seconds", s))
        })
    })
    .transpose()
}

impl ClientConfig {
    /// Parse a TOML document, filling unspecified values with defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(text).map_err(|e| Error::InvalidConfig {
            reason: e.to_string(),
        })?;

        let defaults = Self::default();
        let config = Self {
            target: match file.target {
                Some(target) => target.into_spec()?,
                None => defaults.target,
            },
            uuids: file.uuids.unwrap_or(defaults.uuids),
            scan_interval: file.scan_interval_secs.unwrap_or(defaults.scan_interval),
            scan_timeout: file.scan_timeout_secs.or(defaults.scan_timeout),
            lookup_timeout: file.lookup_timeout_secs.unwrap_or(defaults.lookup_timeout),
            connect_timeout: file.connect_timeout_secs.unwrap_or(defaults.connect_timeout),
            notify_window: file.notify_window_secs.unwrap_or(defaults.notify_window),
            verify_write_value: file
                .verify_write_value
                .unwrap_or(defaults.verify_write_value),
            verify_baseline: file.verify_baseline.unwrap_or(defaults.verify_baseline),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&text)
    }

    /// Check values that would stall or trivially fail a run.
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "scan interval must be positive".into(),
            });
        }
        if self.lookup_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "lookup timeout must be positive".into(),
            });
        }
        if let TargetSpec::Address(address) = &self.target {
            if address.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    reason: "target address is empty".into(),
                });
            }
        }
        Ok(())
    }

    /// Replace the target.
    pub fn with_target(mut self, target: TargetSpec) -> Self {
        self.target = target;
        self
    }

    /// Set the overall scan deadline (`None` waits forever).
    pub fn with_scan_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the sub-scan interval.
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the notification window.
    pub fn with_notify_window(mut self, window: Duration) -> Self {
        self.notify_window = window;
        self
    }

    /// Target the configured manufacturer signature, or the compiled-in one
    /// if the current target is an address.
    pub fn manufacturer_target(&self) -> TargetSpec {
        match &self.target {
            spec @ TargetSpec::Manufacturer { .. } => spec.clone(),
            TargetSpec::Address(_) => {
                TargetSpec::manufacturer(DEFAULT_MANUFACTURER_ID, DEFAULT_MANUFACTURER_PAYLOAD)
            }
        }
    }

    /// Scan options derived from this configuration.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            interval: self.scan_interval,
            timeout: self.scan_timeout,
            lookup_timeout: self.lookup_timeout,
        }
    }
}
