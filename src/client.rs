//! End-to-end run: find the target, connect, exercise its characteristics.
//!
//! Scanner → resolved device → GATT session → protocol driver. Only one
//! session is ever open; it is closed before [`GattClient::run`] returns,
//! whether the pass succeeded or not.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ble::advertising::{DeviceIdentity, TargetSpec};
use crate::ble::characteristics::ServiceCatalog;
use crate::ble::connection::GattSession;
use crate::ble::scanner::DeviceScanner;
use crate::ble::transport::BleCentral;
use crate::ble::uuids::is_custom_uuid;
use crate::config::ClientConfig;
use crate::driver::{ProtocolDriver, Report};
use crate::error::Result;

/// How the target device is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acquisition {
    /// Repeated sub-scans matched against the configured [`TargetSpec`].
    #[default]
    Scan,
    /// Repeated address lookups (address targets only).
    Lookup,
}

/// Runs the full acquisition and characteristic pass.
pub struct GattClient<C> {
    central: C,
    config: ClientConfig,
    acquisition: Acquisition,
}

impl<C: BleCentral> GattClient<C> {
    /// Create a client over `central`.
    pub fn new(central: C, config: ClientConfig) -> Self {
        Self {
            central,
            config,
            acquisition: Acquisition::default(),
        }
    }

    /// Choose how the device is acquired.
    pub fn with_acquisition(mut self, acquisition: Acquisition) -> Self {
        self.acquisition = acquisition;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the underlying central.
    pub fn central(&self) -> &C {
        &self.central
    }

    /// Find the target device.
    pub async fn find(&self, cancel: &CancellationToken) -> Result<DeviceIdentity> {
        let scanner = DeviceScanner::new(&self.central, self.config.scan_options());

        match (&self.acquisition, &self.config.target) {
            (Acquisition::Lookup, TargetSpec::Address(address)) => {
                scanner.find_by_address(address, cancel).await
            }
            (Acquisition::Lookup, target) => {
                warn!("Address lookup needs an address target; scanning for {}", target);
                scanner.find(target, cancel).await
            }
            (Acquisition::Scan, target) => scanner.find(target, cancel).await,
        }
    }

    /// Find the target, connect, and run the characteristic pass.
    ///
    /// # Errors
    ///
    /// Scan timeout or cancellation, connection failure, and a missing
    /// service end the run. Characteristic failures are in the report.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Report> {
        let device = self.find(cancel).await?;

        let session =
            GattSession::connect(&self.central, &device, self.config.connect_timeout).await?;

        let result = match session.services() {
            Ok(catalog) => {
                log_catalog(catalog);
                ProtocolDriver::from_config(&self.config).run(&session).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = session.close().await {
            debug!("Ignoring error while closing session: {}", e);
        }

        let report = result?;
        info!(
            "Characteristic pass complete: {} ok, {} failed",
            report.characteristics.len() - report.failures().count(),
            report.failures().count()
        );
        Ok(report)
    }
}

fn log_catalog(catalog: &ServiceCatalog) {
    info!("Services:");
    for service in catalog.services() {
        info!("  {}", service.uuid);
        for characteristic in service.characteristics.values() {
            let marker = if is_custom_uuid(&characteristic.uuid) {
                " (custom)"
            } else {
                ""
            };
            info!(
                "    {} {:?}{}",
                characteristic.uuid, characteristic.flags, marker
            );
        }
    }
}
