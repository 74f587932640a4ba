//! btleplug implementation of the BLE capability traits.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::ble::advertising::DeviceIdentity;
use crate::ble::characteristics::{CharacteristicInfo, Notification, ServiceInfo};
use crate::ble::transport::{BleCentral, GattLink, NotificationStream};
use crate::error::{Error, Result};

/// How often the address lookup polls the adapter's peripheral list.
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// [`BleCentral`] backed by the first Bluetooth adapter on the host.
pub struct BtleCentral {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Peripherals seen by previous scans, keyed by reported address.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
}

impl BtleCentral {
    /// Open the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Snapshot every peripheral the adapter currently knows about.
    async fn collect_devices(&self) -> Result<Vec<DeviceIdentity>> {
        let mut devices = Vec::new();

        for peripheral in self.adapter.peripherals().await? {
            let properties = match peripheral.properties().await {
                Ok(Some(p)) => p,
                _ => continue,
            };

            // CoreBluetooth hides MAC addresses; fall back to the peripheral id.
            let address = if properties.address == BDAddr::default() {
                peripheral.id().to_string()
            } else {
                properties.address.to_string()
            };

            let manufacturer_data = if properties.manufacturer_data.is_empty() {
                None
            } else {
                Some(properties.manufacturer_data)
            };

            devices.push(DeviceIdentity {
                address: address.clone(),
                name: properties.local_name,
                manufacturer_data,
                rssi: properties.rssi,
            });

            self.peripherals.write().insert(address, peripheral);
        }

        Ok(devices)
    }

    async fn resolve(&self, device: &DeviceIdentity) -> Result<Peripheral> {
        if let Some(p) = self.lookup_cached(&device.address) {
            return Ok(p);
        }

        self.collect_devices().await?;

        self.lookup_cached(&device.address)
            .ok_or_else(|| Error::ConnectionFailed {
                reason: format!("device {} is no longer known to the adapter", device.address),
            })
    }

    /// Poll the adapter's peripheral list until `address` shows up or
    /// `deadline` passes. The adapter must already be scanning.
    async fn poll_for_address(
        &self,
        address: &str,
        deadline: Instant,
    ) -> Result<Option<DeviceIdentity>> {
        loop {
            let devices = self.collect_devices().await?;
            if let Some(device) = devices
                .into_iter()
                .find(|d| d.address.eq_ignore_ascii_case(address))
            {
                return Ok(Some(device));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOOKUP_POLL_INTERVAL).await;
        }
    }

    fn lookup_cached(&self, address: &str) -> Option<Peripheral> {
        self.peripherals
            .read()
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(address))
            .map(|(_, p)| p.clone())
    }
}

/// Combine the result of a scan with the result of stopping it.
///
/// The scan error wins when both fail; a failed stop is reported even when
/// the scan itself succeeded.
fn finish_scan<T>(outcome: Result<T>, stopped: Result<()>) -> Result<T> {
    let value = outcome?;
    stopped?;
    Ok(value)
}

#[async_trait]
impl BleCentral for BtleCentral {
    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceIdentity>> {
        trace!("Scanning for {:?}", duration);

        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;
        let devices = self.collect_devices().await;
        let stopped = self.adapter.stop_scan().await.map_err(Error::from);

        finish_scan(devices, stopped)
    }

    async fn find_by_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<DeviceIdentity>> {
        let deadline = Instant::now() + timeout;

        self.adapter.start_scan(ScanFilter::default()).await?;
        let found = self.poll_for_address(address, deadline).await;
        let stopped = self.adapter.stop_scan().await.map_err(Error::from);

        finish_scan(found, stopped)
    }

    async fn connect(&self, device: &DeviceIdentity) -> Result<Box<dyn GattLink>> {
        let peripheral = self.resolve(device).await?;

        // btleplug connects without pairing; bonding is left to the OS and
        // never requested here.
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }

        debug!("Link established to {}", device.address);

        Ok(Box::new(BtleLink { peripheral }))
    }
}

/// [`GattLink`] over a connected btleplug peripheral.
pub struct BtleLink {
    peripheral: Peripheral,
}

impl BtleLink {
    fn characteristic(&self, info: &CharacteristicInfo) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == info.uuid && c.service_uuid == info.service_uuid)
            .ok_or(Error::CharacteristicNotFound { uuid: info.uuid })
    }
}

#[async_trait]
impl GattLink for BtleLink {
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>> {
        self.peripheral.discover_services().await?;

        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| {
                service.characteristics.iter().fold(
                    ServiceInfo::new(service.uuid),
                    |acc, c| acc.with_characteristic(c.uuid, c.properties.into()),
                )
            })
            .collect::<Vec<_>>();

        debug!("Discovered {} services", services.len());

        Ok(services)
    }

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>> {
        let c = self.characteristic(characteristic)?;
        let data = self.peripheral.read(&c).await?;

        trace!("Read {} bytes from characteristic {}", data.len(), c.uuid);

        Ok(data)
    }

    async fn write(&self, characteristic: &CharacteristicInfo, data: &[u8]) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .write(&c, data, WriteType::WithResponse)
            .await?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), c.uuid);

        Ok(())
    }

    async fn subscribe(&self, characteristic: &CharacteristicInfo) -> Result<NotificationStream> {
        let c = self.characteristic(characteristic)?;

        // Open the stream before enabling notifications so the first value
        // is not lost.
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&c).await?;

        let uuid = c.uuid;
        let stream = notifications
            .filter(move |n| futures::future::ready(n.uuid == uuid))
            .map(|n| Notification {
                sender: n.uuid,
                value: n.value,
            });

        Ok(Box::pin(stream))
    }

    async fn unsubscribe(&self, characteristic: &CharacteristicInfo) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(&c).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peripheral_error(message: &str) -> Error {
        Error::PeripheralError {
            message: message.to_string(),
        }
    }

    #[test]
    fn test_finish_scan_keeps_scan_error() {
        let result: Result<Vec<DeviceIdentity>> =
            finish_scan(Err(peripheral_error("peripherals() failed")), Ok(()));
        assert!(matches!(
            result,
            Err(Error::PeripheralError { message }) if message == "peripherals() failed"
        ));

        let result: Result<Vec<DeviceIdentity>> = finish_scan(
            Err(peripheral_error("peripherals() failed")),
            Err(peripheral_error("stop_scan() failed")),
        );
        assert!(matches!(
            result,
            Err(Error::PeripheralError { message }) if message == "peripherals() failed"
        ));
    }

    #[test]
    fn test_finish_scan_reports_stop_failure() {
        let result = finish_scan(
            Ok(Some(DeviceIdentity::new("AA"))),
            Err(peripheral_error("busy")),
        );
        assert!(matches!(result, Err(Error::PeripheralError { .. })));

        let result = finish_scan(Ok(Some(DeviceIdentity::new("AA"))), Ok(()));
        assert_eq!(result.unwrap(), Some(DeviceIdentity::new("AA")));
    }
}
