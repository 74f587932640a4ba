//! Capability interface over the host BLE stack.
//!
//! The scanner, session and driver only talk to the radio through these
//! traits. [`crate::ble::platform`] implements them with btleplug and
//! [`crate::mock`] implements them in memory.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::ble::advertising::DeviceIdentity;
use crate::ble::characteristics::{CharacteristicInfo, Notification, ServiceInfo};
use crate::error::Result;

/// Stream of notifications for one subscribed characteristic.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// Discovery and connection capability of a BLE adapter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Scan for `duration` and return every device seen during it.
    ///
    /// An empty list is a normal result.
    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceIdentity>>;

    /// Look for a single device by address, giving up after `timeout`.
    async fn find_by_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<DeviceIdentity>>;

    /// Establish a link to a previously discovered device.
    ///
    /// Implementations must not pair or bond with the device.
    async fn connect(&self, device: &DeviceIdentity) -> Result<Box<dyn GattLink>>;
}

/// GATT access over an established link.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Enumerate services and their characteristics.
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>>;

    /// Read a characteristic value.
    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>>;

    /// Write a characteristic value, waiting for the peripheral's response.
    async fn write(&self, characteristic: &CharacteristicInfo, data: &[u8]) -> Result<()>;

    /// Enable notifications and return the stream of values for this
    /// characteristic.
    async fn subscribe(&self, characteristic: &CharacteristicInfo) -> Result<NotificationStream>;

    /// Disable notifications.
    async fn unsubscribe(&self, characteristic: &CharacteristicInfo) -> Result<()>;

    /// Release the link.
    async fn disconnect(&self) -> Result<()>;
}

