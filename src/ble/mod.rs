//! BLE communication module.
//!
//! This module provides device discovery, target matching and GATT access
//! on top of the [`transport`] capability traits.

pub mod advertising;
pub mod characteristics;
pub mod connection;
pub mod platform;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use advertising::{matches, DeviceIdentity, ManufacturerData, TargetSpec};
pub use characteristics::{
    CharacteristicFlags, CharacteristicInfo, Notification, ReceivedNotification, ServiceCatalog,
    ServiceInfo,
};
pub use connection::{ConnectionState, GattSession, SubscriptionHandle};
pub use platform::{BtleCentral, BtleLink};
pub use scanner::{DeviceScanner, DiscoverySet, ScanOptions};
pub use transport::{BleCentral, GattLink, NotificationStream};
pub use uuids::*;
