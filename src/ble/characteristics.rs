//! GATT service catalog and notification types.
//!
//! The catalog is the snapshot of services and characteristics enumerated
//! right after connecting. It is owned by the
//! [`GattSession`](crate::ble::connection::GattSession) and only handed out
//! while that session is open.

use std::collections::BTreeMap;
use std::time::Duration;

use uuid::Uuid;

/// Characteristic property flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicFlags {
    /// Value can be read.
    pub read: bool,
    /// Value can be written with response.
    pub write: bool,
    /// Value can be written without response.
    pub write_without_response: bool,
    /// Peripheral can push notifications.
    pub notify: bool,
    /// Peripheral can push indications.
    pub indicate: bool,
}

impl CharacteristicFlags {
    /// Flags for a read-only characteristic.
    pub const READ: Self = Self {
        read: true,
        write: false,
        write_without_response: false,
        notify: false,
        indicate: false,
    };

    /// Flags for a readable and writable characteristic.
    pub const READ_WRITE: Self = Self {
        write: true,
        ..Self::READ
    };

    /// Flags for a readable characteristic that notifies.
    pub const READ_NOTIFY: Self = Self {
        notify: true,
        ..Self::READ
    };

    /// Whether notifications or indications can be subscribed to.
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

impl From<btleplug::api::CharPropFlags> for CharacteristicFlags {
    fn from(flags: btleplug::api::CharPropFlags) -> Self {
        use btleplug::api::CharPropFlags;

        Self {
            read: flags.contains(CharPropFlags::READ),
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.contains(CharPropFlags::NOTIFY),
            indicate: flags.contains(CharPropFlags::INDICATE),
        }
    }
}

/// A characteristic within a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the owning service.
    pub service_uuid: Uuid,
    /// Supported operations.
    pub flags: CharacteristicFlags,
}

/// A GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics keyed by UUID.
    pub characteristics: BTreeMap<Uuid, CharacteristicInfo>,
}

impl ServiceInfo {
    /// Create an empty service.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: BTreeMap::new(),
        }
    }

    /// Add a characteristic to the service.
    pub fn with_characteristic(mut self, uuid: Uuid, flags: CharacteristicFlags) -> Self {
        self.characteristics.insert(
            uuid,
            CharacteristicInfo {
                uuid,
                service_uuid: self.uuid,
                flags,
            },
        );
        self
    }
}

/// Services and characteristics of a connected device, keyed by service
/// UUID then characteristic UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: BTreeMap<Uuid, ServiceInfo>,
}

impl ServiceCatalog {
    /// Build a catalog from enumerated services.
    pub fn new(services: impl IntoIterator<Item = ServiceInfo>) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.uuid, s)).collect(),
        }
    }

    /// Look up a service.
    pub fn service(&self, uuid: &Uuid) -> Option<&ServiceInfo> {
        self.services.get(uuid)
    }

    /// Look up a characteristic in any service.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicInfo> {
        self.services
            .values()
            .find_map(|service| service.characteristics.get(uuid))
    }

    /// Iterate over all services.
    pub fn services(&self) -> impl Iterator<Item = &ServiceInfo> {
        self.services.values()
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Check if no services were enumerated.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// A value pushed by the peripheral on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic that sent the notification.
    pub sender: Uuid,
    /// The notification payload.
    pub value: Vec<u8>,
}

/// A notification as recorded by the protocol driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedNotification {
    /// The notification itself.
    pub notification: Notification,
    /// Time between subscribing and delivery.
    pub received_after: Duration,
}
