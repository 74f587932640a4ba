//! BLE Service and Characteristic UUIDs.
//!
//! Compiled-in defaults for the peripheral this client talks to. Every value
//! here can be replaced through [`crate::config::ClientConfig`].

use uuid::Uuid;

/// Custom GATT service exposed by the peripheral.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_0000_b1b6_417b_af10_da8b3de984be);
/// Brightness characteristic UUID (Read, Notify).
pub const BRIGHTNESS_UUID: Uuid = Uuid::from_u128(0x0000_0001_b1b6_417b_af10_da8b3de984be);
/// Volume characteristic UUID (Read).
pub const VOLUME_UUID: Uuid = Uuid::from_u128(0x0000_0002_b1b6_417b_af10_da8b3de984be);
/// Pause-volume characteristic UUID (Read, Write).
pub const PAUSE_VOLUME_UUID: Uuid = Uuid::from_u128(0x1000_0001_b1b6_417b_af10_da8b3de984be);

/// Default peripheral address used in address-matching mode.
pub const DEFAULT_TARGET_ADDRESS: &str = "B8:27:EB:6F:15:5B";

/// Company identifier used in manufacturer-matching mode.
///
/// 0xFFFF is reserved by the Bluetooth SIG for internal and test use.
pub const DEFAULT_MANUFACTURER_ID: u16 = 0xFFFF;

/// Manufacturer-data payload the peripheral advertises under
/// [`DEFAULT_MANUFACTURER_ID`].
pub const DEFAULT_MANUFACTURER_PAYLOAD: &[u8] = &[0xB1, 0xB6, 0x41, 0x7B];

/// Check if a characteristic belongs to the custom service family.
pub fn is_custom_uuid(uuid: &Uuid) -> bool {
    uuid.as_bytes()[4..] == SERVICE_UUID.as_bytes()[4..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "00000000-b1b6-417b-af10-da8b3de984be"
        );
        assert_eq!(
            PAUSE_VOLUME_UUID.to_string(),
            "10000001-b1b6-417b-af10-da8b3de984be"
        );
    }

    #[test]
    fn test_is_custom_uuid() {
        assert!(is_custom_uuid(&BRIGHTNESS_UUID));
        assert!(is_custom_uuid(&VOLUME_UUID));
        assert!(is_custom_uuid(&PAUSE_VOLUME_UUID));
        assert!(!is_custom_uuid(&Uuid::from_u128(
            0x0000_2a29_0000_1000_8000_00805f9b34fb
        )));
    }
}
