//! Advertisement data and target matching.
//!
//! A [`DeviceIdentity`] is what the scanner learns about a peripheral from a
//! single advertisement. A [`TargetSpec`] decides whether that peripheral is
//! the one this client is looking for.

use std::collections::HashMap;
use std::fmt;

/// Manufacturer-specific data keyed by Bluetooth company identifier.
pub type ManufacturerData = HashMap<u16, Vec<u8>>;

/// Identity of a peripheral as observed in an advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    /// Stack-specific address (a MAC address on Linux/Windows, a peripheral
    /// UUID on macOS).
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Manufacturer data, `None` when the advertisement carried none.
    pub manufacturer_data: Option<ManufacturerData>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl DeviceIdentity {
    /// Create an identity with only an address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Set the advertised name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a manufacturer-data entry.
    pub fn with_manufacturer_data(mut self, company_id: u16, payload: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data
            .get_or_insert_with(HashMap::new)
            .insert(company_id, payload.into());
        self
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Name for display, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// Criterion identifying the target peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// Match by address, case-insensitively.
    Address(String),
    /// Match by a single manufacturer-data entry, byte for byte.
    Manufacturer {
        /// Bluetooth company identifier.
        company_id: u16,
        /// Exact payload expected under `company_id`.
        payload: Vec<u8>,
    },
}

impl TargetSpec {
    /// Target a literal address.
    pub fn address(address: impl Into<String>) -> Self {
        Self::Address(address.into())
    }

    /// Target a manufacturer-data signature.
    pub fn manufacturer(company_id: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self::Manufacturer {
            company_id,
            payload: payload.into(),
        }
    }

    /// Check whether `candidate` is the target.
    pub fn matches(&self, candidate: &DeviceIdentity) -> bool {
        matches(candidate, self)
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "address {}", address),
            Self::Manufacturer {
                company_id,
                payload,
            } => write!(f, "manufacturer {:#06x} {:02X?}", company_id, payload),
        }
    }
}

/// Decide whether a discovered device is the target.
///
/// Manufacturer matching looks at the single company-id entry named by the
/// spec, so a peripheral advertising additional vendors still matches. The
/// payload must be equal, not a prefix. A device without manufacturer data
/// never matches in that mode.
pub fn matches(candidate: &DeviceIdentity, spec: &TargetSpec) -> bool {
    match spec {
        TargetSpec::Address(address) => candidate.address.eq_ignore_ascii_case(address),
        TargetSpec::Manufacturer {
            company_id,
            payload,
        } => candidate
            .manufacturer_data
            .as_ref()
            .and_then(|data| data.get(company_id))
            .map(|advertised| advertised.as_slice() == payload.as_slice())
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const COMPANY: u16 = 0x0059;

    #[test]
    fn test_address_match_is_case_insensitive() {
        let spec = TargetSpec::address("aa:bb:cc:dd:ee:ff");
        assert!(matches(&DeviceIdentity::new("AA:BB:CC:DD:EE:FF"), &spec));
        assert!(!matches(&DeviceIdentity::new("AA:BB:CC:DD:EE:F0"), &spec));
        assert!(!matches(&DeviceIdentity::new("AA:BB:CC:DD:EE"), &spec));
    }

    #[test]
    fn test_manufacturer_match() {
        let spec = TargetSpec::manufacturer(COMPANY, vec![1, 2, 3]);
        let device = DeviceIdentity::new("11:22:33:44:55:66").with_manufacturer_data(COMPANY, [1u8, 2, 3]);
        assert!(spec.matches(&device));
    }

    #[test]
    fn test_manufacturer_match_ignores_other_vendors() {
        let spec = TargetSpec::manufacturer(COMPANY, vec![1, 2, 3]);
        let device = DeviceIdentity::new("11:22:33:44:55:66")
            .with_manufacturer_data(0x004C, [9u8, 9])
            .with_manufacturer_data(COMPANY, [1u8, 2, 3]);
        assert!(spec.matches(&device));
    }

    #[test]
    fn test_absent_manufacturer_data_does_not_match() {
        let spec = TargetSpec::manufacturer(COMPANY, vec![1, 2, 3]);
        assert!(!spec.matches(&DeviceIdentity::new("11:22:33:44:55:66")));

        let mut empty = DeviceIdentity::new("11:22:33:44:55:66");
        empty.manufacturer_data = Some(HashMap::new());
        assert!(!spec.matches(&empty));
    }

    #[test]
    fn test_manufacturer_spec_ignores_address() {
        let spec = TargetSpec::manufacturer(COMPANY, vec![1]);
        let device = DeviceIdentity::new("AA:BB:CC:DD:EE:FF");
        assert!(!spec.matches(&device));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TargetSpec::manufacturer(0xFFFF, vec![0xB1, 0x01]).to_string(),
            "manufacturer 0xffff [B1, 01]"
        );
        assert_eq!(
            DeviceIdentity::new("AA").with_name("pi").display_name(),
            "pi"
        );
        assert_eq!(DeviceIdentity::new("AA").display_name(), "AA");
    }

    proptest! {
        #[test]
        fn prop_exact_payload_matches(payload in proptest::collection::vec(any::<u8>(), 0..32)) {
            let spec = TargetSpec::manufacturer(COMPANY, payload.clone());
            let device = DeviceIdentity::new("x").with_manufacturer_data(COMPANY, payload);
            prop_assert!(spec.matches(&device));
        }

        #[test]
        fn prop_truncated_payload_rejected(payload in proptest::collection::vec(any::<u8>(), 1..32)) {
            let spec = TargetSpec::manufacturer(COMPANY, payload.clone());
            let truncated = payload[..payload.len() - 1].to_vec();
            let device = DeviceIdentity::new("x").with_manufacturer_data(COMPANY, truncated);
            prop_assert!(!spec.matches(&device));
        }

        #[test]
        fn prop_extended_payload_rejected(
            payload in proptest::collection::vec(any::<u8>(), 0..32),
            extra in any::<u8>(),
        ) {
            let spec = TargetSpec::manufacturer(COMPANY, payload.clone());
            let mut extended = payload;
            extended.push(extra);
            let device = DeviceIdentity::new("x").with_manufacturer_data(COMPANY, extended);
            prop_assert!(!spec.matches(&device));
        }

        #[test]
        fn prop_other_company_rejected(
            payload in proptest::collection::vec(any::<u8>(), 0..32),
            other in any::<u16>(),
        ) {
            prop_assume!(other != COMPANY);
            let spec = TargetSpec::manufacturer(COMPANY, payload.clone());
            let device = DeviceIdentity::new("x").with_manufacturer_data(other, payload);
            prop_assert!(!spec.matches(&device));
        }
    }
}
