// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-gatt-client
//!
//! A Bluetooth Low Energy client that finds one peripheral advertising a
//! custom GATT service, connects to it, and exercises its characteristics.
//!
//! The peripheral is identified either by address or by an exact
//! manufacturer-data signature in its advertisements. Once connected, every
//! characteristic of the custom service is exercised in one of three modes:
//!
//! - **Read**: read once and decode as UTF-8 text
//! - **Verify-write**: read the baseline, write a value, read it back
//! - **Notify**: collect change notifications for a fixed window
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_gatt_client::{BtleCentral, ClientConfig, GattClient, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let central = BtleCentral::new().await?;
//!     let client = GattClient::new(central, ClientConfig::default());
//!
//!     let report = client.run(&CancellationToken::new()).await?;
//!     for entry in &report.characteristics {
//!         println!("{}: {:?}", entry.uuid, entry.outcome);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Pairing
//!
//! The client never initiates pairing or bonding. Pairing has been seen to
//! break the link on some hosts, so none of the connection paths request it.
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Peripheral addresses are reported as
//! CoreBluetooth UUIDs rather than MAC addresses.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod mock;

// Re-exports for convenience
pub use client::{Acquisition, GattClient};
pub use config::{ClientConfig, ServiceUuids, TargetConfig};
pub use driver::{
    CharacteristicReport, InteractionMode, InteractionTable, Outcome, ProtocolDriver, Report,
};
pub use error::{CharacteristicError, Error, Result};

// Re-export commonly used types from submodules
pub use ble::advertising::{DeviceIdentity, TargetSpec};
pub use ble::connection::{ConnectionState, GattSession};
pub use ble::platform::BtleCentral;
pub use ble::scanner::{DeviceScanner, DiscoverySet, ScanOptions};
pub use ble::transport::{BleCentral, GattLink};
