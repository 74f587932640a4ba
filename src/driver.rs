//! Characteristic protocol driver.
//!
//! Walks every characteristic of the custom service and exercises it in the
//! mode its [`InteractionTable`] entry names. Values are UTF-8 text by the
//! peripheral's convention.
//!
//! A failure on one characteristic is recorded in the [`Report`] and the pass
//! continues. Only a missing service or a closed session end the run.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::advertising::DeviceIdentity;
use crate::ble::characteristics::ReceivedNotification;
use crate::ble::connection::GattSession;
use crate::config::ClientConfig;
use crate::error::{CharacteristicError, Error, Result};

/// How a characteristic is exercised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionMode {
    /// Read once and decode as text.
    Read,
    /// Read the baseline, write `value`, read again and require `value`.
    VerifyWrite {
        /// Baseline the first read is expected to return.
        expected_baseline: String,
        /// Value to write and verify.
        value: String,
    },
    /// Subscribe and record every notification delivered within `window`.
    Notify {
        /// How long to collect notifications.
        window: Duration,
    },
}

impl fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::VerifyWrite { value, .. } => write!(f, "verify-write {:?}", value),
            Self::Notify { window } => write!(f, "notify {:?}", window),
        }
    }
}

/// Static mapping from characteristic UUID to [`InteractionMode`].
///
/// Characteristics without an entry use the default mode, [`InteractionMode::Read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionTable {
    entries: Vec<(Uuid, InteractionMode)>,
    default_mode: InteractionMode,
}

impl Default for InteractionTable {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            default_mode: InteractionMode::Read,
        }
    }
}

impl InteractionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table for the configured peripheral: brightness is
    /// observed through notifications, pause-volume is write-verified and
    /// everything else is read.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new()
            .with(config.uuids.volume, InteractionMode::Read)
            .with(
                config.uuids.pause_volume,
                InteractionMode::VerifyWrite {
                    expected_baseline: config.verify_baseline.clone(),
                    value: config.verify_write_value.clone(),
                },
            )
            .with(
                config.uuids.brightness,
                InteractionMode::Notify {
                    window: config.notify_window,
                },
            )
    }

    /// Set the mode for a characteristic, replacing any earlier entry.
    pub fn with(mut self, uuid: Uuid, mode: InteractionMode) -> Self {
        self.entries.retain(|(existing, _)| *existing != uuid);
        self.entries.push((uuid, mode));
        self
    }

    /// Set the mode used for characteristics without an entry.
    pub fn with_default(mut self, mode: InteractionMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Mode for a characteristic.
    pub fn mode_for(&self, uuid: &Uuid) -> &InteractionMode {
        self.entries
            .iter()
            .find(|(entry, _)| entry == uuid)
            .map(|(_, mode)| mode)
            .unwrap_or(&self.default_mode)
    }
}

/// Successful result of exercising one characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The decoded value.
    Read {
        /// Value read.
        value: String,
    },
    /// The write was reflected by the following read.
    VerifiedWrite {
        /// Value before the write.
        before: String,
        /// Value after the write.
        after: String,
    },
    /// Notifications received within the window, in delivery order.
    Notifications(Vec<ReceivedNotification>),
}

/// Result for one characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicReport {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Mode it was exercised in.
    pub mode: InteractionMode,
    /// What happened.
    pub outcome: std::result::Result<Outcome, CharacteristicError>,
}

impl CharacteristicReport {
    /// Whether the characteristic behaved as expected.
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Result of a full characteristic pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// The peripheral that was exercised.
    pub device: DeviceIdentity,
    /// Service whose characteristics were exercised.
    pub service: Uuid,
    /// One entry per characteristic, in service order.
    pub characteristics: Vec<CharacteristicReport>,
}

impl Report {
    /// Entries that recorded a failure.
    pub fn failures(&self) -> impl Iterator<Item = &CharacteristicReport> {
        self.characteristics.iter().filter(|c| !c.is_ok())
    }

    /// Look up the entry for a characteristic.
    pub fn get(&self, uuid: &Uuid) -> Option<&CharacteristicReport> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Runs the characteristic pass over a [`GattSession`].
#[derive(Debug, Clone)]
pub struct ProtocolDriver {
    service: Uuid,
    table: InteractionTable,
}

impl ProtocolDriver {
    /// Create a driver for `service` using `table`.
    pub fn new(service: Uuid, table: InteractionTable) -> Self {
        Self { service, table }
    }

    /// Create a driver from configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.uuids.service, InteractionTable::from_config(config))
    }

    /// Get the interaction table.
    pub fn table(&self) -> &InteractionTable {
        &self.table
    }

    /// Exercise every characteristic of the service, one at a time.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`] if the device lacks the service, and
    /// [`Error::SessionClosed`] if the session is closed. Per-characteristic
    /// failures are recorded in the report instead.
    pub async fn run(&self, session: &GattSession) -> Result<Report> {
        let characteristics: Vec<Uuid> = session
            .services()?
            .service(&self.service)
            .ok_or(Error::ServiceNotFound { uuid: self.service })?
            .characteristics
            .keys()
            .copied()
            .collect();

        info!(
            "Exercising {} characteristics of service {}",
            characteristics.len(),
            self.service
        );

        let mut reports = Vec::with_capacity(characteristics.len());

        for uuid in characteristics {
            if !session.is_connected() {
                return Err(Error::SessionClosed);
            }

            let mode = self.table.mode_for(&uuid).clone();
            debug!("Characteristic {}: {}", uuid, mode);

            let outcome = match &mode {
                InteractionMode::Read => read_text(session, &uuid)
                    .await
                    .map(|value| Outcome::Read { value }),
                InteractionMode::VerifyWrite {
                    expected_baseline,
                    value,
                } => verify_write(session, &uuid, expected_baseline, value).await,
                InteractionMode::Notify { window } => {
                    collect_notifications(session, &uuid, *window)
                        .await
                        .map(Outcome::Notifications)
                }
            };

            match &outcome {
                Ok(result) => log_outcome(&uuid, result),
                Err(e) => warn!("{}: {}", uuid, e),
            }

            reports.push(CharacteristicReport {
                uuid,
                mode,
                outcome,
            });
        }

        Ok(Report {
            device: session.device().clone(),
            service: self.service,
            characteristics: reports,
        })
    }
}

type Step<T> = std::result::Result<T, CharacteristicError>;

async fn read_text(session: &GattSession, uuid: &Uuid) -> Step<String> {
    let bytes = session
        .read(uuid)
        .await
        .map_err(|e| CharacteristicError::Read(e.to_string()))?;

    String::from_utf8(bytes).map_err(|e| CharacteristicError::Decode {
        bytes: e.into_bytes(),
    })
}

async fn verify_write(
    session: &GattSession,
    uuid: &Uuid,
    expected_baseline: &str,
    value: &str,
) -> Step<Outcome> {
    let before = read_text(session, uuid).await?;
    if before != expected_baseline {
        warn!(
            "{}: baseline is {:?}, expected {:?}",
            uuid, before, expected_baseline
        );
    }

    session
        .write(uuid, value.as_bytes())
        .await
        .map_err(|e| CharacteristicError::Write(e.to_string()))?;

    let after = read_text(session, uuid).await?;
    if after != value {
        return Err(CharacteristicError::VerifyMismatch {
            expected: value.to_string(),
            actual: after,
        });
    }

    Ok(Outcome::VerifiedWrite { before, after })
}

async fn collect_notifications(
    session: &GattSession,
    uuid: &Uuid,
    window: Duration,
) -> Step<Vec<ReceivedNotification>> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = session
        .subscribe(uuid, move |notification| {
            let _ = tx.send((Instant::now(), notification));
        })
        .await
        .map_err(|e| CharacteristicError::Subscribe(e.to_string()))?;

    // The window opens once notifications are enabled on the peripheral.
    let started = Instant::now();
    tokio::time::sleep_until(started + window).await;

    let unsubscribed = session.unsubscribe(handle).await;

    let mut received = Vec::new();
    while let Ok((at, notification)) = rx.try_recv() {
        received.push(ReceivedNotification {
            notification,
            received_after: at.saturating_duration_since(started),
        });
    }

    unsubscribed.map_err(|e| CharacteristicError::Subscribe(e.to_string()))?;

    Ok(received)
}

fn log_outcome(uuid: &Uuid, outcome: &Outcome) {
    match outcome {
        Outcome::Read { value } => info!("{}: {}", uuid, value),
        Outcome::VerifiedWrite { before, after } => {
            info!("{}: {} -> {} (write verified)", uuid, before, after)
        }
        Outcome::Notifications(received) => {
            info!("{}: {} notifications", uuid, received.len());
            for entry in received {
                info!(
                    "  +{:?} {}",
                    entry.received_after,
                    String::from_utf8_lossy(&entry.notification.value)
                );
            }
        }
    }
}
