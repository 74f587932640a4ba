//! BLE connection management.
//!
//! A [`GattSession`] owns the single link to the target peripheral and
//! exposes raw-byte read, write and notify operations scoped to that link.

use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::DeviceIdentity;
use crate::ble::characteristics::{CharacteristicInfo, Notification, ServiceCatalog};
use crate::ble::transport::{BleCentral, GattLink};
use crate::error::{Error, Result};

/// Default time allowed for establishing a link and enumerating services.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(100);

/// Connection state for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected to the peripheral.
    #[default]
    Disconnected,
    /// Connected to the peripheral.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Handle to an active notification subscription.
///
/// Dropping the handle stops delivery to the callback at once; pass it to
/// [`GattSession::unsubscribe`] to flush notifications the link has already
/// delivered and disable notifications on the peripheral.
pub struct SubscriptionHandle {
    id: u64,
    characteristic: CharacteristicInfo,
    stop: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Get the subscription ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the subscribed characteristic UUID.
    pub fn characteristic(&self) -> Uuid {
        self.characteristic.uuid
    }

    /// Stop the forwarder after it has passed on every notification that is
    /// already waiting in the link stream.
    async fn finish(&mut self) {
        self.stop.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                warn!(
                    "Notification forwarder for {} ended abnormally: {}",
                    self.characteristic.uuid, e
                );
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("characteristic", &self.characteristic.uuid)
            .finish()
    }
}

/// An open GATT connection to one peripheral.
///
/// The session never requests pairing or bonding. [`close`](Self::close) is
/// idempotent; every other operation fails with [`Error::SessionClosed`]
/// afterwards.
pub struct GattSession {
    /// The peripheral this session is connected to.
    device: DeviceIdentity,
    /// The underlying link.
    link: Box<dyn GattLink>,
    /// Services enumerated at connect time.
    catalog: ServiceCatalog,
    /// Current connection state.
    state: RwLock<ConnectionState>,
    /// Subscription ID counter.
    subscription_counter: AtomicU64,
    /// Characteristics with notifications enabled, by subscription ID.
    subscriptions: Mutex<HashMap<u64, Uuid>>,
}

impl GattSession {
    /// Connect to `device` and enumerate its services.
    ///
    /// Fails with [`Error::ConnectionFailed`] if the link cannot be
    /// established, or service enumeration does not complete, within
    /// `timeout`.
    pub async fn connect(
        central: &dyn BleCentral,
        device: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<Self> {
        info!("Connecting to {} ({})", device.display_name(), device.address);

        let deadline = Instant::now() + timeout;

        let link = match tokio::time::timeout_at(deadline, central.connect(device)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(connection_failed(device, e.to_string())),
            Err(_) => {
                return Err(connection_failed(
                    device,
                    format!("timed out after {:?}", timeout),
                ))
            }
        };

        let discovered = tokio::time::timeout_at(deadline, link.discover_services()).await;
        let reason = match discovered {
            Ok(Ok(services)) => {
                return Ok(Self::established(device, link, ServiceCatalog::new(services)));
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("service discovery timed out after {:?}", timeout),
        };

        if let Err(e) = link.disconnect().await {
            debug!("Disconnect after failed discovery: {}", e);
        }
        Err(connection_failed(device, reason))
    }

    fn established(
        device: &DeviceIdentity,
        link: Box<dyn GattLink>,
        catalog: ServiceCatalog,
    ) -> Self {
        info!(
            "Connected to {}, {} services available",
            device.address,
            catalog.len()
        );

        Self {
            device: device.clone(),
            link,
            catalog,
            state: RwLock::new(ConnectionState::Connected),
            subscription_counter: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// The peripheral this session is connected to.
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Services enumerated at connect time.
    pub fn services(&self) -> Result<&ServiceCatalog> {
        self.ensure_open()?;
        Ok(&self.catalog)
    }

    /// Read a characteristic value.
    pub async fn read(&self, uuid: &Uuid) -> Result<Vec<u8>> {
        let characteristic = self.lookup(uuid)?;
        let data = self.link.read(&characteristic).await?;

        trace!("Read {} bytes from characteristic {}", data.len(), uuid);

        Ok(data)
    }

    /// Write a characteristic value.
    pub async fn write(&self, uuid: &Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.lookup(uuid)?;
        self.link.write(&characteristic, data).await?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), uuid);

        Ok(())
    }

    /// Subscribe to notifications from a characteristic.
    ///
    /// `on_notify` runs on a forwarding task for every notification, in
    /// delivery order. It should return quickly.
    pub async fn subscribe<F>(&self, uuid: &Uuid, on_notify: F) -> Result<SubscriptionHandle>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let characteristic = self.lookup(uuid)?;

        if !characteristic.flags.can_subscribe() {
            return Err(Error::NotSupported {
                operation: format!("notifications on {}", uuid),
            });
        }

        let mut stream = self.link.subscribe(&characteristic).await?;

        let id = self.subscription_counter.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().insert(id, *uuid);

        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    next = stream.next() => match next {
                        Some(notification) => on_notify(notification),
                        None => break,
                    },
                    _ = stopped.cancelled() => break,
                }
            }
        });

        debug!("Subscribed to notifications from {} (id {})", uuid, id);

        Ok(SubscriptionHandle {
            id,
            characteristic,
            stop,
            forwarder: Some(forwarder),
        })
    }

    /// Stop a subscription and disable notifications on the peripheral.
    ///
    /// Notifications the link delivered before the call still reach the
    /// callback. No callback runs for this subscription once this returns.
    pub async fn unsubscribe(&self, mut handle: SubscriptionHandle) -> Result<()> {
        handle.finish().await;
        self.subscriptions.lock().remove(&handle.id);

        self.ensure_open()?;
        self.link.unsubscribe(&handle.characteristic).await?;

        debug!(
            "Unsubscribed from notifications from {} (id {})",
            handle.characteristic.uuid, handle.id
        );

        Ok(())
    }

    /// Number of subscriptions not yet unsubscribed.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Release the link.
    ///
    /// Calling this more than once is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.is_connected() {
                return Ok(());
            }
            *state = ConnectionState::Disconnecting;
        }

        self.subscriptions.lock().clear();
        let result = self.link.disconnect().await;
        *self.state.write() = ConnectionState::Disconnected;

        match result {
            Ok(()) => {
                info!("Disconnected from {}", self.device.address);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to disconnect cleanly: {}", e);
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().is_connected() {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    fn lookup(&self, uuid: &Uuid) -> Result<CharacteristicInfo> {
        self.ensure_open()?;
        self.catalog
            .characteristic(uuid)
            .cloned()
            .ok_or(Error::CharacteristicNotFound { uuid: *uuid })
    }
}

fn connection_failed(device: &DeviceIdentity, reason: String) -> Error {
    warn!("Connection to {} failed: {}", device.address, reason);
    Error::ConnectionFailed { reason }
}
