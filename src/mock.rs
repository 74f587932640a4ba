//! In-memory BLE capability for testing.
//!
//! [`MockCentral`] and [`MockPeripheral`] implement [`BleCentral`] and
//! [`GattLink`] without any radio, so the scanner, session and driver can be
//! exercised deterministically (including on paused tokio time).
//!
//! # Features
//!
//! - **Scripted scans**: each call to `scan` pops the next queued round of
//!   advertisements
//! - **Stored values**: reads return the last written value
//! - **Timed notifications**: each subscription replays a schedule of
//!   `(delay, payload)` pairs
//! - **Failure injection**: per-characteristic read/write/subscribe failures,
//!   connect failures and connect latency
//! - **Slow links**: service discovery and subscription latency

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ble::advertising::DeviceIdentity;
use crate::ble::characteristics::{
    CharacteristicFlags, CharacteristicInfo, Notification, ServiceInfo,
};
use crate::ble::transport::{BleCentral, GattLink, NotificationStream};
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// A scripted [`BleCentral`].
#[derive(Default)]
pub struct MockCentral {
    rounds: Mutex<VecDeque<Result<Vec<DeviceIdentity>>>>,
    peripherals: Mutex<HashMap<String, Arc<MockPeripheral>>>,
    scan_count: AtomicU32,
    connect_count: AtomicU32,
    connect_latency: Mutex<Duration>,
    fail_connect: AtomicBool,
}

impl std::fmt::Debug for MockCentral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCentral")
            .field("pending_rounds", &self.rounds.lock().len())
            .field("scan_count", &self.scan_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockCentral {
    /// Create a central with no scripted rounds and no peripherals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the devices returned by the next unscripted sub-scan.
    pub fn push_round(&self, devices: Vec<DeviceIdentity>) {
        self.rounds.lock().push_back(Ok(devices));
    }

    /// Queue a failing sub-scan.
    pub fn push_failed_round(&self, message: &str) {
        self.rounds.lock().push_back(Err(Error::PeripheralError {
            message: message.to_string(),
        }));
    }

    /// Register a connectable peripheral.
    pub fn add_peripheral(&self, peripheral: Arc<MockPeripheral>) {
        self.peripherals
            .lock()
            .insert(peripheral.address().to_ascii_uppercase(), peripheral);
    }

    /// Delay every connect by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        *self.connect_latency.lock() = latency;
    }

    /// Make every connect fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Number of sub-scans performed.
    pub fn scan_count(&self) -> u32 {
        self.scan_count.load(Ordering::Relaxed)
    }

    /// Number of connect attempts.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    fn peripheral(&self, address: &str) -> Option<Arc<MockPeripheral>> {
        self.peripherals
            .lock()
            .get(&address.to_ascii_uppercase())
            .cloned()
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceIdentity>> {
        self.scan_count.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(duration).await;

        let round = self.rounds.lock().pop_front();
        round.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn find_by_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<DeviceIdentity>> {
        match self.peripheral(address) {
            Some(p) => Ok(Some(p.identity().clone())),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn connect(&self, device: &DeviceIdentity) -> Result<Box<dyn GattLink>> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);

        let latency = *self.connect_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::PeripheralError {
                message: "connection refused".to_string(),
            });
        }

        let peripheral = self
            .peripheral(&device.address)
            .ok_or_else(|| Error::PeripheralError {
                message: format!("no peripheral at {}", device.address),
            })?;
        peripheral.connected.store(true, Ordering::Relaxed);

        Ok(Box::new(MockLink { peripheral }))
    }
}

/// A simulated GATT peripheral.
pub struct MockPeripheral {
    identity: DeviceIdentity,
    services: Vec<ServiceInfo>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    notifications: Mutex<HashMap<Uuid, Vec<(Duration, Vec<u8>)>>>,
    read_failures: Mutex<HashSet<Uuid>>,
    write_failures: Mutex<HashSet<Uuid>>,
    subscribe_failures: Mutex<HashSet<Uuid>>,
    /// When false, writes are acknowledged but not stored.
    reflect_writes: AtomicBool,
    discovery_latency: Mutex<Duration>,
    subscribe_latency: Mutex<Duration>,
    connected: AtomicBool,
    active_subscriptions: Mutex<HashSet<Uuid>>,
}

impl std::fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("address", &self.identity.address)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockPeripheral {
    /// Create a peripheral exposing `services`, with every value empty.
    pub fn new(identity: DeviceIdentity, services: Vec<ServiceInfo>) -> Self {
        Self {
            identity,
            services,
            values: Mutex::new(HashMap::new()),
            notifications: Mutex::new(HashMap::new()),
            read_failures: Mutex::new(HashSet::new()),
            write_failures: Mutex::new(HashSet::new()),
            subscribe_failures: Mutex::new(HashSet::new()),
            reflect_writes: AtomicBool::new(true),
            discovery_latency: Mutex::new(Duration::ZERO),
            subscribe_latency: Mutex::new(Duration::ZERO),
            connected: AtomicBool::new(false),
            active_subscriptions: Mutex::new(HashSet::new()),
        }
    }

    /// A peripheral exposing the default custom service with brightness
    /// "128", volume "50" and pause-volume "0".
    pub fn standard(identity: DeviceIdentity) -> Self {
        let service = ServiceInfo::new(SERVICE_UUID)
            .with_characteristic(BRIGHTNESS_UUID, CharacteristicFlags::READ_NOTIFY)
            .with_characteristic(VOLUME_UUID, CharacteristicFlags::READ)
            .with_characteristic(PAUSE_VOLUME_UUID, CharacteristicFlags::READ_WRITE);

        let peripheral = Self::new(identity, vec![service]);
        peripheral.set_value(BRIGHTNESS_UUID, b"128");
        peripheral.set_value(VOLUME_UUID, b"50");
        peripheral.set_value(PAUSE_VOLUME_UUID, b"0");
        peripheral
    }

    /// The advertised identity.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The advertised address.
    pub fn address(&self) -> &str {
        &self.identity.address
    }

    /// Set a stored characteristic value.
    pub fn set_value(&self, uuid: Uuid, value: &[u8]) {
        self.values.lock().insert(uuid, value.to_vec());
    }

    /// Get a stored characteristic value.
    pub fn value(&self, uuid: &Uuid) -> Option<Vec<u8>> {
        self.values.lock().get(uuid).cloned()
    }

    /// Schedule notifications sent after each subscription, as delays from
    /// the moment of subscribing.
    pub fn set_notifications(&self, uuid: Uuid, schedule: Vec<(Duration, Vec<u8>)>) {
        self.notifications.lock().insert(uuid, schedule);
    }

    /// Make reads of `uuid` fail.
    pub fn fail_reads(&self, uuid: Uuid) {
        self.read_failures.lock().insert(uuid);
    }

    /// Make writes to `uuid` fail.
    pub fn fail_writes(&self, uuid: Uuid) {
        self.write_failures.lock().insert(uuid);
    }

    /// Make subscriptions to `uuid` fail.
    pub fn fail_subscribe(&self, uuid: Uuid) {
        self.subscribe_failures.lock().insert(uuid);
    }

    /// Acknowledge writes without storing them.
    pub fn set_reflect_writes(&self, reflect: bool) {
        self.reflect_writes.store(reflect, Ordering::Relaxed);
    }

    /// Delay service discovery by `latency`.
    pub fn set_discovery_latency(&self, latency: Duration) {
        *self.discovery_latency.lock() = latency;
    }

    /// Delay enabling notifications by `latency`. Scheduled notifications
    /// are timed from the end of the delay.
    pub fn set_subscribe_latency(&self, latency: Duration) {
        *self.subscribe_latency.lock() = latency;
    }

    /// Whether a link is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Whether notifications are enabled for `uuid`.
    pub fn is_subscribed(&self, uuid: &Uuid) -> bool {
        self.active_subscriptions.lock().contains(uuid)
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::Bluetooth(btleplug::Error::NotConnected))
        }
    }

    fn check_failure(set: &Mutex<HashSet<Uuid>>, uuid: &Uuid, operation: &str) -> Result<()> {
        if set.lock().contains(uuid) {
            Err(Error::PeripheralError {
                message: format!("{} rejected for {}", operation, uuid),
            })
        } else {
            Ok(())
        }
    }
}

/// [`GattLink`] onto a [`MockPeripheral`].
struct MockLink {
    peripheral: Arc<MockPeripheral>,
}

#[async_trait]
impl GattLink for MockLink {
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>> {
        self.peripheral.check_connected()?;

        let latency = *self.peripheral.discovery_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(self.peripheral.services.clone())
    }

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>> {
        let p = &self.peripheral;
        p.check_connected()?;
        MockPeripheral::check_failure(&p.read_failures, &characteristic.uuid, "read")?;

        Ok(p.value(&characteristic.uuid).unwrap_or_default())
    }

    async fn write(&self, characteristic: &CharacteristicInfo, data: &[u8]) -> Result<()> {
        let p = &self.peripheral;
        p.check_connected()?;
        MockPeripheral::check_failure(&p.write_failures, &characteristic.uuid, "write")?;

        if p.reflect_writes.load(Ordering::Relaxed) {
            p.set_value(characteristic.uuid, data);
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: &CharacteristicInfo) -> Result<NotificationStream> {
        let p = &self.peripheral;
        p.check_connected()?;
        MockPeripheral::check_failure(&p.subscribe_failures, &characteristic.uuid, "subscribe")?;

        let latency = *p.subscribe_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let uuid = characteristic.uuid;
        let schedule = p.notifications.lock().get(&uuid).cloned().unwrap_or_default();
        p.active_subscriptions.lock().insert(uuid);

        let (tx, rx) = futures::channel::mpsc::unbounded();
        let started = Instant::now();
        let peripheral = self.peripheral.clone();

        tokio::spawn(async move {
            for (delay, value) in schedule {
                tokio::time::sleep_until(started + delay).await;
                if !peripheral.is_subscribed(&uuid) {
                    break;
                }
                if tx.unbounded_send(Notification { sender: uuid, value }).is_err() {
                    break;
                }
            }
        });

        Ok(Box::pin(rx))
    }

    async fn unsubscribe(&self, characteristic: &CharacteristicInfo) -> Result<()> {
        self.peripheral
            .active_subscriptions
            .lock()
            .remove(&characteristic.uuid);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.connected.store(false, Ordering::Relaxed);
        self.peripheral.active_subscriptions.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn test_scan_consumes_rounds_then_returns_empty() {
        let central = MockCentral::new();
        central.push_round(vec![DeviceIdentity::new("AA")]);
        central.push_failed_round("busy");

        assert_eq!(central.scan(Duration::from_millis(10)).await.unwrap().len(), 1);
        assert!(central.scan(Duration::from_millis(10)).await.is_err());
        assert!(central.scan(Duration::from_millis(10)).await.unwrap().is_empty());
        assert_eq!(central.scan_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_reflects_writes() {
        let central = MockCentral::new();
        let peripheral = Arc::new(MockPeripheral::standard(DeviceIdentity::new("AA")));
        central.add_peripheral(peripheral.clone());

        let link = central.connect(&DeviceIdentity::new("aa")).await.unwrap();
        let services = link.discover_services().await.unwrap();
        let pause = services[0].characteristics[&PAUSE_VOLUME_UUID].clone();

        link.write(&pause, b"1").await.unwrap();
        assert_eq!(link.read(&pause).await.unwrap(), b"1");

        link.disconnect().await.unwrap();
        assert!(!peripheral.is_connected());
        assert!(link.read(&pause).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_follow_schedule() {
        let central = MockCentral::new();
        let peripheral = Arc::new(MockPeripheral::standard(DeviceIdentity::new("AA")));
        peripheral.set_notifications(
            BRIGHTNESS_UUID,
            vec![
                (Duration::from_millis(100), b"1".to_vec()),
                (Duration::from_millis(200), b"2".to_vec()),
            ],
        );
        central.add_peripheral(peripheral);

        let link = central.connect(&DeviceIdentity::new("AA")).await.unwrap();
        let services = link.discover_services().await.unwrap();
        let brightness = services[0].characteristics[&BRIGHTNESS_UUID].clone();

        let values: Vec<_> = link
            .subscribe(&brightness)
            .await
            .unwrap()
            .map(|n| n.value)
            .collect()
            .await;
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);
    }
}
