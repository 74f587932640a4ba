//! BLE scanning functionality.
//!
//! Finds the target peripheral by running a sequence of short sub-scans
//! against a [`BleCentral`], so that progress can be logged and the caller
//! can cancel between them.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ble::advertising::{DeviceIdentity, TargetSpec};
use crate::ble::transport::BleCentral;
use crate::error::{Error, Result};

/// Default length of a single sub-scan.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Default timeout of a single address lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Addresses already seen during one scan.
///
/// Only used to avoid logging and matching the same device twice. It never
/// influences whether a device matches.
#[derive(Debug, Default, Clone)]
pub struct DiscoverySet {
    seen: HashSet<String>,
}

impl DiscoverySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address. Returns `true` if it had not been seen before.
    pub fn insert(&mut self, address: &str) -> bool {
        self.seen.insert(address.to_ascii_uppercase())
    }

    /// Check if an address has been seen.
    pub fn contains(&self, address: &str) -> bool {
        self.seen.contains(&address.to_ascii_uppercase())
    }

    /// Number of distinct addresses seen.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if nothing has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Scan timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Length of each sub-scan.
    pub interval: Duration,
    /// Overall deadline. `None` scans until a match or cancellation.
    pub timeout: Option<Duration>,
    /// Timeout of each address lookup in [`DeviceScanner::find_by_address`].
    pub lookup_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SCAN_INTERVAL,
            timeout: None,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

impl ScanOptions {
    /// Set the sub-scan interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Give up after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Scan until a match or cancellation.
    pub fn wait_forever(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set the per-attempt address lookup timeout.
    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }
}

/// Finds the target peripheral using a [`BleCentral`].
pub struct DeviceScanner<'a> {
    central: &'a dyn BleCentral,
    options: ScanOptions,
}

impl<'a> DeviceScanner<'a> {
    /// Create a scanner over `central`.
    pub fn new(central: &'a dyn BleCentral, options: ScanOptions) -> Self {
        Self { central, options }
    }

    /// Get the scan options.
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Scan until a device matching `target` appears.
    ///
    /// The first match wins. Fails with [`Error::ScanTimeout`] once the
    /// configured deadline has passed and with [`Error::ScanCancelled`] when
    /// `cancel` fires.
    pub async fn find(
        &self,
        target: &TargetSpec,
        cancel: &CancellationToken,
    ) -> Result<DeviceIdentity> {
        let mut seen = DiscoverySet::new();
        self.find_with(target, &mut seen, cancel).await
    }

    /// Same as [`find`](Self::find) but records into a caller-owned
    /// [`DiscoverySet`].
    pub async fn find_with(
        &self,
        target: &TargetSpec,
        seen: &mut DiscoverySet,
        cancel: &CancellationToken,
    ) -> Result<DeviceIdentity> {
        info!("Scanning for device with {}", target);

        let started = Instant::now();
        let deadline = self.options.timeout.map(|t| started + t);
        let mut round: u64 = 0;

        loop {
            let window = self.next_window(started, deadline)?;
            let round_started = Instant::now();
            round += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ScanCancelled),
                r = self.central.scan(window) => r,
            };

            match result {
                Ok(devices) => {
                    if let Some(device) = Self::process(devices, target, seen) {
                        info!(
                            "Found target {} after {} sub-scans ({:?})",
                            device.address,
                            round,
                            started.elapsed()
                        );
                        return Ok(device);
                    }
                }
                Err(e) => {
                    warn!("Sub-scan {} failed, retrying: {}", round, e);
                }
            }

            // A sub-scan that returns early (or fails) still consumes its
            // window, so the loop always advances toward the deadline.
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ScanCancelled),
                _ = tokio::time::sleep_until(round_started + window) => {}
            }
        }
    }

    /// Poll the capability's address lookup until the device appears.
    ///
    /// Each attempt is bounded by [`ScanOptions::lookup_timeout`]; the
    /// overall deadline and cancellation apply as in [`find`](Self::find).
    pub async fn find_by_address(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<DeviceIdentity> {
        info!("Looking up device {}", address);

        let started = Instant::now();
        let deadline = self.options.timeout.map(|t| started + t);
        let mut attempt: u64 = 0;

        loop {
            let remaining = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => self.options.lookup_timeout,
            };
            if remaining.is_zero() {
                return Err(Error::ScanTimeout {
                    elapsed: started.elapsed(),
                });
            }
            let window = self.options.lookup_timeout.min(remaining);
            let attempt_started = Instant::now();
            attempt += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ScanCancelled),
                r = self.central.find_by_address(address, window) => r,
            };

            match result {
                Ok(Some(device)) => {
                    info!(
                        "Found {} ({}) after {} lookups",
                        device.address,
                        device.display_name(),
                        attempt
                    );
                    return Ok(device);
                }
                Ok(None) => debug!("Lookup {} for {} found nothing", attempt, address),
                Err(e) => warn!("Lookup {} failed, retrying: {}", attempt, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ScanCancelled),
                _ = tokio::time::sleep_until(attempt_started + window) => {}
            }
        }
    }

    /// Length of the next sub-scan, or a timeout if the deadline has passed.
    fn next_window(&self, started: Instant, deadline: Option<Instant>) -> Result<Duration> {
        match deadline {
            None => Ok(self.options.interval),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::ScanTimeout {
                        elapsed: now - started,
                    });
                }
                Ok(self.options.interval.min(deadline - now))
            }
        }
    }

    /// Dedup, log and match one sub-scan's results.
    fn process(
        devices: Vec<DeviceIdentity>,
        target: &TargetSpec,
        seen: &mut DiscoverySet,
    ) -> Option<DeviceIdentity> {
        for device in devices {
            if !seen.insert(&device.address) {
                continue;
            }

            info!(
                address = %device.address,
                name = device.name.as_deref().unwrap_or("-"),
                rssi = ?device.rssi,
                "Device observed"
            );

            if target.matches(&device) {
                return Some(device);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::MockBleCentral;
    use crate::mock::MockCentral;

    const TARGET: &str = "AA:BB:CC:DD:EE:FF";
    const OTHER: &str = "11:22:33:44:55:66";

    fn options() -> ScanOptions {
        ScanOptions::default().interval(Duration::from_millis(500))
    }

    #[test]
    fn test_discovery_set_is_case_insensitive() {
        let mut set = DiscoverySet::new();
        assert!(set.insert("aa:bb"));
        assert!(!set.insert("AA:BB"));
        assert!(set.contains("Aa:bB"));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_match_in_round_wins() {
        let central = MockCentral::new();
        central.push_round(vec![DeviceIdentity::new(OTHER), DeviceIdentity::new(TARGET)]);
        central.push_round(vec![DeviceIdentity::new(TARGET).with_name("later")]);

        let scanner = DeviceScanner::new(&central, options());
        let device = scanner
            .find(&TargetSpec::address(TARGET), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(device.address, TARGET);
        assert_eq!(device.name, None);
        assert_eq!(central.scan_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_recorded_once() {
        let central = MockCentral::new();
        central.push_round(vec![DeviceIdentity::new(OTHER), DeviceIdentity::new("01:02:03:04:05:06")]);
        central.push_round(vec![DeviceIdentity::new(OTHER)]);
        central.push_round(vec![
            DeviceIdentity::new(OTHER),
            DeviceIdentity::new("01:02:03:04:05:06"),
        ]);

        let scanner = DeviceScanner::new(&central, options().timeout(Duration::from_secs(3)));
        let mut seen = DiscoverySet::new();
        let result = scanner
            .find_with(&TargetSpec::address(TARGET), &mut seen, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::ScanTimeout { .. })));
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(OTHER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_never_early() {
        let central = MockCentral::new();
        let deadline = Duration::from_millis(2_300);
        let scanner = DeviceScanner::new(&central, options().timeout(deadline));

        let started = Instant::now();
        let result = scanner
            .find(&TargetSpec::address(TARGET), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::ScanTimeout { .. })));
        assert!(started.elapsed() >= deadline);
        // 4 full sub-scans plus a shortened final one.
        assert_eq!(central.scan_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manufacturer_match_after_empty_rounds() {
        let central = MockCentral::new();
        central.push_round(vec![]);
        central.push_round(vec![DeviceIdentity::new(OTHER).with_manufacturer_data(0xFFFF, [1u8, 2])]);
        central.push_round(vec![DeviceIdentity::new(TARGET).with_manufacturer_data(0xFFFF, [1u8, 2, 3])]);

        let scanner = DeviceScanner::new(&central, options());
        let device = scanner
            .find(
                &TargetSpec::manufacturer(0xFFFF, vec![1, 2, 3]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(device.address, TARGET);
        assert_eq!(central.scan_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_errors_are_retried() {
        let mut central = MockBleCentral::new();
        let mut calls = 0;
        central.expect_scan().returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(Error::PeripheralError {
                    message: "adapter busy".to_string(),
                })
            } else {
                Ok(vec![DeviceIdentity::new(TARGET)])
            }
        });

        let scanner = DeviceScanner::new(&central, options().timeout(Duration::from_secs(5)));
        let started = Instant::now();
        let device = scanner
            .find(&TargetSpec::address(TARGET), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(device.address, TARGET);
        // Each failed sub-scan still waits out its window.
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_forever_is_cancellable() {
        let central = MockCentral::new();
        let scanner = DeviceScanner::new(&central, options().wait_forever());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });

        let result = scanner.find(&TargetSpec::address(TARGET), &cancel).await;

        assert!(matches!(result, Err(Error::ScanCancelled)));
        assert!(central.scan_count() >= 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_by_address_retries_lookup() {
        let mut central = MockBleCentral::new();
        let mut calls = 0;
        central
            .expect_find_by_address()
            .returning(move |address, timeout| {
                assert_eq!(timeout, Duration::from_secs(2));
                calls += 1;
                Ok((calls == 3).then(|| DeviceIdentity::new(address).with_name("pi")))
            });

        let scanner = DeviceScanner::new(&central, options());
        let started = Instant::now();
        let device = scanner
            .find_by_address(TARGET, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(device.name.as_deref(), Some("pi"));
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_by_address_times_out() {
        let mut central = MockBleCentral::new();
        central.expect_find_by_address().returning(|_, _| Ok(None));

        let scanner = DeviceScanner::new(&central, options().timeout(Duration::from_secs(5)));
        let started = Instant::now();
        let result = scanner
            .find_by_address(TARGET, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::ScanTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
