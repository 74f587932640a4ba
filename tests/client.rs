//! End-to-end runs against the in-memory capability.

use std::sync::Arc;
use std::time::Duration;

use ble_gatt_client::ble::uuids::*;
use ble_gatt_client::mock::{MockCentral, MockPeripheral};
use ble_gatt_client::{
    CharacteristicError, ClientConfig, DeviceIdentity, Error, GattClient, Outcome, TargetSpec,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "AA:BB:CC:DD:EE:FF";
const OTHER: &str = "11:22:33:44:55:66";

fn target_peripheral() -> Arc<MockPeripheral> {
    let peripheral = MockPeripheral::standard(
        DeviceIdentity::new(TARGET)
            .with_name("pi")
            .with_manufacturer_data(DEFAULT_MANUFACTURER_ID, DEFAULT_MANUFACTURER_PAYLOAD),
    );
    peripheral.set_notifications(
        BRIGHTNESS_UUID,
        vec![
            (Duration::from_millis(500), b"100".to_vec()),
            (Duration::from_millis(1500), b"110".to_vec()),
            (Duration::from_millis(2900), b"120".to_vec()),
            (Duration::from_millis(3100), b"130".to_vec()),
        ],
    );
    Arc::new(peripheral)
}

#[tokio::test(start_paused = true)]
async fn test_address_scan_end_to_end() {
    let central = MockCentral::new();
    let peripheral = target_peripheral();
    central.add_peripheral(peripheral.clone());
    central.push_round(vec![
        DeviceIdentity::new(OTHER),
        peripheral.identity().clone(),
    ]);

    let config = ClientConfig::default()
        .with_target(TargetSpec::address("aa:bb:cc:dd:ee:ff"))
        .with_scan_timeout(Some(Duration::from_secs(10)));
    let client = GattClient::new(central, config);

    let report = client.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(client.central().scan_count(), 1);
    assert_eq!(report.device.address, TARGET);
    assert_eq!(report.service, SERVICE_UUID);

    let order: Vec<_> = report.characteristics.iter().map(|c| c.uuid).collect();
    assert_eq!(order, vec![BRIGHTNESS_UUID, VOLUME_UUID, PAUSE_VOLUME_UUID]);

    match &report.get(&BRIGHTNESS_UUID).unwrap().outcome {
        Ok(Outcome::Notifications(received)) => {
            let values: Vec<_> = received
                .iter()
                .map(|r| String::from_utf8_lossy(&r.notification.value).into_owned())
                .collect();
            assert_eq!(values, vec!["100", "110", "120"]);
        }
        other => panic!("unexpected brightness outcome: {:?}", other),
    }
    assert_eq!(
        report.get(&VOLUME_UUID).unwrap().outcome,
        Ok(Outcome::Read {
            value: "50".to_string()
        })
    );
    assert_eq!(
        report.get(&PAUSE_VOLUME_UUID).unwrap().outcome,
        Ok(Outcome::VerifiedWrite {
            before: "0".to_string(),
            after: "1".to_string(),
        })
    );

    assert!(!peripheral.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_manufacturer_scan_rejects_lookalikes() {
    let central = MockCentral::new();
    let peripheral = target_peripheral();
    central.add_peripheral(peripheral.clone());

    let mut truncated = DEFAULT_MANUFACTURER_PAYLOAD.to_vec();
    truncated.pop();
    central.push_round(vec![
        DeviceIdentity::new(OTHER).with_manufacturer_data(DEFAULT_MANUFACTURER_ID, truncated),
        DeviceIdentity::new("22:33:44:55:66:77"),
    ]);
    central.push_round(vec![peripheral.identity().clone()]);

    let config = ClientConfig::default();
    let target = config.manufacturer_target();
    let client = GattClient::new(central, config.with_target(target));

    let report = client.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.device.address, TARGET);
    assert_eq!(client.central().scan_count(), 2);
    assert_eq!(client.central().connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_characteristic_failures_still_complete() {
    let central = MockCentral::new();
    let peripheral = target_peripheral();
    peripheral.fail_reads(VOLUME_UUID);
    central.add_peripheral(peripheral.clone());
    central.push_round(vec![peripheral.identity().clone()]);

    let client = GattClient::new(
        central,
        ClientConfig::default().with_target(TargetSpec::address(TARGET)),
    );
    let report = client.run(&CancellationToken::new()).await.unwrap();

    let failures: Vec<_> = report.failures().map(|c| c.uuid).collect();
    assert_eq!(failures, vec![VOLUME_UUID]);
    assert!(matches!(
        report.get(&VOLUME_UUID).unwrap().outcome,
        Err(CharacteristicError::Read(_))
    ));
    assert!(report.get(&PAUSE_VOLUME_UUID).unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_scan_timeout_never_connects() {
    let central = MockCentral::new();
    central.add_peripheral(target_peripheral());
    central.push_round(vec![DeviceIdentity::new(OTHER)]);

    let config = ClientConfig::default()
        .with_target(TargetSpec::address(TARGET))
        .with_scan_timeout(Some(Duration::from_secs(2)));
    let client = GattClient::new(central, config);

    let result = client.run(&CancellationToken::new()).await;

    match result {
        Err(Error::ScanTimeout { elapsed }) => assert!(elapsed >= Duration::from_secs(2)),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(client.central().connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start() {
    let central = MockCentral::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let client = GattClient::new(central, ClientConfig::default());
    let result = client.run(&cancel).await;

    assert!(matches!(result, Err(Error::ScanCancelled)));
}
