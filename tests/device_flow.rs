mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use semver::Version;

use common::{SimulatedConnector, SimulatedDevice};
use htr_ledger::apdu::{Instruction, StatusWord};
use htr_ledger::payload::{tx_payload, ChangeOutput, PublicKeyData, TokenInfo};
use htr_ledger::{DeviceEvent, DeviceSession, LedgerConfig, LedgerError, SessionNotification};

fn session(device: &Arc<SimulatedDevice>, config: LedgerConfig) -> Arc<DeviceSession> {
    DeviceSession::new(Arc::new(SimulatedConnector(device.clone())), config)
}

fn token(uid_byte: u8, symbol: &str) -> TokenInfo {
    TokenInfo {
        uid: hex::encode([uid_byte; 32]),
        symbol: symbol.to_string(),
        name: format!("{} token", symbol),
        signature: None,
    }
}

#[tokio::test]
async fn signs_a_transaction_end_to_end() {
    let device = SimulatedDevice::new();
    let session = session(&device, LedgerConfig::default());

    assert_eq!(session.app_version().await.unwrap(), Version::new(1, 2, 3));
    assert!(session.is_app_open());

    let response = session.get_public_key_data().await.unwrap();
    let key = PublicKeyData::parse(&response).unwrap();
    assert_eq!(key.fingerprint, [97, 98, 99, 100]);

    let change = ChangeOutput {
        output_index: 1,
        key_index: 4,
    };
    session
        .send_tx(&tx_payload(Some(change), &[0x55; 600]))
        .await
        .unwrap();
    let signatures = session.get_signatures(&[0, 2]).await.unwrap();
    assert_eq!(signatures, vec![vec![0x30, 0x44, 0], vec![0x30, 0x44, 2]]);

    let send_tx = Instruction::SendTx as u8;
    let tx_commands: Vec<_> = device
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.ins == send_tx)
        .map(|c| (c.p1, c.p2))
        .collect();
    // 622 payload bytes: three chunks, two rounds, one finalize
    assert_eq!(tx_commands, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 0), (2, 0)]);
}

#[tokio::test]
async fn signing_without_data_still_ends_the_session() {
    let device = SimulatedDevice::new();
    let session = session(&device, LedgerConfig::default());

    let err = session.get_signatures(&[0, 1]).await.unwrap_err();
    match err {
        LedgerError::Communication { code, status } => {
            assert_eq!(code, 0xb007);
            assert_eq!(status, Some(StatusWord::BadState));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let log = device.log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!((log[1].p1, log[1].p2), (2, 0));
}

#[tokio::test]
async fn other_foreground_app_is_rejected() {
    let device = SimulatedDevice::new();
    device.switch_to_other_app(true);
    let session = session(&device, LedgerConfig::default());

    let err = session.get_version().await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidApp { .. }));
    assert!(!session.is_app_open());
}

#[tokio::test]
async fn token_signatures_round_trip_through_the_device() {
    let device = SimulatedDevice::new();
    let session = session(&device, LedgerConfig::default());

    let mut good = token(0x11, "AAA");
    let signature = session
        .sign_token(&good.to_sign_payload().unwrap())
        .await
        .unwrap();
    good.signature = Some(hex::encode(signature));

    let mut forged = token(0x22, "BBB");
    forged.signature = Some(hex::encode([0u8; 32]));

    let descriptors = vec![
        good.to_signed_payload().unwrap(),
        forged.to_signed_payload().unwrap(),
    ];
    let failures = session.verify_token_signatures(&descriptors).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].index, 1);
    assert_eq!(failures[0].status, Some(0xb00a));
    assert_eq!(failures[0].descriptor, descriptors[1]);

    let failures = session.send_tokens(&descriptors[..1]).await.unwrap();
    assert!(failures.is_empty());

    session.reset_token_signatures().await.unwrap();
    assert_eq!(
        device.instructions().last(),
        Some(&(Instruction::ResetTokenSignatures as u8))
    );
}

#[tokio::test]
async fn concurrent_callers_never_overlap_on_the_device() {
    let device = SimulatedDevice::new();
    let session = session(&device, LedgerConfig::default());

    let calls = (0..10u32).map(|index| {
        let session = session.clone();
        async move { session.check_address(index).await }
    });
    let results = join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(device.log.lock().unwrap().len(), 10);
    assert_eq!(device.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(session.queue().metrics().dispatched, 10);
}

#[tokio::test(start_paused = true)]
async fn hotplug_events_open_and_lock_the_app() {
    let device = SimulatedDevice::new();
    let config = LedgerConfig {
        lock_grace_period_ms: 500,
        ..LedgerConfig::default()
    };
    let session = session(&device, config);
    let mut notifications = session.subscribe();

    session.handle_event(DeviceEvent::Attached).await;
    assert_eq!(notifications.recv().await.unwrap(), SessionNotification::AppOpened);

    session.handle_event(DeviceEvent::Removed).await;
    assert!(!session.is_connected());
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(notifications.try_recv().is_err());

    assert_eq!(notifications.recv().await.unwrap(), SessionNotification::DeviceLocked);
}
