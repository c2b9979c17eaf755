//! End-to-end tests driving the session engine through [`MockTransport`]:
//! discovery from a scan advertisement, the authenticated connect
//! handshake, pusher actuation, and the action scheduler's dispatch loop.
//! None of this requires real BLE hardware.

use std::sync::Arc;
use std::time::{Duration, Instant};

use microbot_core::action_store::InMemoryActionStore;
use microbot_core::error::Error;
use microbot_core::hub::Hub;
use microbot_core::mock::{MockRawConnection, MockTransport};
use microbot_core::pairstore::InMemoryPairKeyStore;
use microbot_core::scheduler::ActionScheduler;
use microbot_core::transport::{AdvertisementSegment, ScanEvent, Transport};
use microbot_types::uuid::{AUTH, FIRMWARE_VERSION, MICROBOT_SERVICE};
use microbot_types::{ActionKind, DeviceUid, PairKey};

const LOCAL_ADDRESS: [u8; 6] = [0, 0, 0, 0, 0, 0];

fn mibp_advertisement(address: [u8; 6]) -> ScanEvent {
    ScanEvent {
        sender_address: address,
        payload_segments: vec![(AdvertisementSegment::CompleteLocalName, b"mibp".to_vec())],
        observed_at: Instant::now(),
    }
}

fn paired_microbot(uid: DeviceUid) -> (Arc<MockTransport>, MockRawConnection) {
    let transport = Arc::new(MockTransport::new(LOCAL_ADDRESS));

    let raw = MockRawConnection::new();
    raw.set_characteristic(MICROBOT_SERVICE, FIRMWARE_VERSION, true, false, false);
    raw.set_read_value(FIRMWARE_VERSION, vec![1, 5, 0]);
    raw.set_characteristic(MICROBOT_SERVICE, AUTH, false, true, true);
    raw.set_characteristic(
        microbot_types::uuid::PUSH_SERVICE,
        microbot_types::uuid::DEVICE_STATUS,
        true,
        false,
        true,
    );
    raw.set_read_value(microbot_types::uuid::DEVICE_STATUS, vec![0x00, 0x00]);
    raw.set_characteristic(
        microbot_types::uuid::PUSH_SERVICE,
        microbot_types::uuid::EXTEND,
        false,
        true,
        false,
    );
    raw.set_characteristic(
        microbot_types::uuid::PUSH_SERVICE,
        microbot_types::uuid::RETRACT,
        false,
        true,
        false,
    );
    transport.register_device(*uid.as_bytes(), raw.clone_handle());
    (transport, raw)
}

/// Discovering a microbot via the scan stream makes it visible through
/// [`Hub::get_microbot`] and [`Hub::all_microbots`].
#[tokio::test]
async fn hub_discovers_a_microbot_from_a_scan_advertisement() {
    let uid = DeviceUid::from_bytes([1, 2, 3, 4, 5, 6]);
    let transport = Arc::new(MockTransport::new(LOCAL_ADDRESS));
    let pair_store = Arc::new(InMemoryPairKeyStore::new());
    let hub = Arc::new(Hub::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        pair_store,
        Duration::from_secs(300),
    ));

    hub.start().await.expect("hub should start against a mock transport");
    transport.push_scan_event(mibp_advertisement(*uid.as_bytes()));

    let found = hub
        .get_microbot(&uid.to_canonical_string(), Duration::from_secs(2))
        .await
        .expect("scan advertisement should surface the microbot");
    assert_eq!(found.uid(), uid);
    assert_eq!(hub.all_microbots().len(), 1);
}

/// A microbot with a stored pair key authenticates, connects, and can
/// extend/retract its pusher, with `is_retracted` reflecting the
/// DeviceStatus byte throughout.
#[tokio::test]
async fn connected_microbot_extends_and_retracts() {
    let uid = DeviceUid::from_bytes([2, 2, 2, 2, 2, 2]);
    let key = PairKey::from_slice(&[5u8; 16]).unwrap();
    let (transport, raw) = paired_microbot(uid);
    let pair_store = Arc::new(InMemoryPairKeyStore::new());
    pair_store.seed(uid, key);

    let hub = Arc::new(Hub::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&pair_store) as Arc<dyn microbot_core::pairstore::PairKeyStore>,
        Duration::from_secs(300),
    ));
    hub.start().await.unwrap();
    transport.push_scan_event(mibp_advertisement(*uid.as_bytes()));
    let mb = hub
        .get_microbot(&uid.to_canonical_string(), Duration::from_secs(2))
        .await
        .unwrap();

    let connect = tokio::spawn({
        let mb = Arc::clone(&mb);
        async move { mb.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.fire_notification(AUTH, vec![0x01]);
    connect.await.unwrap().expect("authenticated connect should succeed");
    assert!(mb.is_connected());
    assert_eq!(mb.is_retracted().await.unwrap(), Some(true));

    let extend = tokio::spawn({
        let mb = Arc::clone(&mb);
        async move { mb.extend().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.set_read_value(microbot_types::uuid::DEVICE_STATUS, vec![0x00, 0x01]);
    raw.fire_notification(microbot_types::uuid::DEVICE_STATUS, vec![0x00, 0x01]);
    extend.await.unwrap().expect("extend should observe the status flip");
    assert_eq!(mb.is_retracted().await.unwrap(), Some(false));
}

/// Queuing an extend action for an as-yet-undiscovered microbot leaves
/// it retried rather than dropped, and once the microbot is discovered,
/// authenticated, and connected, a dispatch step drains the action.
#[tokio::test]
async fn scheduler_retries_until_microbot_is_connected_then_dispatches() {
    let uid = DeviceUid::from_bytes([3, 3, 3, 3, 3, 3]);
    let key = PairKey::from_slice(&[9u8; 16]).unwrap();
    let (transport, raw) = paired_microbot(uid);
    let pair_store = Arc::new(InMemoryPairKeyStore::new());
    pair_store.seed(uid, key);

    let hub = Arc::new(Hub::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&pair_store) as Arc<dyn microbot_core::pairstore::PairKeyStore>,
        Duration::from_secs(300),
    ));
    let store = Arc::new(InMemoryActionStore::new());
    let action_id = store.enqueue(microbot_types::Action {
        id: 0,
        microbot_uid: uid,
        kind: ActionKind::Extend,
        args: serde_json::json!({}),
        retries_left: 15,
        scheduled_at: time::OffsetDateTime::UNIX_EPOCH,
        prev_action_id: None,
        prev_action_delay_seconds: 0.0,
    });

    let scheduler = ActionScheduler::new(
        Arc::clone(&store) as Arc<dyn microbot_core::action_store::ActionStore>,
        Arc::clone(&hub),
    );
    scheduler.spawn();

    // Undiscovered microbot: the dispatch loop should back off rather
    // than drop the action.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.get(action_id).is_some(), "action should survive a retry, not be dropped");

    hub.start().await.unwrap();
    transport.push_scan_event(mibp_advertisement(*uid.as_bytes()));
    let mb = hub
        .get_microbot(&uid.to_canonical_string(), Duration::from_secs(2))
        .await
        .unwrap();

    let connect = tokio::spawn({
        let mb = Arc::clone(&mb);
        async move { mb.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.fire_notification(AUTH, vec![0x01]);
    connect.await.unwrap().unwrap();

    // Force the action due now and wake the dispatch loop immediately,
    // then flip DeviceStatus as the extend call waits on it.
    store
        .reschedule(action_id, time::OffsetDateTime::now_utc() - time::Duration::seconds(1))
        .await
        .unwrap();
    scheduler.notify_new_action();
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.set_read_value(microbot_types::uuid::DEVICE_STATUS, vec![0x00, 0x01]);
    raw.fire_notification(microbot_types::uuid::DEVICE_STATUS, vec![0x00, 0x01]);

    for _ in 0..20 {
        if store.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(store.is_empty(), "completed action should be removed from the queue");
    assert_eq!(mb.is_retracted().await.unwrap(), Some(false));
}

/// Unknown remote errors surface through `Microbot::extend` rather than
/// being silently swallowed.
#[tokio::test]
async fn remote_error_on_write_propagates() {
    let uid = DeviceUid::from_bytes([4, 4, 4, 4, 4, 4]);
    let key = PairKey::from_slice(&[1u8; 16]).unwrap();
    let (transport, raw) = paired_microbot(uid);
    let pair_store = Arc::new(InMemoryPairKeyStore::new());
    pair_store.seed(uid, key);

    let hub = Arc::new(Hub::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&pair_store) as Arc<dyn microbot_core::pairstore::PairKeyStore>,
        Duration::from_secs(300),
    ));
    hub.start().await.unwrap();
    transport.push_scan_event(mibp_advertisement(*uid.as_bytes()));
    let mb = hub
        .get_microbot(&uid.to_canonical_string(), Duration::from_secs(2))
        .await
        .unwrap();

    let connect = tokio::spawn({
        let mb = Arc::clone(&mb);
        async move { mb.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.fire_notification(AUTH, vec![0x01]);
    connect.await.unwrap().unwrap();

    raw.fail_next(microbot_types::uuid::EXTEND, 0x05, 1);
    let extend = tokio::spawn({
        let mb = Arc::clone(&mb);
        async move { mb.extend().await }
    });
    // The write fails immediately, but `actuate` still waits on the
    // DeviceStatus notification alongside it; fire one so the call
    // resolves promptly instead of riding out its full timeout.
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.fire_notification(microbot_types::uuid::DEVICE_STATUS, vec![0x00, 0x01]);

    let err = extend.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::RemoteError(0x05)));
}
