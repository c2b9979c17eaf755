//! A single microbot's authenticated session: connect, pair, and drive
//! the pusher and its auxiliary characteristics.
//!
//! Owned by [`crate::registry::Registry`], which creates one `Microbot`
//! the first time a UID is sighted and hands out `Arc<Microbot>` from
//! then on. All BLE-issuing methods that install a long-lived
//! reconnection closure take `self: &Arc<Self>` so that closure can hold
//! an owned clone instead of borrowing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use microbot_types::uuid::{
    AUTH, BATTERY_LEVEL, BUTTON_MODE, DEVICE_BLINK, DEVICE_CALIBRATION, EXTEND, FIRMWARE_VERSION,
    LED, MICROBOT_SERVICE, PAIR, PUSH_SERVICE, RETRACT,
};
use microbot_types::{ButtonMode, DeviceUid, FirmwareVersion, PairKey};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::firmware::FirmwareOverlay;
use crate::events::SubscribeHub;
use crate::pairstore::PairKeyStore;
use crate::reader::SubscribingReader;
use crate::reconnect::{ReconnectHook, Reconnector, StableConnection};
use crate::registry::ScanRecord;
use crate::transport::Transport;

/// How long [`Microbot::check_status`] waits for the device's auth
/// reply before synthesizing status `0xFF`.
const AUTH_TIMEOUT: Duration = Duration::from_secs(20);
/// How long one color phase of [`Microbot::pair`] runs before moving to
/// the next, if no reply arrives first.
const PAIR_COLOR_PHASE: Duration = Duration::from_secs(5);
/// How long `connect`/`extend`/`retract` wait for the pusher's observed
/// state to flip after issuing a command.
const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// One microbot's session state, identity, and pairing/connection APIs.
pub struct Microbot {
    uid: DeviceUid,
    scan_record: Arc<ScanRecord>,
    transport: Arc<dyn Transport>,
    pair_store: Arc<dyn PairKeyStore>,
    stable_conn: StdMutex<Option<Arc<StableConnection>>>,
    firmware: StdMutex<Option<Arc<FirmwareOverlay>>>,
    reader: Arc<SubscribingReader>,
    state_change: SubscribeHub<()>,
}

impl Microbot {
    pub(crate) fn new(
        uid: DeviceUid,
        scan_record: Arc<ScanRecord>,
        transport: Arc<dyn Transport>,
        pair_store: Arc<dyn PairKeyStore>,
    ) -> Self {
        Self {
            uid,
            scan_record,
            transport,
            pair_store,
            stable_conn: StdMutex::new(None),
            firmware: StdMutex::new(None),
            reader: Arc::new(SubscribingReader::new()),
            state_change: SubscribeHub::new(),
        }
    }

    /// This microbot's BLE address.
    pub fn uid(&self) -> DeviceUid {
        self.uid
    }

    /// The advertisement-derived identity record shared with the
    /// registry.
    pub fn scan_record(&self) -> &Arc<ScanRecord> {
        &self.scan_record
    }

    /// Monotonic time of the most recent advertisement.
    pub fn last_seen(&self) -> Instant {
        self.scan_record.last_seen()
    }

    /// Whether a pair key is on record for this device.
    pub async fn is_paired(&self) -> Result<bool> {
        self.pair_store.has(self.uid).await
    }

    /// Whether an active session is installed. Does not probe the link.
    pub fn is_connected(&self) -> bool {
        self.stable_conn
            .lock()
            .expect("microbot lock poisoned")
            .as_ref()
            .is_some_and(|c| c.is_active())
    }

    /// Register a callback fired whenever this microbot's
    /// paired/connected/pusher state changes.
    pub fn on_state_change(&self, callback: impl Fn(()) + Send + Sync + 'static) {
        self.state_change.subscribe(callback);
    }

    fn fire_state_change(&self) {
        self.state_change.fire(());
    }

    async fn conn(&self) -> Result<Arc<Connection>> {
        let stable = self
            .stable_conn
            .lock()
            .expect("microbot lock poisoned")
            .clone()
            .ok_or(Error::NotConnected)?;
        stable.get().await
    }

    fn firmware_overlay(&self) -> Result<Arc<FirmwareOverlay>> {
        self.firmware
            .lock()
            .expect("microbot lock poisoned")
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Establish a raw connection, read the firmware version, and run
    /// the authenticated-connect handshake against the on-record pair
    /// key. Does not install a [`StableConnection`]; callers that want
    /// auto-reconnection use [`Microbot::connect`].
    async fn sneaky_connect(&self) -> Result<(Connection, Arc<FirmwareOverlay>)> {
        let key = self
            .pair_store
            .get(self.uid)
            .await?
            .ok_or_else(|| Error::not_paired("no key on record"))?;

        let raw = self
            .transport
            .connect(*self.uid.as_bytes(), Duration::from_secs(10))
            .await?;
        let conn = Connection::new(Arc::clone(&self.transport), raw);

        let version_bytes = conn
            .read(MICROBOT_SERVICE, FIRMWARE_VERSION, Duration::from_secs(5))
            .await?;
        let version = match version_bytes.as_slice() {
            [major, minor, patch] => FirmwareVersion::new(*major, *minor, *patch),
            _ => FirmwareVersion::V010,
        };
        let overlay = Arc::new(FirmwareOverlay::select(version));

        let status = self.check_status(&conn, Some(&key)).await?;
        if status != 0x01 {
            conn.close().await?;
            if status == 0x03 {
                self.pair_store.delete(self.uid).await?;
                self.fire_state_change();
            }
            return Err(Error::not_paired_code(status, "authentication failed"));
        }

        Ok((conn, overlay))
    }

    /// Run the authenticated-connect status handshake and return the
    /// device's reported status byte. `pair_key` is `None` only during
    /// the pairing procedure itself, before a key exists.
    async fn check_status(&self, conn: &Connection, pair_key: Option<&PairKey>) -> Result<u8> {
        let _guard = self.transport.transaction().await;

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let handle = conn
            .on_notify(MICROBOT_SERVICE, AUTH, move |data: &[u8]| {
                let _ = tx.send(data.to_vec());
            })
            .await?;

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let mut payload = Vec::with_capacity(20);
        payload.extend_from_slice(&timestamp.to_le_bytes());
        match pair_key {
            Some(key) => payload.extend_from_slice(key.as_bytes()),
            None => payload.extend_from_slice(&[0u8; 16]),
        }

        conn.write(MICROBOT_SERVICE, AUTH, &payload).await?;

        let status = match timeout(AUTH_TIMEOUT, rx.recv()).await {
            Ok(Some(data)) => data.first().copied().unwrap_or(0xFF),
            _ => {
                warn!(uid = %self.uid, "auth handshake timed out, treating as failure");
                0xFF
            }
        };

        handle.cancel();
        Ok(status)
    }

    /// Authenticate and install an auto-reconnecting session. Fails if
    /// already connected or if no pair key is on record.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            return Err(Error::wrong_state("already connected"));
        }

        let (conn, overlay) = self.sneaky_connect().await?;
        *self.firmware.lock().expect("microbot lock poisoned") = Some(overlay);

        let stable = StableConnection::new(conn, self.reconnector(), self.reconnect_hook());
        *self.stable_conn.lock().expect("microbot lock poisoned") = Some(Arc::new(stable));
        info!(uid = %self.uid, "microbot connected");
        self.fire_state_change();
        Ok(())
    }

    fn reconnector(self: &Arc<Self>) -> Reconnector {
        let this = Arc::clone(self);
        Box::new(move || {
            let this = Arc::clone(&this);
            Box::pin(async move {
                let (conn, overlay) = this.sneaky_connect().await?;
                *this.firmware.lock().expect("microbot lock poisoned") = Some(overlay);
                Ok(conn)
            })
        })
    }

    fn reconnect_hook(self: &Arc<Self>) -> ReconnectHook {
        let reader = Arc::clone(&self.reader);
        Box::new(move |conn| {
            let reader = Arc::clone(&reader);
            Box::pin(async move { reader.resubscribe(&conn).await })
        })
    }

    /// Tear down the session. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let stable = self
            .stable_conn
            .lock()
            .expect("microbot lock poisoned")
            .take();
        self.reader.clear();
        if let Some(stable) = stable {
            stable.close().await?;
        }
        info!(uid = %self.uid, "microbot disconnected");
        self.fire_state_change();
        Ok(())
    }

    /// Run the pairing handshake. `on_color` is invoked once per LED
    /// phase so a caller can mirror the flashing pattern to a user, and
    /// fails if already connected.
    pub async fn pair(
        self: &Arc<Self>,
        on_color: impl Fn(bool, bool, bool) + Send + Sync,
    ) -> Result<()> {
        if self.is_connected() {
            return Err(Error::wrong_state("already connected"));
        }

        let raw = self
            .transport
            .connect(*self.uid.as_bytes(), Duration::from_secs(10))
            .await?;
        let conn = Connection::new(Arc::clone(&self.transport), raw);

        let status = self.check_status(&conn, None).await?;
        if status != 0x02 {
            conn.close().await?;
            return Err(Error::not_paired_code(status, "device did not request pairing"));
        }

        let _guard = self.transport.transaction().await;

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let handle = conn
            .on_notify(MICROBOT_SERVICE, PAIR, move |data: &[u8]| {
                let _ = tx.send(data.to_vec());
            })
            .await?;

        let host_uid_hex = crate::util::hex_encode(&self.transport.local_address().await?);
        let mut handshake = vec![host_uid_hex.len() as u8];
        handshake.extend_from_slice(host_uid_hex.as_bytes());
        let (first, rest) = handshake.split_at(handshake.len().min(20));
        conn.write(MICROBOT_SERVICE, PAIR, first).await?;
        if !rest.is_empty() {
            let mut second = vec![0x00];
            second.extend_from_slice(rest);
            conn.write(MICROBOT_SERVICE, PAIR, &second).await?;
        }

        let colors = [(true, false, true), (true, true, false)];
        let mut reply = None;
        'phases: for &(r, g, b) in &colors {
            let deadline = Instant::now() + PAIR_COLOR_PHASE;
            self.sneaky_led(&conn, r, g, b, PAIR_COLOR_PHASE.as_secs() as u8).await?;
            on_color(r, g, b);
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, rx.recv()).await {
                    Ok(Some(data)) => {
                        reply = Some(data);
                        break 'phases;
                    }
                    _ => break,
                }
            }
        }

        handle.cancel();

        let reply = match reply {
            Some(data) => data,
            None => {
                conn.close().await?;
                return Err(Error::StateChangeError(PAIR_COLOR_PHASE * colors.len() as u32));
            }
        };

        let reply_status = reply.first().copied().unwrap_or(0x04);
        if reply_status != 0x01 {
            conn.close().await?;
            return Err(Error::not_paired_code(reply_status, "pairing refused"));
        }

        let key_bytes = &reply[1..];
        if key_bytes.len() < 16 {
            conn.close().await?;
            return Err(Error::not_paired("pairing reply too short to carry a key"));
        }
        let key = PairKey::from_slice(&key_bytes[..16])
            .map_err(|err| Error::not_paired(err.to_string()))?;
        self.pair_store.set(self.uid, key).await?;

        let version_bytes = conn
            .read(MICROBOT_SERVICE, FIRMWARE_VERSION, Duration::from_secs(5))
            .await?;
        let version = match version_bytes.as_slice() {
            [major, minor, patch] => FirmwareVersion::new(*major, *minor, *patch),
            _ => FirmwareVersion::V010,
        };
        *self.firmware.lock().expect("microbot lock poisoned") =
            Some(Arc::new(FirmwareOverlay::select(version)));

        let stable = StableConnection::new(conn, self.reconnector(), self.reconnect_hook());
        *self.stable_conn.lock().expect("microbot lock poisoned") = Some(Arc::new(stable));
        info!(uid = %self.uid, "microbot paired");
        self.fire_state_change();
        Ok(())
    }

    async fn sneaky_led(&self, conn: &Connection, r: bool, g: bool, b: bool, duration_secs: u8) -> Result<()> {
        let bits = (r as u8) | ((g as u8) << 1) | ((b as u8) << 2);
        conn.write(MICROBOT_SERVICE, LED, &[0x01, bits, 0x00, 0x00, 0x00, duration_secs])
            .await
    }

    /// Flash the status LED in `color` for `duration_secs`.
    pub async fn led(&self, r: bool, g: bool, b: bool, duration_secs: u8) -> Result<()> {
        let conn = self.conn().await?;
        self.sneaky_led(&conn, r, g, b, duration_secs).await
    }

    /// Blink the status LED for `duration_secs`.
    pub async fn device_blink(&self, duration_secs: u8) -> Result<()> {
        let conn = self.conn().await?;
        conn.write(MICROBOT_SERVICE, DEVICE_BLINK, &[duration_secs]).await
    }

    /// Battery level as a fraction in `[0.0, 1.0]`.
    pub async fn battery_level(&self) -> Result<f32> {
        let conn = self.conn().await?;
        let value = self.reader.read(&conn, MICROBOT_SERVICE, BATTERY_LEVEL).await?;
        let raw = value.first().copied().unwrap_or(0);
        Ok(raw as f32 / 100.0)
    }

    /// Whether the pusher is currently retracted, `None` if not yet
    /// known.
    pub async fn is_retracted(&self) -> Result<Option<bool>> {
        let conn = self.conn().await?;
        self.firmware_overlay()?.is_retracted(&conn, &self.reader).await
    }

    /// Extend the pusher arm, short-circuiting if already extended and
    /// failing with [`Error::IoError`] if the device never reports the
    /// state flip.
    pub async fn extend(&self) -> Result<()> {
        self.actuate(EXTEND, false).await
    }

    /// Retract the pusher arm, short-circuiting if already retracted and
    /// failing with [`Error::IoError`] if the device never reports the
    /// state flip.
    pub async fn retract(&self) -> Result<()> {
        self.actuate(RETRACT, true).await
    }

    async fn actuate(&self, characteristic: uuid::Uuid, want_retracted: bool) -> Result<()> {
        let conn = self.conn().await?;
        let overlay = self.firmware_overlay()?;

        if overlay.is_retracted(&conn, &self.reader).await? == Some(want_retracted) {
            debug!(uid = %self.uid, want_retracted, "pusher already in requested state");
            return Ok(());
        }

        let write = conn.write(PUSH_SERVICE, characteristic, &[0x01]);
        let wait = overlay.wait_for_pusher_state_change(&conn, STATE_CHANGE_TIMEOUT);
        let (write_result, wait_result) = tokio::join!(write, wait);
        write_result?;
        match wait_result {
            Ok(()) => {}
            Err(Error::StateChangeError(_)) => {
                return Err(Error::IoError(format!(
                    "sending {} command did not affect state of the device",
                    if want_retracted { "retract" } else { "extend" }
                )));
            }
            Err(err) => return Err(err),
        }

        if overlay.is_retracted(&conn, &self.reader).await? != Some(want_retracted) {
            return Err(Error::IoError(format!(
                "device did not reach the {} state",
                if want_retracted { "retracted" } else { "extended" }
            )));
        }
        Ok(())
    }

    /// Set the calibration percentage, clamped to the device's
    /// supported `16..=100` range.
    pub async fn calibrate(&self, percent: u8) -> Result<()> {
        let conn = self.conn().await?;
        let clamped = percent.clamp(16, 100);
        conn.write(PUSH_SERVICE, DEVICE_CALIBRATION, &[clamped]).await?;
        self.reader.set_cache(PUSH_SERVICE, DEVICE_CALIBRATION, vec![clamped]);
        Ok(())
    }

    /// The current calibration percentage.
    pub async fn get_calibration(&self) -> Result<u8> {
        let conn = self.conn().await?;
        let value = self.reader.read(&conn, PUSH_SERVICE, DEVICE_CALIBRATION).await?;
        Ok(value.first().copied().unwrap_or(0))
    }

    /// Flip whether the physical button's press extends or retracts by
    /// default.
    pub async fn set_button_mode(&self, mode: ButtonMode) -> Result<()> {
        let conn = self.conn().await?;
        let byte = mode.to_byte();
        conn.write(PUSH_SERVICE, BUTTON_MODE, &[byte]).await?;
        self.reader.set_cache(PUSH_SERVICE, BUTTON_MODE, vec![byte]);
        Ok(())
    }

    /// The physical button's current mode.
    pub async fn button_mode(&self) -> Result<ButtonMode> {
        let conn = self.conn().await?;
        let value = self.reader.read(&conn, PUSH_SERVICE, BUTTON_MODE).await?;
        let byte = value.first().copied().unwrap_or(0);
        ButtonMode::from_byte(byte).map_err(|err| Error::IoError(err.to_string()))
    }

    /// Every readable characteristic across every discovered service, as
    /// a debugging aid.
    pub async fn full_state(&self) -> Result<std::collections::HashMap<uuid::Uuid, std::collections::HashMap<uuid::Uuid, Vec<u8>>>> {
        let conn = self.conn().await?;
        conn.read_all_characteristics().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRawConnection, MockTransport};
    use crate::pairstore::InMemoryPairKeyStore;
    use crate::registry::{Registry, DEFAULT_STALE_AFTER};

    #[tokio::test]
    async fn connect_fails_without_an_on_record_pair_key() {
        let uid = DeviceUid::from_bytes([1, 2, 3, 4, 5, 6]);
        let transport = Arc::new(MockTransport::new([0; 6]));
        let pair_store = Arc::new(InMemoryPairKeyStore::new());
        let registry = Registry::new(transport, pair_store, DEFAULT_STALE_AFTER);
        let mb = registry.on_sighting(crate::registry::Sighting { uid, name: None });

        let err = mb.connect().await.unwrap_err();
        assert!(matches!(err, Error::NotPaired { code: None, .. }));
    }

    #[tokio::test]
    async fn connect_authenticates_against_a_stored_key_and_installs_a_session() {
        let uid = DeviceUid::from_bytes([1, 2, 3, 4, 5, 6]);
        let transport = Arc::new(MockTransport::new([0; 6]));
        let pair_store = Arc::new(InMemoryPairKeyStore::new());
        let key = PairKey::from_slice(&[7u8; 16]).unwrap();
        pair_store.seed(uid, key);

        let raw = MockRawConnection::new();
        raw.set_characteristic(MICROBOT_SERVICE, FIRMWARE_VERSION, true, false, false);
        raw.set_read_value(FIRMWARE_VERSION, vec![1, 0, 5]);
        raw.set_characteristic(MICROBOT_SERVICE, AUTH, false, true, true);
        raw.set_characteristic(PUSH_SERVICE, microbot_types::uuid::DEVICE_STATUS, true, false, true);
        transport.register_device(*uid.as_bytes(), raw.clone_handle());

        let registry = Registry::new(Arc::clone(&transport) as Arc<dyn Transport>, pair_store, DEFAULT_STALE_AFTER);
        let mb = registry.on_sighting(crate::registry::Sighting { uid, name: None });

        let connect = tokio::spawn({
            let mb = Arc::clone(&mb);
            async move { mb.connect().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        raw.fire_notification(AUTH, vec![0x01]);

        connect.await.unwrap().unwrap();
        assert!(mb.is_connected());
    }

    #[tokio::test]
    async fn sneaky_connect_deletes_the_key_on_status_key_mismatch() {
        let uid = DeviceUid::from_bytes([9, 9, 9, 9, 9, 9]);
        let transport = Arc::new(MockTransport::new([0; 6]));

        let raw = MockRawConnection::new();
        raw.set_characteristic(MICROBOT_SERVICE, FIRMWARE_VERSION, true, false, false);
        raw.set_read_value(FIRMWARE_VERSION, vec![1, 0, 5]);
        raw.set_characteristic(MICROBOT_SERVICE, AUTH, false, true, true);
        transport.register_device(*uid.as_bytes(), raw.clone_handle());

        let pair_store_for_registry = Arc::new(InMemoryPairKeyStore::new());
        pair_store_for_registry.seed(uid, PairKey::from_slice(&[1u8; 16]).unwrap());
        let registry = Registry::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&pair_store_for_registry) as Arc<dyn PairKeyStore>,
            DEFAULT_STALE_AFTER,
        );
        let mb = registry.on_sighting(crate::registry::Sighting { uid, name: None });

        let connect = tokio::spawn({
            let mb = Arc::clone(&mb);
            async move { mb.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        raw.fire_notification(AUTH, vec![0x03]);

        let err = connect.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NotPaired { code: Some(0x03), .. }));
        assert!(!pair_store_for_registry.has(uid).await.unwrap());
    }
}
