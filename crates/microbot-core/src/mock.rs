//! Deterministic in-memory [`Transport`]/[`RawConnection`] implementations
//! for testing the session engine without real BLE hardware.
//!
//! # Example
//!
//! ```
//! use microbot_core::mock::MockRawConnection;
//! use microbot_types::uuid::{EXTEND, PUSH_SERVICE};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let raw = MockRawConnection::new();
//! raw.set_characteristic(PUSH_SERVICE, EXTEND, true, true, false);
//! raw.write_by_uuid(EXTEND, &[0x01], std::time::Duration::from_secs(1))
//!     .await
//!     .unwrap();
//! assert_eq!(raw.write_log(), vec![(EXTEND, vec![0x01])]);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{
    CharacteristicInfo, DelayedUnlockGuard, NotifyCallback, RawConnection, ScanEvent,
    TransactionGuard, Transport,
};

struct MockRawInner {
    connected: AtomicBool,
    /// service -> characteristic -> properties.
    characteristics: StdMutex<HashMap<Uuid, HashMap<Uuid, CharacteristicInfo>>>,
    values: StdMutex<HashMap<Uuid, Vec<u8>>>,
    notify_callbacks: StdMutex<HashMap<Uuid, NotifyCallback>>,
    write_log: StdMutex<Vec<(Uuid, Vec<u8>)>>,
    /// Characteristic -> remaining number of times to fail writes/reads
    /// with the given remote error code, for exercising the retry path.
    fail_remote: StdMutex<HashMap<Uuid, (u16, u32)>>,
}

/// A cheaply-clonable, shareable mock GATT connection. Cloning shares
/// the same underlying state, so a test can keep a handle after handing
/// a `Box<dyn RawConnection>` to a [`crate::connection::Connection`]
/// and still drive notifications or inspect the write log.
#[derive(Clone)]
pub struct MockRawConnection(Arc<MockRawInner>);

impl MockRawConnection {
    /// Create a new, initially-connected mock connection with no
    /// discovered services.
    pub fn new() -> Self {
        Self(Arc::new(MockRawInner {
            connected: AtomicBool::new(true),
            characteristics: StdMutex::new(HashMap::new()),
            values: StdMutex::new(HashMap::new()),
            notify_callbacks: StdMutex::new(HashMap::new()),
            write_log: StdMutex::new(Vec::new()),
            fail_remote: StdMutex::new(HashMap::new()),
        }))
    }

    /// Register a characteristic under a service with the given
    /// properties, so [`Connection`](crate::connection::Connection)
    /// discovery and resolution succeed against it.
    pub fn set_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        readable: bool,
        writable: bool,
        notifiable: bool,
    ) {
        let mut chars = self.0.characteristics.lock().expect("lock poisoned");
        chars.entry(service).or_default().insert(
            characteristic,
            CharacteristicInfo {
                uuid: characteristic,
                readable,
                writable,
                notifiable,
            },
        );
    }

    /// Seed the value a subsequent `read_by_uuid` returns.
    pub fn set_read_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.0
            .values
            .lock()
            .expect("lock poisoned")
            .insert(characteristic, value);
    }

    /// Make the next `count` writes or reads to `characteristic` fail
    /// with `RemoteError(code)`.
    pub fn fail_next(&self, characteristic: Uuid, code: u16, count: u32) {
        self.0
            .fail_remote
            .lock()
            .expect("lock poisoned")
            .insert(characteristic, (code, count));
    }

    /// Clone this handle, sharing the same underlying state. Useful for
    /// retaining a handle to drive notifications or inspect the write
    /// log after the original has been boxed into a `Connection`.
    pub fn clone_handle(&self) -> Self {
        self.clone()
    }

    /// The full write history, in order.
    pub fn write_log(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.0.write_log.lock().expect("lock poisoned").clone()
    }

    /// Simulate the device pushing a notification for `characteristic`.
    /// Invokes the callback registered via `assign_notify_callback`
    /// directly and synchronously; the caller is responsible for
    /// yielding afterwards if it needs the `Connection`'s async
    /// dispatch worker to run.
    pub fn fire_notification(&self, characteristic: Uuid, data: Vec<u8>) {
        let callbacks = self.0.notify_callbacks.lock().expect("lock poisoned");
        if let Some(cb) = callbacks.get(&characteristic) {
            cb(&data);
        }
    }

    /// Force the connection down, as if the peer dropped the link.
    pub fn simulate_disconnect(&self) {
        self.0.connected.store(false, Ordering::SeqCst);
    }

    fn maybe_fail(&self, characteristic: Uuid) -> Option<Error> {
        let mut fails = self.0.fail_remote.lock().expect("lock poisoned");
        if let Some((code, remaining)) = fails.get_mut(&characteristic) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(Error::RemoteError(*code));
            }
        }
        None
    }
}

impl Default for MockRawConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RawConnection for MockRawConnection {
    async fn discover_primary_services(&self, _timeout: Duration) -> Result<Vec<Uuid>> {
        Ok(self
            .0
            .characteristics
            .lock()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect())
    }

    async fn discover_characteristics_of(
        &self,
        service: Uuid,
        _timeout: Duration,
    ) -> Result<Vec<CharacteristicInfo>> {
        Ok(self
            .0
            .characteristics
            .lock()
            .expect("lock poisoned")
            .get(&service)
            .map(|m| m.values().copied().collect())
            .unwrap_or_default())
    }

    async fn read_by_uuid(&self, uuid: Uuid, _timeout: Duration) -> Result<Vec<u8>> {
        if let Some(err) = self.maybe_fail(uuid) {
            return Err(err);
        }
        Ok(self
            .0
            .values
            .lock()
            .expect("lock poisoned")
            .get(&uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_by_uuid(&self, uuid: Uuid, data: &[u8], _timeout: Duration) -> Result<()> {
        if let Some(err) = self.maybe_fail(uuid) {
            return Err(err);
        }
        self.0
            .write_log
            .lock()
            .expect("lock poisoned")
            .push((uuid, data.to_vec()));
        self.0
            .values
            .lock()
            .expect("lock poisoned")
            .insert(uuid, data.to_vec());
        Ok(())
    }

    async fn subscribe_notify(&self, _uuid: Uuid, _enable: bool, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn assign_notify_callback(&self, uuid: Uuid, callback: NotifyCallback) {
        self.0
            .notify_callbacks
            .lock()
            .expect("lock poisoned")
            .insert(uuid, callback);
    }

    fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.0.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct NoopGuard;
impl TransactionGuard for NoopGuard {}
impl DelayedUnlockGuard for NoopGuard {}

/// A deterministic, in-memory [`Transport`]. Connections are looked up
/// by address from a registry the test populates via
/// [`MockTransport::register_device`]; scan events are pushed on demand
/// via [`MockTransport::push_scan_event`].
pub struct MockTransport {
    local_address: [u8; 6],
    devices: StdMutex<HashMap<[u8; 6], MockRawConnection>>,
    scan_tx: broadcast::Sender<ScanEvent>,
    lock: Arc<Mutex<()>>,
}

impl MockTransport {
    /// Create a transport reporting `local_address` as its own
    /// address.
    pub fn new(local_address: [u8; 6]) -> Self {
        let (scan_tx, _) = broadcast::channel(64);
        Self {
            local_address,
            devices: StdMutex::new(HashMap::new()),
            scan_tx,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Make `address` connectable, returning `connection` from
    /// subsequent `connect()` calls.
    pub fn register_device(&self, address: [u8; 6], connection: MockRawConnection) {
        self.devices
            .lock()
            .expect("lock poisoned")
            .insert(address, connection);
    }

    /// Push a scan advertisement to any active `scan_events()` stream.
    /// Silently dropped if there are no active subscribers.
    pub fn push_scan_event(&self, event: ScanEvent) {
        let _ = self.scan_tx.send(event);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    fn scan_events(&self) -> BoxStream<'static, ScanEvent> {
        let rx = self.scan_tx.subscribe();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((event, rx)),
                Err(_) => None,
            }
        }))
    }

    async fn connect(
        &self,
        address: [u8; 6],
        _timeout: Duration,
    ) -> Result<Box<dyn RawConnection>> {
        let conn = self
            .devices
            .lock()
            .expect("lock poisoned")
            .get(&address)
            .cloned()
            .ok_or_else(|| Error::timeout("connect", Duration::from_secs(10)))?;
        conn.0.connected.store(true, Ordering::SeqCst);
        Ok(Box::new(conn))
    }

    async fn transaction(&self) -> Box<dyn TransactionGuard> {
        let _ = self.lock.lock().await;
        Box::new(NoopGuard)
    }

    async fn delayed_unlock(&self, _cooldown: Duration) -> Box<dyn DelayedUnlockGuard> {
        let _ = self.lock.lock().await;
        Box::new(NoopGuard)
    }

    async fn local_address(&self) -> Result<[u8; 6]> {
        Ok(self.local_address)
    }
}
