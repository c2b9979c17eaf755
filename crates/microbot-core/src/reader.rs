//! Read-through notification cache sitting on top of a [`Connection`].
//!
//! Once a characteristic has been read once, the reader tries to
//! subscribe to notifications for it and serve every subsequent read
//! from cache, updated as notifications arrive. Characteristics that do
//! not support notify fall back to a timed re-read instead of a BLE
//! round trip on every call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::connection::{Connection, NotifyHandle};
use crate::error::{Error, Result};

/// How long a cached value for a non-notifiable characteristic is
/// served before the next `read()` forces a fresh BLE read.
pub const UNSUPPORTED_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

type Key = (Uuid, Uuid);

/// A callback invoked whenever a cached value changes, receiving the
/// service/characteristic key, the previous value (if any), and the
/// new value.
pub type ChangeCallback = Box<dyn Fn(Key, Option<&[u8]>, &[u8]) + Send + Sync>;

struct Inner {
    handles: HashMap<Key, NotifyHandle>,
    values: HashMap<Key, Vec<u8>>,
    unsupported_values: HashMap<Key, (Vec<u8>, Instant)>,
    unsupported: HashSet<Key>,
    change_callbacks: Vec<ChangeCallback>,
}

impl Inner {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            values: HashMap::new(),
            unsupported_values: HashMap::new(),
            unsupported: HashSet::new(),
            change_callbacks: Vec::new(),
        }
    }
}

/// Read-through cache backed by characteristic notifications, with a
/// timed fallback for characteristics that do not support notify.
///
/// Holds no reference to the owning session; callers pass the current
/// [`Connection`] to every call so the reader survives a reconnect
/// (see [`SubscribingReader::resubscribe`]).
pub struct SubscribingReader {
    inner: StdMutex<Inner>,
}

impl SubscribingReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(Inner::new()),
        }
    }

    /// Register a callback fired whenever any cached value changes.
    pub fn on_change(&self, callback: impl Fn(Key, Option<&[u8]>, &[u8]) + Send + Sync + 'static) {
        self.inner
            .lock()
            .expect("subscribing reader lock poisoned")
            .change_callbacks
            .push(Box::new(callback));
    }

    /// Read `characteristic` within `service`, preferring the notify
    /// cache and falling back to a direct read the first time, or on a
    /// timed basis for characteristics that don't support notify.
    ///
    /// Takes `self` as an `Arc` because a successful subscribe hands an
    /// owned clone of it to the connection's notify dispatcher.
    pub async fn read(
        self: &Arc<Self>,
        conn: &Connection,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let key = (service, characteristic);

        let already_unsupported = self
            .inner
            .lock()
            .expect("subscribing reader lock poisoned")
            .unsupported
            .contains(&key);
        if already_unsupported {
            return self.read_unsupported(conn, key).await;
        }

        let cached = self
            .inner
            .lock()
            .expect("subscribing reader lock poisoned")
            .values
            .get(&key)
            .cloned();
        if let Some(value) = cached {
            return Ok(value);
        }

        // Drop any stale handle for this key before the fresh read below,
        // mirroring the drop-then-reread ordering of the source behavior.
        let stale_handle = self
            .inner
            .lock()
            .expect("subscribing reader lock poisoned")
            .handles
            .remove(&key);
        if let Some(handle) = stale_handle {
            handle.cancel();
        }

        let value = conn
            .read(service, characteristic, Duration::from_secs(15))
            .await?;

        match self.subscribe(conn, key).await {
            Ok(()) => {
                self.inner
                    .lock()
                    .expect("subscribing reader lock poisoned")
                    .values
                    .insert(key, value.clone());
            }
            Err(Error::NotSupported { .. }) => {
                self.inner
                    .lock()
                    .expect("subscribing reader lock poisoned")
                    .unsupported
                    .insert(key);
            }
            Err(err) => return Err(err),
        }

        Ok(value)
    }

    async fn read_unsupported(&self, conn: &Connection, key: Key) -> Result<Vec<u8>> {
        let cached = self
            .inner
            .lock()
            .expect("subscribing reader lock poisoned")
            .unsupported_values
            .get(&key)
            .cloned();

        if let Some((value, expires_at)) = cached
            && Instant::now() < expires_at
        {
            return Ok(value);
        }

        let value = conn.read(key.0, key.1, Duration::from_secs(15)).await?;
        self.inner
            .lock()
            .expect("subscribing reader lock poisoned")
            .unsupported_values
            .insert(key, (value.clone(), Instant::now() + UNSUPPORTED_REFRESH_INTERVAL));
        Ok(value)
    }

    /// Seed the cache from a local write, keeping it coherent without
    /// waiting for the device's own notification to arrive.
    pub fn set_cache(&self, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        let key = (service, characteristic);
        let mut inner = self.inner.lock().expect("subscribing reader lock poisoned");
        inner
            .unsupported_values
            .insert(key, (value.clone(), Instant::now() + UNSUPPORTED_REFRESH_INTERVAL));
        inner.values.insert(key, value);
    }

    /// Drop all cached values and notify subscriptions. The set of
    /// characteristics known not to support notify is retained, since
    /// that is a property of the device, not the connection.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("subscribing reader lock poisoned");
        for (_, handle) in inner.handles.drain() {
            handle.cancel();
        }
        inner.values.clear();
    }

    /// Replay every previously-subscribed `(service, characteristic)`
    /// pair against the new connection. Called after a reconnect.
    pub async fn resubscribe(self: &Arc<Self>, conn: &Connection) -> Result<()> {
        let keys: Vec<Key> = {
            let mut inner = self.inner.lock().expect("subscribing reader lock poisoned");
            let keys: Vec<Key> = inner.handles.keys().copied().collect();
            for (_, handle) in inner.handles.drain() {
                handle.cancel();
            }
            inner.values.clear();
            keys
        };
        for key in keys {
            self.subscribe(conn, key).await?;
        }
        Ok(())
    }

    async fn subscribe(self: &Arc<Self>, conn: &Connection, key: Key) -> Result<()> {
        let already_subscribed = self
            .inner
            .lock()
            .expect("subscribing reader lock poisoned")
            .handles
            .contains_key(&key);
        if already_subscribed {
            return Ok(());
        }

        let reader = Arc::clone(self);
        let handle = conn
            .on_notify(key.0, key.1, move |data: &[u8]| {
                reader.on_notification(key, data);
            })
            .await?;

        self.inner
            .lock()
            .expect("subscribing reader lock poisoned")
            .handles
            .insert(key, handle);
        Ok(())
    }

    fn on_notification(&self, key: Key, data: &[u8]) {
        let mut inner = self.inner.lock().expect("subscribing reader lock poisoned");
        let old_value = inner.values.get(&key).cloned();
        inner.values.insert(key, data.to_vec());
        debug!(?key, "subscribing reader cache updated from notification");

        let changed = old_value.as_deref() != Some(data);
        if changed {
            for cb in &inner.change_callbacks {
                cb(key, old_value.as_deref(), data);
            }
        }
    }
}

impl Default for SubscribingReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRawConnection, MockTransport};
    use microbot_types::uuid::{DEVICE_STATUS, PUSH_SERVICE};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn mock_transport() -> Arc<dyn crate::transport::Transport> {
        Arc::new(MockTransport::new([0; 6]))
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache_without_a_ble_round_trip() {
        let raw = MockRawConnection::new();
        raw.set_characteristic(PUSH_SERVICE, DEVICE_STATUS, true, false, true);
        raw.set_read_value(DEVICE_STATUS, vec![0x01]);
        let conn = Connection::new(mock_transport(), Box::new(raw.clone_handle()));
        let reader = Arc::new(SubscribingReader::new());

        let first = reader.read(&conn, PUSH_SERVICE, DEVICE_STATUS).await.unwrap();
        assert_eq!(first, vec![0x01]);

        raw.set_read_value(DEVICE_STATUS, vec![0xFF]);
        let second = reader.read(&conn, PUSH_SERVICE, DEVICE_STATUS).await.unwrap();
        assert_eq!(second, vec![0x01], "should serve stale cache, not re-read");
    }

    #[tokio::test]
    async fn notification_updates_cache_and_fires_change_callback() {
        let raw = MockRawConnection::new();
        raw.set_characteristic(PUSH_SERVICE, DEVICE_STATUS, true, false, true);
        raw.set_read_value(DEVICE_STATUS, vec![0x01]);
        let conn = Connection::new(mock_transport(), Box::new(raw.clone_handle()));
        let reader = Arc::new(SubscribingReader::new());

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        reader.on_change(move |_key, _old, _new| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        reader.read(&conn, PUSH_SERVICE, DEVICE_STATUS).await.unwrap();
        raw.fire_notification(DEVICE_STATUS, vec![0x02]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cached = reader.read(&conn, PUSH_SERVICE, DEVICE_STATUS).await.unwrap();
        assert_eq!(cached, vec![0x02]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn characteristic_without_notify_falls_back_to_timed_refresh() {
        let raw = MockRawConnection::new();
        raw.set_characteristic(PUSH_SERVICE, DEVICE_STATUS, true, false, false);
        raw.set_read_value(DEVICE_STATUS, vec![0x01]);
        let conn = Connection::new(mock_transport(), Box::new(raw.clone_handle()));
        let reader = Arc::new(SubscribingReader::new());

        let first = reader.read(&conn, PUSH_SERVICE, DEVICE_STATUS).await.unwrap();
        assert_eq!(first, vec![0x01]);

        raw.set_read_value(DEVICE_STATUS, vec![0x02]);
        let second = reader.read(&conn, PUSH_SERVICE, DEVICE_STATUS).await.unwrap();
        assert_eq!(second, vec![0x01], "within refresh window, stale value served");
    }

    #[tokio::test]
    async fn set_cache_keeps_value_coherent_after_a_local_write() {
        let raw = MockRawConnection::new();
        raw.set_characteristic(PUSH_SERVICE, DEVICE_STATUS, true, true, true);
        let conn = Connection::new(mock_transport(), Box::new(raw));
        let reader = Arc::new(SubscribingReader::new());

        reader.set_cache(PUSH_SERVICE, DEVICE_STATUS, vec![0x09]);
        let value = reader.read(&conn, PUSH_SERVICE, DEVICE_STATUS).await.unwrap();
        assert_eq!(value, vec![0x09]);
    }
}
