//! Per-device GATT connection: lazy characteristic discovery and a
//! single-worker notification dispatcher sitting on top of a raw
//! transport connection.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, with_retry};
use crate::transport::{CharacteristicInfo, RawConnection, Transport};

/// Default timeout for a characteristic write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(15);
/// Default timeout for a characteristic read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Default timeout for service/characteristic discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// A subscriber handle returned from [`Connection::on_notify`]. Dropping
/// it does not cancel the subscription; call [`NotifyHandle::cancel`]
/// explicitly.
pub struct NotifyHandle {
    uuid: Uuid,
    id: u64,
    subscribers: std::sync::Weak<StdMutex<HashMap<Uuid, Vec<(u64, SharedCallback)>>>>,
}

impl NotifyHandle {
    /// Remove this subscriber from the characteristic's callback list.
    /// Safe to call while a notification for this characteristic is
    /// in flight: the current dispatch round completes using the list
    /// snapshot it already took.
    pub fn cancel(self) {
        if let Some(subs) = self.subscribers.upgrade() {
            let mut subs = subs.lock().expect("notify subscriber lock poisoned");
            if let Some(list) = subs.get_mut(&self.uuid) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// A registered notification subscriber: a shared, clonable callback so
/// the dispatch worker can take an owned snapshot of the subscriber
/// list without holding the registry lock while callbacks run.
type SharedCallback = std::sync::Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Internal per-characteristic subscriber registry and single dispatch
/// worker. The worker pops `(uuid, data)` pairs off a queue and invokes
/// every subscriber for that uuid in turn; one callback's panic does
/// not block the next.
struct NotifyHub {
    subscribers: std::sync::Arc<StdMutex<HashMap<Uuid, Vec<(u64, SharedCallback)>>>>,
    next_id: AtomicU64,
    queue_tx: mpsc::UnboundedSender<(Uuid, Vec<u8>)>,
    _worker: JoinHandle<()>,
}

impl NotifyHub {
    fn new() -> Self {
        let subscribers: std::sync::Arc<StdMutex<HashMap<Uuid, Vec<(u64, SharedCallback)>>>> =
            std::sync::Arc::new(StdMutex::new(HashMap::new()));
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<(Uuid, Vec<u8>)>();
        let worker_subs = std::sync::Arc::clone(&subscribers);
        let worker = tokio::spawn(async move {
            while let Some((uuid, data)) = queue_rx.recv().await {
                let callbacks: Vec<SharedCallback> = {
                    let subs = worker_subs.lock().expect("notify subscriber lock poisoned");
                    subs.get(&uuid)
                        .map(|list| list.iter().map(|(_, cb)| std::sync::Arc::clone(cb)).collect())
                        .unwrap_or_default()
                };
                for cb in callbacks {
                    cb(&data);
                }
            }
        });

        Self {
            subscribers,
            next_id: AtomicU64::new(0),
            queue_tx,
            _worker: worker,
        }
    }

    fn subscriber_count(&self, uuid: Uuid) -> usize {
        self.subscribers
            .lock()
            .expect("notify subscriber lock poisoned")
            .get(&uuid)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn add_subscriber(
        &self,
        uuid: Uuid,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> NotifyHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = self.subscribers.lock().expect("notify subscriber lock poisoned");
        subs.entry(uuid)
            .or_default()
            .push((id, std::sync::Arc::new(callback)));
        NotifyHandle {
            uuid,
            id,
            subscribers: std::sync::Arc::downgrade(&self.subscribers),
        }
    }
}

/// Wraps a raw transport connection with lazy per-service
/// characteristic discovery and a notify dispatcher.
pub struct Connection {
    transport: std::sync::Arc<dyn Transport>,
    raw: Box<dyn RawConnection>,
    services: Mutex<HashMap<Uuid, Vec<CharacteristicInfo>>>,
    notify_hub: NotifyHub,
    last_active: StdMutex<Instant>,
}

impl Connection {
    /// Wrap a freshly established raw connection against `transport`.
    /// Does not perform any discovery; characteristics are discovered
    /// lazily per-service. `transport`'s cool-down lock is acquired
    /// around every retried attempt issued through this connection.
    pub fn new(transport: std::sync::Arc<dyn Transport>, raw: Box<dyn RawConnection>) -> Self {
        Self {
            transport,
            raw,
            services: Mutex::new(HashMap::new()),
            notify_hub: NotifyHub::new(),
            last_active: StdMutex::new(Instant::now()),
        }
    }

    /// Timestamp of the most recent successful operation or incoming
    /// notification.
    pub fn last_active_time(&self) -> Instant {
        *self.last_active.lock().expect("last_active lock poisoned")
    }

    fn touch(&self) {
        *self.last_active.lock().expect("last_active lock poisoned") = Instant::now();
    }

    /// Whether the underlying link is still up.
    pub fn is_active(&self) -> bool {
        self.raw.is_connected()
    }

    /// Resolve a characteristic's properties, discovering the owning
    /// service's characteristic table on first access.
    async fn resolve(&self, service: Uuid, characteristic: Uuid) -> Result<CharacteristicInfo> {
        {
            let services = self.services.lock().await;
            if let Some(chars) = services.get(&service)
                && let Some(info) = chars.iter().find(|c| c.uuid == characteristic)
            {
                return Ok(*info);
            }
        }

        let discovered = self
            .raw
            .discover_characteristics_of(service, DEFAULT_DISCOVERY_TIMEOUT)
            .await?;
        debug!(%service, count = discovered.len(), "discovered service characteristics");

        let mut services = self.services.lock().await;
        services.insert(service, discovered.clone());

        discovered
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| Error::not_supported(characteristic.to_string(), "exist"))
    }

    /// Write `data` to `characteristic` within `service`, retrying per
    /// the write policy.
    pub async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        if !self.is_active() {
            return Err(Error::NotConnected);
        }
        let info = self.resolve(service, characteristic).await?;
        if !info.writable {
            return Err(Error::not_supported(characteristic.to_string(), "write"));
        }

        let policy = RetryPolicy::for_write();
        let result = with_retry(&policy, "write", || async {
            let _guard = self.transport.delayed_unlock(policy.delayed_unlock).await;
            self.raw
                .write_by_uuid(characteristic, data, DEFAULT_WRITE_TIMEOUT)
                .await
        })
        .await;
        if result.is_ok() {
            self.touch();
        }
        result
    }

    /// Read `characteristic` within `service`, retrying per the read
    /// policy.
    pub async fn read(
        &self,
        service: Uuid,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if !self.is_active() {
            return Err(Error::NotConnected);
        }
        let info = self.resolve(service, characteristic).await?;
        if !info.readable {
            return Err(Error::not_supported(characteristic.to_string(), "read"));
        }

        let policy = RetryPolicy::for_read();
        let result = with_retry(&policy, "read", || async {
            let _guard = self.transport.delayed_unlock(policy.delayed_unlock).await;
            self.raw.read_by_uuid(characteristic, timeout).await
        })
        .await;
        if result.is_ok() {
            self.touch();
        }
        result
    }

    /// Subscribe a callback to notifications on `characteristic`. The
    /// underlying BLE subscription is established only on the
    /// empty-to-non-empty transition of the subscriber list; it is
    /// never torn down on the reverse transition (see design notes).
    pub async fn on_notify(
        &self,
        service: Uuid,
        characteristic: Uuid,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<NotifyHandle> {
        if !self.is_active() {
            return Err(Error::NotConnected);
        }
        let info = self.resolve(service, characteristic).await?;
        if !info.notifiable {
            return Err(Error::not_supported(characteristic.to_string(), "notify"));
        }

        let was_empty = self.notify_hub.subscriber_count(characteristic) == 0;
        let handle = self.notify_hub.add_subscriber(characteristic, callback);

        if was_empty {
            let policy = RetryPolicy::for_subscribe();
            let subscribe_result = with_retry(&policy, "subscribe_notify", || async {
                let _guard = self.transport.delayed_unlock(policy.delayed_unlock).await;
                self.raw
                    .subscribe_notify(characteristic, true, DEFAULT_WRITE_TIMEOUT)
                    .await
            })
            .await;
            subscribe_result?;

            let queue_tx = self.notify_hub.queue_tx.clone();
            self.raw.assign_notify_callback(
                characteristic,
                Box::new(move |data: &[u8]| {
                    let _ = queue_tx.send((characteristic, data.to_vec()));
                }),
            );
        }

        Ok(handle)
    }

    /// Read every readable characteristic across every discovered
    /// service, forcing discovery of services not yet queried.
    pub async fn read_all_characteristics(&self) -> Result<HashMap<Uuid, HashMap<Uuid, Vec<u8>>>> {
        if !self.is_active() {
            return Err(Error::NotConnected);
        }
        let service_uuids = self
            .raw
            .discover_primary_services(DEFAULT_DISCOVERY_TIMEOUT)
            .await?;

        let mut out = HashMap::new();
        for service in service_uuids {
            let chars = {
                let cached = self.services.lock().await.get(&service).cloned();
                match cached {
                    Some(c) => c,
                    None => {
                        let discovered = self
                            .raw
                            .discover_characteristics_of(service, DEFAULT_DISCOVERY_TIMEOUT)
                            .await?;
                        self.services
                            .lock()
                            .await
                            .insert(service, discovered.clone());
                        discovered
                    }
                }
            };

            let mut values = HashMap::new();
            for c in chars.into_iter().filter(|c| c.readable) {
                match self.raw.read_by_uuid(c.uuid, DEFAULT_READ_TIMEOUT).await {
                    Ok(value) => {
                        values.insert(c.uuid, value);
                    }
                    Err(Error::RemoteError(code))
                        if code == microbot_types::uuid::REMOTE_ERROR_ATTRIBUTE_NOT_FOUND =>
                    {
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            out.insert(service, values);
        }
        self.touch();
        Ok(out)
    }

    /// Disconnect. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.raw.disconnect().await
    }
}
