//! Top-level façade: owns the transport, the registry, the background
//! scan and garbage-collection tasks, and the lookup API callers use to
//! find a specific microbot.

use std::sync::Arc;
use std::time::Duration;

use microbot_types::DeviceUid;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{Error, Result};
use crate::microbot::Microbot;
use crate::pairstore::PairKeyStore;
use crate::registry::Registry;
use crate::scan;
use crate::registry::DEFAULT_STALE_AFTER;
use crate::transport::Transport;

/// How often the registry GC sweep runs, as a fraction of the registry's
/// staleness window.
const GC_INTERVAL_DIVISOR: u32 = 4;

/// Tunables for [`Hub`]'s background scan/GC loop, mirroring the
/// `Duration`-struct-plus-`Default` shape the rest of this lineage uses
/// for its manager-level configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long an unseen, disconnected microbot is kept in the
    /// registry before it is garbage-collected.
    pub max_age: Duration,
    /// The GC sweep interval is `max_age / gc_interval_divisor`.
    pub gc_interval_divisor: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_STALE_AFTER,
            gc_interval_divisor: GC_INTERVAL_DIVISOR,
        }
    }
}

impl HubConfig {
    /// Override the registry's staleness window.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Override the GC sweep divisor.
    pub fn with_gc_interval_divisor(mut self, divisor: u32) -> Self {
        self.gc_interval_divisor = divisor;
        self
    }
}

/// A subscription registered through [`Hub::on_microbot`]. Dropping this
/// does not cancel the subscription; call [`MicrobotSubscription::cancel`].
pub struct MicrobotSubscription {
    discovered: Option<JoinHandle<()>>,
    lost: Option<JoinHandle<()>>,
}

impl MicrobotSubscription {
    /// Stop delivering events to the registered callbacks.
    pub fn cancel(self) {
        if let Some(h) = self.discovered {
            h.abort();
        }
        if let Some(h) = self.lost {
            h.abort();
        }
    }
}

/// Owns a [`Transport`] and the [`Registry`] fed by its advertisement
/// stream. Created once per process; [`start`](Hub::start) must run
/// before any device will be discovered.
pub struct Hub {
    transport: Arc<dyn Transport>,
    registry: Registry,
    config: HubConfig,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Build a hub around `transport`, persisting pairing keys through
    /// `pair_store`. `max_age` bounds how long an unseen, disconnected
    /// microbot is kept in the registry.
    pub fn new(transport: Arc<dyn Transport>, pair_store: Arc<dyn PairKeyStore>, max_age: Duration) -> Self {
        Self::with_config(transport, pair_store, HubConfig::default().with_max_age(max_age))
    }

    /// Build a hub with full control over its background-task tunables.
    pub fn with_config(transport: Arc<dyn Transport>, pair_store: Arc<dyn PairKeyStore>, config: HubConfig) -> Self {
        let registry = Registry::new(Arc::clone(&transport), pair_store, config.max_age);
        Self {
            transport,
            registry,
            config,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Start the underlying transport and the background scan/GC tasks.
    /// Idempotent calls are not supported; call this once.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transport.start().await?;

        let scan_transport = Arc::clone(&self.transport);
        let scan_hub = Arc::clone(self);
        let scan_task = tokio::spawn(async move {
            scan::run(scan_transport.as_ref(), &scan_hub.registry).await;
        });

        let gc_hub = Arc::clone(self);
        let gc_interval = self.config.max_age / self.config.gc_interval_divisor;
        let gc_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc_interval);
            loop {
                ticker.tick().await;
                gc_hub.registry.gc();
            }
        });

        let mut tasks = self.tasks.lock().expect("hub task list lock poisoned");
        tasks.push(scan_task);
        tasks.push(gc_task);
        info!("hub started");
        Ok(())
    }

    /// Snapshot of every currently known microbot.
    pub fn all_microbots(&self) -> Vec<Arc<Microbot>> {
        self.registry.all()
    }

    /// The underlying registry. `pub(crate)` so sibling modules (the
    /// scheduler's tests, chiefly) can seed sightings directly.
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register callbacks fired whenever a microbot is discovered or
    /// ages out of the registry. Either callback may be omitted.
    pub fn on_microbot(
        &self,
        on_discovered: Option<impl Fn(Arc<Microbot>) + Send + Sync + 'static>,
        on_lost: Option<impl Fn(DeviceUid) + Send + Sync + 'static>,
    ) -> MicrobotSubscription {
        let discovered = on_discovered.map(|cb| {
            let mut rx = self.registry.subscribe_discovered();
            tokio::spawn(async move {
                while let Ok(mb) = rx.recv().await {
                    cb(mb);
                }
            })
        });
        let lost = on_lost.map(|cb| {
            let mut rx = self.registry.subscribe_lost();
            tokio::spawn(async move {
                while let Ok(uid) = rx.recv().await {
                    cb(uid);
                }
            })
        });
        MicrobotSubscription { discovered, lost }
    }

    /// Find a microbot by name or canonical UID, waiting up to `timeout`
    /// for it to be discovered if it isn't already known. A zero timeout
    /// only checks devices already in the registry.
    pub async fn get_microbot(&self, name_or_uid: &str, timeout: Duration) -> Result<Arc<Microbot>> {
        if let Some(mb) = self.registry.find_by_name_or_uid(name_or_uid) {
            return Ok(mb);
        }
        if timeout.is_zero() {
            return Err(Error::timeout("get_microbot", timeout));
        }

        let mut rx = self.registry.subscribe_discovered();
        let needle = name_or_uid.to_string();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(mb)
                        if mb.uid().matches_identifier(&needle)
                            || mb
                                .scan_record()
                                .name()
                                .is_some_and(|n| n.eq_ignore_ascii_case(&needle)) =>
                    {
                        return Ok(mb);
                    }
                    Ok(_) => continue,
                    Err(_) => return Err(Error::timeout("get_microbot", timeout)),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout("get_microbot", timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::pairstore::InMemoryPairKeyStore;
    use crate::registry::Sighting;
    use microbot_types::DeviceUid;

    fn hub() -> Arc<Hub> {
        Arc::new(Hub::new(
            Arc::new(MockTransport::new([0; 6])),
            Arc::new(InMemoryPairKeyStore::new()),
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn get_microbot_returns_already_known_device_immediately() {
        let hub = hub();
        let uid = DeviceUid::from_bytes([1, 2, 3, 4, 5, 6]);
        hub.registry.on_sighting(Sighting {
            uid,
            name: Some("front-door".into()),
        });

        let found = hub
            .get_microbot("front-door", Duration::ZERO)
            .await
            .expect("should find already-known device");
        assert_eq!(found.uid(), uid);
    }

    #[tokio::test]
    async fn get_microbot_times_out_when_zero_timeout_and_unknown() {
        let hub = hub();
        let err = hub.get_microbot("nope", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn get_microbot_waits_for_a_matching_discovery() {
        let hub = hub();
        let uid = DeviceUid::from_bytes([9, 9, 9, 9, 9, 9]);

        let wait_hub = Arc::clone(&hub);
        let wait_task = tokio::spawn(async move {
            wait_hub
                .get_microbot(&uid.to_canonical_string(), Duration::from_secs(2))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.registry.on_sighting(Sighting { uid, name: None });

        let found = wait_task.await.unwrap().expect("should discover in time");
        assert_eq!(found.uid(), uid);
    }

    #[tokio::test]
    async fn on_microbot_delivers_discovered_events() {
        let hub = hub();
        let discovered = Arc::new(std::sync::Mutex::new(Vec::new()));

        let d = Arc::clone(&discovered);
        let sub = hub.on_microbot(
            Some(move |mb: Arc<Microbot>| d.lock().unwrap().push(mb.uid())),
            None::<fn(DeviceUid)>,
        );

        let uid = DeviceUid::from_bytes([4, 4, 4, 4, 4, 4]);
        hub.registry.on_sighting(Sighting { uid, name: None });

        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.cancel();

        assert_eq!(*discovered.lock().unwrap(), vec![uid]);
    }
}
