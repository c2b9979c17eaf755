//! UID-keyed table of known microbots.
//!
//! Owned by [`crate::hub::Hub`]. Consumes recognized advertisements from
//! the scanner, creates a [`crate::microbot::Microbot`] the first time a
//! UID is seen, keeps its [`ScanRecord`] current, and ages out entries
//! that have gone quiet and are not connected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use microbot_types::DeviceUid;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::microbot::Microbot;
use crate::pairstore::PairKeyStore;
use crate::transport::Transport;

/// How long a microbot may go unseen before it is dropped from the
/// registry, provided it is not currently connected.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// The mutable identity data derived from advertisements: name and
/// last-seen time. Shared between the registry and the owning
/// [`Microbot`], which reads it for `last_seen()`/`name()`.
pub struct ScanRecord {
    uid: DeviceUid,
    name: StdMutex<Option<String>>,
    last_seen: StdMutex<Instant>,
}

impl ScanRecord {
    fn new(uid: DeviceUid, name: Option<String>) -> Self {
        Self {
            uid,
            name: StdMutex::new(name),
            last_seen: StdMutex::new(Instant::now()),
        }
    }

    /// The device UID this record describes.
    pub fn uid(&self) -> DeviceUid {
        self.uid
    }

    /// The most recently advertised name, if the device has ever
    /// revealed one.
    pub fn name(&self) -> Option<String> {
        self.name.lock().expect("scan record lock poisoned").clone()
    }

    /// Monotonic time of the most recent advertisement.
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().expect("scan record lock poisoned")
    }

    fn touch(&self, name: Option<String>) {
        *self.last_seen.lock().expect("scan record lock poisoned") = Instant::now();
        if let Some(name) = name {
            *self.name.lock().expect("scan record lock poisoned") = Some(name);
        }
    }
}

/// A recognized microbot advertisement, as produced by the scanner
/// after it has filtered out unrelated BLE traffic.
#[derive(Debug, Clone)]
pub struct Sighting {
    pub uid: DeviceUid,
    pub name: Option<String>,
}

/// UID-keyed table of known microbots with discovered/lost fan-out.
pub struct Registry {
    transport: Arc<dyn Transport>,
    pair_store: Arc<dyn PairKeyStore>,
    entries: StdMutex<HashMap<DeviceUid, Arc<Microbot>>>,
    discovered_tx: broadcast::Sender<Arc<Microbot>>,
    lost_tx: broadcast::Sender<DeviceUid>,
    stale_after: Duration,
}

impl Registry {
    /// Create an empty registry backed by `transport` and `pair_store`.
    /// `stale_after` bounds how long an unseen, disconnected microbot is
    /// kept before [`gc`](Self::gc) evicts it.
    pub fn new(transport: Arc<dyn Transport>, pair_store: Arc<dyn PairKeyStore>, stale_after: Duration) -> Self {
        let (discovered_tx, _) = broadcast::channel(64);
        let (lost_tx, _) = broadcast::channel(64);
        Self {
            transport,
            pair_store,
            entries: StdMutex::new(HashMap::new()),
            discovered_tx,
            lost_tx,
            stale_after,
        }
    }

    /// A stream of every microbot discovered from now on, plus every
    /// one already known if `include_existing` is true.
    pub fn subscribe_discovered(&self) -> broadcast::Receiver<Arc<Microbot>> {
        self.discovered_tx.subscribe()
    }

    /// A stream of UIDs aged out of the registry.
    pub fn subscribe_lost(&self) -> broadcast::Receiver<DeviceUid> {
        self.lost_tx.subscribe()
    }

    /// Look up a microbot by UID.
    pub fn get(&self, uid: DeviceUid) -> Option<Arc<Microbot>> {
        self.entries.lock().expect("registry lock poisoned").get(&uid).cloned()
    }

    /// Snapshot of every currently known microbot.
    pub fn all(&self) -> Vec<Arc<Microbot>> {
        self.entries.lock().expect("registry lock poisoned").values().cloned().collect()
    }

    /// Find a microbot by its canonical UID string or its advertised
    /// name, both matched case-insensitively.
    pub fn find_by_name_or_uid(&self, needle: &str) -> Option<Arc<Microbot>> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .find(|mb| {
                mb.uid().matches_identifier(needle)
                    || mb
                        .scan_record()
                        .name()
                        .is_some_and(|n| n.eq_ignore_ascii_case(needle))
            })
            .cloned()
    }

    /// Record a fresh sighting, creating a new [`Microbot`] and firing
    /// the discovered event the first time this UID is seen.
    pub fn on_sighting(&self, sighting: Sighting) -> Arc<Microbot> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if let Some(existing) = entries.get(&sighting.uid) {
            existing.scan_record().touch(sighting.name);
            return Arc::clone(existing);
        }

        let record = Arc::new(ScanRecord::new(sighting.uid, sighting.name));
        let microbot = Arc::new(Microbot::new(
            sighting.uid,
            record,
            Arc::clone(&self.transport),
            Arc::clone(&self.pair_store),
        ));
        entries.insert(sighting.uid, Arc::clone(&microbot));
        info!(uid = %sighting.uid, "microbot discovered");
        let _ = self.discovered_tx.send(Arc::clone(&microbot));
        microbot
    }

    /// Drop entries that have gone quiet for longer than `stale_after`
    /// and are not currently connected, firing the lost event for each.
    pub fn gc(&self) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let stale_after = self.stale_after;
        let mut lost = Vec::new();
        entries.retain(|uid, mb| {
            let stale = mb.scan_record().last_seen().elapsed() > stale_after;
            let keep = !stale || mb.is_connected();
            if !keep {
                lost.push(*uid);
            }
            keep
        });
        drop(entries);
        for uid in lost {
            debug!(%uid, "microbot aged out of registry");
            let _ = self.lost_tx.send(uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::pairstore::InMemoryPairKeyStore;

    fn registry() -> Registry {
        Registry::new(
            Arc::new(MockTransport::new([0; 6])),
            Arc::new(InMemoryPairKeyStore::new()),
            DEFAULT_STALE_AFTER,
        )
    }

    #[test]
    fn first_sighting_creates_and_fires_discovered() {
        let registry = registry();
        let mut discovered = registry.subscribe_discovered();
        let uid = DeviceUid::from_bytes([1, 2, 3, 4, 5, 6]);

        let mb = registry.on_sighting(Sighting {
            uid,
            name: Some("mibp".into()),
        });

        assert_eq!(mb.uid(), uid);
        let seen = discovered.try_recv().unwrap();
        assert_eq!(seen.uid(), uid);
    }

    #[test]
    fn repeated_sighting_updates_existing_record_without_refiring_discovered() {
        let registry = registry();
        let uid = DeviceUid::from_bytes([1, 2, 3, 4, 5, 6]);
        let mut discovered = registry.subscribe_discovered();

        let first = registry.on_sighting(Sighting { uid, name: None });
        let second = registry.on_sighting(Sighting {
            uid,
            name: Some("renamed".into()),
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.scan_record().name(), Some("renamed".to_string()));
        assert!(discovered.try_recv().is_ok());
        assert!(discovered.try_recv().is_err());
    }

    #[test]
    fn gc_drops_stale_disconnected_entries_and_fires_lost() {
        let registry = Registry {
            stale_after: Duration::from_secs(0),
            ..registry()
        };
        let mut lost = registry.subscribe_lost();
        let uid = DeviceUid::from_bytes([9, 9, 9, 9, 9, 9]);
        registry.on_sighting(Sighting { uid, name: None });

        std::thread::sleep(Duration::from_millis(5));
        registry.gc();

        assert!(registry.get(uid).is_none());
        assert_eq!(lost.try_recv().unwrap(), uid);
    }
}
