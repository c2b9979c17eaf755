//! Persistence contract for per-device pair keys.
//!
//! `microbot-core` only depends on this trait; `microbot-store` provides
//! the concrete SQLite-backed implementation. An in-memory
//! implementation is included here for tests.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use microbot_types::{DeviceUid, PairKey};

use crate::error::Result;

/// Persistent mapping from device UID to its 16-byte pair key.
#[async_trait]
pub trait PairKeyStore: Send + Sync {
    /// Whether a key is on record for `uid`.
    async fn has(&self, uid: DeviceUid) -> Result<bool>;

    /// The key on record for `uid`, if any.
    async fn get(&self, uid: DeviceUid) -> Result<Option<PairKey>>;

    /// Store or replace the key for `uid`.
    async fn set(&self, uid: DeviceUid, key: PairKey) -> Result<()>;

    /// Remove the key for `uid`, e.g. after the device reports a
    /// pairing-key mismatch. A no-op if no key is on record.
    async fn delete(&self, uid: DeviceUid) -> Result<()>;
}

/// A non-persistent [`PairKeyStore`] for tests and examples.
#[derive(Default)]
pub struct InMemoryPairKeyStore {
    keys: StdMutex<HashMap<DeviceUid, PairKey>>,
}

impl InMemoryPairKeyStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key without going through the async API, for test setup.
    pub fn seed(&self, uid: DeviceUid, key: PairKey) {
        self.keys.lock().expect("lock poisoned").insert(uid, key);
    }
}

#[async_trait]
impl PairKeyStore for InMemoryPairKeyStore {
    async fn has(&self, uid: DeviceUid) -> Result<bool> {
        Ok(self.keys.lock().expect("lock poisoned").contains_key(&uid))
    }

    async fn get(&self, uid: DeviceUid) -> Result<Option<PairKey>> {
        Ok(self.keys.lock().expect("lock poisoned").get(&uid).cloned())
    }

    async fn set(&self, uid: DeviceUid, key: PairKey) -> Result<()> {
        self.keys.lock().expect("lock poisoned").insert(uid, key);
        Ok(())
    }

    async fn delete(&self, uid: DeviceUid) -> Result<()> {
        self.keys.lock().expect("lock poisoned").remove(&uid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_then_delete_round_trips() {
        let store = InMemoryPairKeyStore::new();
        let uid = DeviceUid::from_bytes([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let key = PairKey::from_slice(&[7u8; 16]).unwrap();

        assert!(!store.has(uid).await.unwrap());
        store.set(uid, key.clone()).await.unwrap();
        assert!(store.has(uid).await.unwrap());
        assert_eq!(store.get(uid).await.unwrap(), Some(key));

        store.delete(uid).await.unwrap();
        assert!(!store.has(uid).await.unwrap());
        assert_eq!(store.get(uid).await.unwrap(), None);
    }
}
