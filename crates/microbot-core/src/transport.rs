//! Trait abstractions for the underlying BLE transport.
//!
//! The session engine never speaks to a concrete Bluetooth stack
//! directly. Every BLE operation goes through [`Transport`] and the raw
//! [`RawConnection`] it hands back, so the engine can run against a
//! real dongle or a deterministic [`crate::mock::MockTransport`]
//! without any other code changing. This mirrors the way the rest of
//! this lineage keeps device I/O behind an async trait object rather
//! than hard-coding a single BLE library throughout the call stack.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::Result;

/// One GATT characteristic's identity and advertised properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub readable: bool,
    pub writable: bool,
    pub notifiable: bool,
}

/// A single advertisement observed during scanning.
#[derive(Debug, Clone)]
pub struct ScanEvent {
    /// The device's BLE address, in transmission order.
    pub sender_address: [u8; 6],
    /// Raw advertisement segments as `(type, payload)` pairs: the local
    /// name segment and any manufacturer-specific-data segments.
    pub payload_segments: Vec<(AdvertisementSegment, Vec<u8>)>,
    /// Monotonic observation time, used for `last_seen` bookkeeping.
    pub observed_at: std::time::Instant,
}

/// The advertisement segment kinds this crate inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisementSegment {
    /// AD type 0x09, the device's complete local name.
    CompleteLocalName,
    /// AD type 0xFF with a type code carried as the first payload byte,
    /// used by already-paired microbots to signal their host.
    ManufacturerSpecificData(u8),
}

/// A scope-held lock on the transport's transceiver. While in scope, no
/// other caller may issue BLE operations on this transport.
pub trait TransactionGuard: Send {}

/// A scope-held lock that additionally delays subsequent acquisitions
/// by a cool-down period after release, modeling a dongle's minimum
/// inter-command spacing. Cool-downs accumulate by taking the max of
/// the existing deadline and `now + cooldown`.
pub trait DelayedUnlockGuard: Send {}

/// Abstract BLE dongle/host radio.
///
/// Implementors provide the scan stream and per-device connections;
/// the session engine treats every concrete radio (a USB dongle, the
/// host Bluetooth stack, or a test double) identically through this
/// trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin the internal scan loop. Idempotent.
    async fn start(&self) -> Result<()>;

    /// A stream of scan advertisements. May be called once; the stream
    /// lives as long as the transport.
    fn scan_events(&self) -> BoxStream<'static, ScanEvent>;

    /// Connect to a peripheral by address. Bounded; fails `Timeout` if
    /// the peripheral does not respond within `timeout`.
    async fn connect(
        &self,
        address: [u8; 6],
        timeout: Duration,
    ) -> Result<Box<dyn RawConnection>>;

    /// Acquire the transceiver lock for the duration of the returned
    /// guard.
    async fn transaction(&self) -> Box<dyn TransactionGuard>;

    /// Acquire the transceiver lock, additionally delaying the next
    /// acquisition by `cooldown` after this guard is released.
    async fn delayed_unlock(&self, cooldown: Duration) -> Box<dyn DelayedUnlockGuard>;

    /// This host's own BLE address, cached after the first call.
    async fn local_address(&self) -> Result<[u8; 6]>;
}

/// Callback invoked for each notification delivered on a subscribed
/// characteristic. Must be fast and must not call back into BLE-issuing
/// APIs on the calling connection; dispatch to a task if more work is
/// needed.
pub type NotifyCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// A single raw connection to one peripheral, as provided by a
/// [`Transport`]. This is the low-level surface; [`crate::connection::Connection`]
/// layers lazy discovery and a notify dispatcher on top of it.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Discover primary services. Safe to call more than once.
    async fn discover_primary_services(&self, timeout: Duration) -> Result<Vec<Uuid>>;

    /// Discover the characteristics of one service. Remote error
    /// `0x040A` (attribute not found) must be swallowed by the
    /// implementation and reported as an empty/unchanged result, not an
    /// error.
    async fn discover_characteristics_of(
        &self,
        service: Uuid,
        timeout: Duration,
    ) -> Result<Vec<CharacteristicInfo>>;

    /// Read a characteristic's current value.
    async fn read_by_uuid(&self, uuid: Uuid, timeout: Duration) -> Result<Vec<u8>>;

    /// Write a characteristic's value.
    async fn write_by_uuid(&self, uuid: Uuid, data: &[u8], timeout: Duration) -> Result<()>;

    /// Enable or disable notifications for a characteristic.
    async fn subscribe_notify(&self, uuid: Uuid, enable: bool, timeout: Duration) -> Result<()>;

    /// Register the callback invoked for every notification on `uuid`.
    /// Replaces any previously registered callback for the same uuid.
    fn assign_notify_callback(&self, uuid: Uuid, callback: NotifyCallback);

    /// Whether the underlying link is still up.
    fn is_connected(&self) -> bool;

    /// Disconnect. Idempotent.
    async fn disconnect(&self) -> Result<()>;
}
