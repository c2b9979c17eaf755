//! Core session and scheduling engine for the microbot push-actuator fleet.
//!
//! This crate provides low-level Bluetooth Low Energy (BLE) communication
//! with Microbot push actuators: discovery, pairing, the pusher's
//! extend/retract/calibrate commands, and a durable background
//! scheduler that dispatches queued actions against whichever devices
//! are in range.
//!
//! # Layout
//!
//! - [`transport`] / [`mock`]: the BLE abstraction the rest of the crate
//!   is built against, and a deterministic fake for tests.
//! - [`retry`]: the fixed-delay retry policy used for transient GATT
//!   errors.
//! - [`connection`], [`reader`], [`reconnect`], [`firmware`]: one
//!   device's wire session — characteristic I/O, cached/subscribed
//!   reads, reconnect-with-backoff, and the firmware-version-dependent
//!   pusher-state overlay.
//! - [`pairstore`]: the trait `microbot-store` implements to persist
//!   pairing keys.
//! - [`events`], [`registry`], [`scan`]: the discovery pipeline —
//!   advertisement parsing, the live device table, and the scan loop
//!   that feeds it.
//! - [`microbot`]: the per-device session API (`connect`, `pair`,
//!   `extend`, `retract`, `calibrate`, ...).
//! - [`hub`]: the process-wide façade tying transport, registry, and
//!   background tasks together, and the lookup API callers use.
//! - [`action_store`], [`scheduler`]: the durable action queue contract
//!   and the background dispatcher/reconnector built on top of it.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use microbot_core::hub::Hub;
//! use microbot_core::pairstore::InMemoryPairKeyStore;
//!
//! # async fn run(transport: Arc<dyn microbot_core::transport::Transport>) -> microbot_core::Result<()> {
//! let hub = Arc::new(Hub::new(transport, Arc::new(InMemoryPairKeyStore::new()), Duration::from_secs(600)));
//! hub.start().await?;
//!
//! let mb = hub.get_microbot("AA:BB:CC:DD:EE:FF", Duration::from_secs(10)).await?;
//! mb.connect().await?;
//! mb.extend().await?;
//! # Ok(())
//! # }
//! ```

pub mod action_store;
pub mod connection;
pub mod error;
pub mod events;
pub mod firmware;
pub mod hub;
pub mod mock;
pub mod pairstore;
pub mod reader;
pub mod reconnect;
pub mod registry;
pub mod retry;
pub mod scan;
pub mod scheduler;
pub mod transport;
pub mod util;

mod microbot;

pub use action_store::{ActionStore, InMemoryActionStore};
pub use error::{Error, Result};
pub use hub::{Hub, HubConfig, MicrobotSubscription};
pub use microbot::Microbot;
pub use pairstore::{InMemoryPairKeyStore, PairKeyStore};
pub use registry::{Registry, ScanRecord, Sighting};
pub use scheduler::{ActionScheduler, SchedulerConfig};
pub use transport::{RawConnection, Transport};

// Re-exported so callers only need `microbot-core` for the common
// domain vocabulary, the way this lineage re-exports its types crate.
pub use microbot_types::{Action, ActionKind, ButtonMode, DeviceUid, FirmwareVersion, PairKey};
pub use microbot_types::uuid;
