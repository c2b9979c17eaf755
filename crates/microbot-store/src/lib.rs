//! SQLite-backed persistence for the microbot push-actuator fleet.
//!
//! This crate implements `microbot-core`'s [`PairKeyStore`] and
//! [`ActionStore`] traits on top of `rusqlite`, giving the daemon a
//! durable record of pairing keys, per-device state, and the queued
//! action chain across restarts.
//!
//! # Example
//!
//! ```no_run
//! use microbot_store::Store;
//!
//! let store = Store::open_default()?;
//! let microbots = store.list_microbots()?;
//! # Ok::<(), microbot_store::Error>(())
//! ```

mod error;
mod models;
mod schema;
mod store;

pub use error::{Error, Result};
pub use microbot_core::action_store::ActionStore;
pub use microbot_core::pairstore::PairKeyStore;
pub use models::{StoredMicrobot, StoredPairingKey};
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/microbot-hub/fleet.db`
/// - macOS: `~/Library/Application Support/microbot-hub/fleet.db`
/// - Windows: `C:\Users\<user>\AppData\Local\microbot-hub\fleet.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("microbot-hub")
        .join("fleet.db")
}
