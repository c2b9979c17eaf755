//! Platform-agnostic types for the microbot push-actuator fleet.
//!
//! This crate holds the identifiers, wire-format value types, and GATT
//! UUID table shared between the session engine (`microbot-core`) and
//! the persistence layer (`microbot-store`), so neither needs to depend
//! on the other for these definitions.
//!
//! # Example
//!
//! ```
//! use microbot_types::{ActionKind, DeviceUid};
//!
//! let uid: DeviceUid = "AA:BB:CC:DD:EE:FF".parse().unwrap();
//! assert_eq!(uid.to_canonical_string(), "AA:BB:CC:DD:EE:FF");
//! assert_eq!(ActionKind::Extend.as_str(), "extend");
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{Action, ActionKind, ButtonMode, DeviceUid, FirmwareVersion, PairKey};
