//! Error types for microbot-core.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving a microbot session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error
/// variants in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A BLE operation or a wait for a condition exceeded its deadline.
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The operation requires an active connection; none exists.
    #[error("not connected to device")]
    NotConnected,

    /// The characteristic lacks a property (read/write/notify) the
    /// operation requires.
    #[error("characteristic {uuid} does not support {operation}")]
    NotSupported {
        /// The characteristic UUID.
        uuid: String,
        /// The unsupported operation (e.g. "notify").
        operation: String,
    },

    /// The peer reported a GATT-level error.
    #[error("remote GATT error: 0x{0:04X}")]
    RemoteError(u16),

    /// A public API was called while the device was in an incompatible
    /// state (e.g. `connect()` while already connected).
    #[error("wrong connection state: {0}")]
    WrongConnectionState(String),

    /// The pair key is missing, was refused, or the pairing dialogue
    /// ended negatively.
    #[error("not paired: {message}{}", code.map(|c| format!(" (status 0x{:02X})", c)).unwrap_or_default())]
    NotPaired {
        /// The device-reported status byte, if one was received.
        code: Option<u8>,
        /// Human-readable detail.
        message: String,
    },

    /// A command was accepted by the device but its post-condition was
    /// never observed (e.g. the pusher state did not flip).
    #[error("I/O error: {0}")]
    IoError(String),

    /// A waited-for state-change event did not arrive in time.
    #[error("state change did not happen within {0:?}")]
    StateChangeError(Duration),

    /// A stable connection exhausted its reconnection attempts.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Underlying transport-level failure not otherwise classified above.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a not-supported error for a characteristic/operation pair.
    pub fn not_supported(uuid: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotSupported {
            uuid: uuid.into(),
            operation: operation.into(),
        }
    }

    /// Create a wrong-connection-state error.
    pub fn wrong_state(message: impl Into<String>) -> Self {
        Self::WrongConnectionState(message.into())
    }

    /// Create a not-paired error with a device status code.
    pub fn not_paired_code(code: u8, message: impl Into<String>) -> Self {
        Self::NotPaired {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Create a not-paired error with no device status code (e.g. no
    /// key on record at all).
    pub fn not_paired(message: impl Into<String>) -> Self {
        Self::NotPaired {
            code: None,
            message: message.into(),
        }
    }

    /// True if this error represents the device-in-wrong-state GATT
    /// error (`0x81`), the single remote code the default retry policy
    /// retries.
    pub fn is_retryable_remote_error(&self) -> bool {
        matches!(self, Self::RemoteError(code) if *code == microbot_types::uuid::REMOTE_ERROR_WRONG_STATE)
    }

    /// True if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias using microbot-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
