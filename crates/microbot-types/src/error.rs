//! Parsing errors for microbot-types.

use thiserror::Error;

/// Errors that can occur when parsing identifiers and wire values.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A device UID string was not six colon-separated hex octets.
    #[error("invalid device UID '{0}': expected six colon-separated hex octets")]
    InvalidDeviceUid(String),

    /// A pair key was not exactly 16 bytes.
    #[error("invalid pair key: expected 16 bytes, got {0}")]
    InvalidPairKeyLength(usize),

    /// An action-kind string did not match the closed set of known kinds.
    #[error("unknown action kind: '{0}'")]
    UnknownActionKind(String),

    /// A button-mode byte was not one of the known values.
    #[error("unknown button mode byte: 0x{0:02X}")]
    UnknownButtonMode(u8),
}

/// Result type alias using microbot-types' [`ParseError`] type.
pub type ParseResult<T> = core::result::Result<T, ParseError>;
