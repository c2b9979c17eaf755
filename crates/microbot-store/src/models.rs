//! Data models for stored data.

use microbot_types::DeviceUid;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A microbot's last-known state, as tracked in the `microbots` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMicrobot {
    /// Database row ID.
    pub id: i64,
    /// Device identifier.
    pub uid: DeviceUid,
    /// Advertised or user-assigned name.
    pub name: Option<String>,
    /// Whether a pairing key is on record for this device.
    pub is_paired: bool,
    /// Whether the daemon currently holds a connection to this device.
    pub is_connected: bool,
    /// Last-observed pusher position, if known.
    pub retracted: Option<bool>,
    /// Last-observed battery level (0.0-1.0), if known.
    pub battery: Option<f32>,
    /// Last-observed calibration percentage, if known.
    pub calibration: Option<u8>,
    /// The most recent dispatch failure recorded against this device.
    pub last_error: Option<String>,
    /// When this device was last seen advertising or connected.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    /// When this row was first created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A pairing key issued by a microbot, as tracked in the `pairing_keys` table.
#[derive(Debug, Clone)]
pub struct StoredPairingKey {
    /// Database row ID.
    pub id: i64,
    /// Device identifier.
    pub uid: DeviceUid,
    /// The 16-byte shared secret.
    pub pair_key: Vec<u8>,
    /// When this key was recorded.
    #[allow(dead_code)]
    pub created_at: OffsetDateTime,
}
