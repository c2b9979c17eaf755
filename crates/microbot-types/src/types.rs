//! Core domain types shared between the session engine and the persistence layer.

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// A six-byte device identifier, the BLE equivalent of a MAC address.
///
/// Canonical external form is uppercase hex, colon-separated
/// (`AA:BB:CC:DD:EE:FF`). Comparison and hashing are case-insensitive
/// with respect to the string form because `DeviceUid` always stores
/// the raw bytes, not a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceUid([u8; 6]);

impl DeviceUid {
    /// Build a UID from raw bytes.
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// The raw bytes, in transmission order.
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Render the canonical uppercase colon-separated form.
    pub fn to_canonical_string(&self) -> String {
        self.0
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Case-insensitive match against either the canonical UID string or
    /// an arbitrary device name. Used by `Hub::get_microbot` to resolve a
    /// caller-supplied identifier against either form.
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        self.to_canonical_string().eq_ignore_ascii_case(identifier)
    }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for DeviceUid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseError::InvalidDeviceUid(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::InvalidDeviceUid(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for DeviceUid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for DeviceUid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The 16-byte shared secret issued by a microbot during pairing.
///
/// Deliberately does not derive `Debug` with its contents visible, to
/// keep the secret out of logs.
#[derive(Clone, PartialEq, Eq)]
pub struct PairKey([u8; 16]);

impl PairKey {
    /// Build a pair key from exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() != 16 {
            return Err(ParseError::InvalidPairKeyLength(bytes.len()));
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// The raw 16 bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PairKey(..)")
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for PairKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for PairKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// The closed set of commands the scheduler can persist and later dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ActionKind {
    /// Run the pairing handshake.
    Pair,
    /// Flash the status LED for a fixed duration.
    Blink,
    /// Extend the pusher arm.
    Extend,
    /// Retract the pusher arm.
    Retract,
    /// Set calibration percentage.
    Calibrate,
    /// Flip the physical button's default/inverted behavior.
    ChangeButtonMode,
}

impl ActionKind {
    /// The stable lowercase name stored in the database and used in logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pair => "pair",
            Self::Blink => "blink",
            Self::Extend => "extend",
            Self::Retract => "retract",
            Self::Calibrate => "calibrate",
            Self::ChangeButtonMode => "change_button_mode",
        }
    }
}

impl FromStr for ActionKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pair" => Ok(Self::Pair),
            "blink" => Ok(Self::Blink),
            "extend" => Ok(Self::Extend),
            "retract" => Ok(Self::Retract),
            "calibrate" => Ok(Self::Calibrate),
            "change_button_mode" => Ok(Self::ChangeButtonMode),
            other => Err(ParseError::UnknownActionKind(other.to_string())),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical button behavior: does a press extend or retract by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ButtonMode {
    /// Button press extends, second press retracts (factory default).
    Default,
    /// Button behavior flipped.
    Inverted,
}

impl ButtonMode {
    /// Decode the single wire byte used by the ButtonMode characteristic.
    pub const fn from_byte(byte: u8) -> Result<Self, ParseError> {
        match byte {
            0x00 => Ok(Self::Default),
            0x01 => Ok(Self::Inverted),
            other => Err(ParseError::UnknownButtonMode(other)),
        }
    }

    /// Encode as the single wire byte used by the ButtonMode characteristic.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Default => 0x00,
            Self::Inverted => 0x01,
        }
    }
}

/// The three-byte firmware version reported on the MicrobotService.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    /// The earliest firmware generation, which lacks a DeviceStatus characteristic.
    pub const V010: Self = Self {
        major: 0,
        minor: 1,
        patch: 0,
    };

    /// Build a version from its three reported bytes.
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    /// Whether this version uses the original (pre-DeviceStatus) pusher-state protocol.
    pub const fn is_v010(&self) -> bool {
        self.major == Self::V010.major
            && self.minor == Self::V010.minor
            && self.patch == Self::V010.patch
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A queued, persisted command against a specific microbot.
///
/// `prev_action_id` chains actions into a forest: an action is only
/// ready to dispatch once its predecessor (if any) has completed and
/// `prev_action_delay_seconds` has elapsed since then.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: i64,
    pub microbot_uid: DeviceUid,
    pub kind: ActionKind,
    /// Opaque positional/keyword argument blob (e.g. `{"percent": 40}`
    /// for `Calibrate`), interpreted by the dispatcher for `kind`.
    pub args: serde_json::Value,
    pub retries_left: i32,
    pub scheduled_at: time::OffsetDateTime,
    pub prev_action_id: Option<i64>,
    pub prev_action_delay_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_uid_round_trips_canonical_form() {
        let uid: DeviceUid = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(uid.to_canonical_string(), "AA:BB:CC:DD:EE:FF");
        assert!(uid.matches_identifier("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn device_uid_rejects_malformed_input() {
        assert!("AA:BB:CC".parse::<DeviceUid>().is_err());
        assert!("not-a-uid".parse::<DeviceUid>().is_err());
    }

    #[test]
    fn pair_key_requires_sixteen_bytes() {
        assert!(PairKey::from_slice(&[0u8; 15]).is_err());
        assert!(PairKey::from_slice(&[0u8; 16]).is_ok());
    }

    #[test]
    fn pair_key_debug_does_not_leak_bytes() {
        let key = PairKey::from_slice(&[0xAB; 16]).unwrap();
        assert_eq!(format!("{:?}", key), "PairKey(..)");
    }

    #[test]
    fn action_kind_round_trips_through_str() {
        for kind in [
            ActionKind::Pair,
            ActionKind::Blink,
            ActionKind::Extend,
            ActionKind::Retract,
            ActionKind::Calibrate,
            ActionKind::ChangeButtonMode,
        ] {
            let parsed: ActionKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn button_mode_byte_round_trip() {
        assert_eq!(ButtonMode::from_byte(0x00).unwrap(), ButtonMode::Default);
        assert_eq!(ButtonMode::from_byte(0x01).unwrap(), ButtonMode::Inverted);
        assert!(ButtonMode::from_byte(0x02).is_err());
        assert_eq!(ButtonMode::Inverted.to_byte(), 0x01);
    }

    #[test]
    fn firmware_version_v010_detection() {
        assert!(FirmwareVersion::V010.is_v010());
        assert!(!FirmwareVersion {
            major: 1,
            minor: 0,
            patch: 5
        }
        .is_v010());
    }
}
