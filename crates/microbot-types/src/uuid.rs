//! Bluetooth GATT UUIDs for the microbot push-actuator fleet.
//!
//! 16-bit UUIDs are expanded into the standard Bluetooth base UUID
//! (`0000XXXX-0000-1000-8000-00805f9b34fb`) the way every other BLE
//! peripheral in this lineage is addressed.

use uuid::{Uuid, uuid};

// --- Services ---

/// Generic device information service (standard 16-bit UUID `180A`).
pub const INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Push-specific service: extend/retract, calibration, button mode, device status.
pub const PUSH_SERVICE: Uuid = uuid!("00001821-0000-1000-8000-00805f9b34fb");

/// Microbot-specific service: LED, blink, battery, firmware version, auth, pairing.
pub const MICROBOT_SERVICE: Uuid = uuid!("00001831-0000-1000-8000-00805f9b34fb");

// --- PushService characteristics ---

/// Extend the pusher arm. Write `0x01`. Notifiable on firmware v0.1.0.
pub const EXTEND: Uuid = uuid!("00002a11-0000-1000-8000-00805f9b34fb");

/// Retract the pusher arm. Write `0x01`. Notifiable on firmware v0.1.0.
pub const RETRACT: Uuid = uuid!("00002a12-0000-1000-8000-00805f9b34fb");

/// Device status. Read/notify; byte[1] == 0x00 means retracted (firmware v0.1.5+).
pub const DEVICE_STATUS: Uuid = uuid!("00002a15-0000-1000-8000-00805f9b34fb");

/// Calibration percentage, single byte, clamped 16-100.
pub const DEVICE_CALIBRATION: Uuid = uuid!("00002a35-0000-1000-8000-00805f9b34fb");

/// Button mode: 0x00 default, 0x01 inverted.
pub const BUTTON_MODE: Uuid = uuid!("00002a53-0000-1000-8000-00805f9b34fb");

// --- MicrobotService characteristics ---

/// LED color/duration command: 6 bytes `01 bits 00 00 00 dur`.
pub const LED: Uuid = uuid!("00002a14-0000-1000-8000-00805f9b34fb");

/// Blink the status LED for N seconds, single byte.
pub const DEVICE_BLINK: Uuid = uuid!("00002a13-0000-1000-8000-00805f9b34fb");

/// Battery level, single byte, divide by 100 for a fraction.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

/// Three-byte firmware version (major, minor, patch).
pub const FIRMWARE_VERSION: Uuid = uuid!("00002a21-0000-1000-8000-00805f9b34fb");

/// Authenticated-connect handshake. Write 20 bytes (LE timestamp || 16-byte
/// key); notifies a single status byte.
pub const AUTH: Uuid = uuid!("00002a98-0000-1000-8000-00805f9b34fb");

/// Pairing handshake. Write host UID (split across two writes); notifies
/// status byte followed by the issued 16-byte pair key.
pub const PAIR: Uuid = uuid!("00002a90-0000-1000-8000-00805f9b34fb");

/// Minimum manufacturer-specific advertisement data type code used by a
/// microbot to signal "already paired with this host" (the advertisement
/// payload then holds the last four bytes of the host's own BLE address).
pub const PAIRED_ADVERTISEMENT_TYPE_FLOOR: u8 = 200;

/// Remote GATT error meaning "device in wrong state" — retryable.
pub const REMOTE_ERROR_WRONG_STATE: u16 = 0x81;

/// Remote GATT error meaning "attribute not found" — expected and
/// ignored while probing a service's characteristic range during
/// discovery.
pub const REMOTE_ERROR_ATTRIBUTE_NOT_FOUND: u16 = 0x040A;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn all_characteristic_uuids_are_distinct() {
        let uuids = [
            EXTEND,
            RETRACT,
            DEVICE_STATUS,
            DEVICE_CALIBRATION,
            BUTTON_MODE,
            LED,
            DEVICE_BLINK,
            BATTERY_LEVEL,
            FIRMWARE_VERSION,
            AUTH,
            PAIR,
        ];
        let set: HashSet<_> = uuids.iter().collect();
        assert_eq!(set.len(), uuids.len(), "duplicate characteristic UUID");
    }

    #[test]
    fn services_are_distinct_from_characteristics() {
        assert_ne!(INFO_SERVICE, PUSH_SERVICE);
        assert_ne!(PUSH_SERVICE, MICROBOT_SERVICE);
        assert_ne!(INFO_SERVICE, MICROBOT_SERVICE);
    }

    #[test]
    fn sixteen_bit_uuids_expand_into_the_standard_base() {
        assert_eq!(
            PUSH_SERVICE.to_string(),
            "00001821-0000-1000-8000-00805f9b34fb"
        );
    }
}
