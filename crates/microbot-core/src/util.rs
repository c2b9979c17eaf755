//! Small shared helpers with no natural home in a single module.

/// Lowercase hex encoding, used for the host-UID blob exchanged during
/// pairing.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
