//! Advertisement filtering: turns raw [`ScanEvent`]s from a [`Transport`]
//! into [`Sighting`]s the registry understands, dropping everything that
//! isn't a microbot.

use futures::StreamExt;
use tracing::debug;

use microbot_types::DeviceUid;
use microbot_types::uuid::PAIRED_ADVERTISEMENT_TYPE_FLOOR;

use crate::registry::{Registry, Sighting};
use crate::transport::{AdvertisementSegment, ScanEvent, Transport};

/// The advertised local name every unpaired microbot uses.
const MICROBOT_LOCAL_NAME: &str = "mibp";

/// Whether `event` looks like a microbot advertisement, and if so, the
/// name to record (if one was advertised).
fn classify(event: &ScanEvent, local_address: &[u8; 6]) -> Option<Option<String>> {
    let mut name = None;
    let mut is_microbot = false;

    for (segment, payload) in &event.payload_segments {
        match segment {
            AdvertisementSegment::CompleteLocalName => {
                if let Ok(text) = std::str::from_utf8(payload) {
                    if text == MICROBOT_LOCAL_NAME {
                        is_microbot = true;
                    }
                    name = Some(text.to_string());
                }
            }
            AdvertisementSegment::ManufacturerSpecificData(type_code) => {
                if *type_code > PAIRED_ADVERTISEMENT_TYPE_FLOOR && payload.as_slice() == &local_address[2..6] {
                    is_microbot = true;
                }
            }
        }
    }

    is_microbot.then_some(name)
}

/// Consume `transport`'s scan stream forever, feeding recognized
/// advertisements to `registry`. Runs until the stream ends, which for a
/// live transport is never.
pub async fn run(transport: &dyn Transport, registry: &Registry) {
    let local_address = match transport.local_address().await {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(error = %err, "failed to read local BLE address, scan loop exiting");
            return;
        }
    };

    let mut events = transport.scan_events();
    while let Some(event) = events.next().await {
        if let Some(name) = classify(&event, &local_address) {
            let uid = DeviceUid::from_bytes(event.sender_address);
            debug!(%uid, ?name, "recognized microbot advertisement");
            registry.on_sighting(Sighting { uid, name });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn event(segments: Vec<(AdvertisementSegment, Vec<u8>)>) -> ScanEvent {
        ScanEvent {
            sender_address: [1, 2, 3, 4, 5, 6],
            payload_segments: segments,
            observed_at: Instant::now(),
        }
    }

    #[test]
    fn local_name_mibp_is_recognized() {
        let e = event(vec![(
            AdvertisementSegment::CompleteLocalName,
            b"mibp".to_vec(),
        )]);
        assert_eq!(classify(&e, &[0; 6]), Some(Some("mibp".to_string())));
    }

    #[test]
    fn unrelated_local_name_is_ignored() {
        let e = event(vec![(
            AdvertisementSegment::CompleteLocalName,
            b"other-device".to_vec(),
        )]);
        assert_eq!(classify(&e, &[0; 6]), None);
    }

    #[test]
    fn paired_manufacturer_data_above_floor_matching_host_tail_is_recognized() {
        let local_address = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let e = event(vec![(
            AdvertisementSegment::ManufacturerSpecificData(201),
            vec![0xCC, 0xDD, 0xEE, 0xFF],
        )]);
        assert_eq!(classify(&e, &local_address), Some(None));
    }

    #[test]
    fn manufacturer_data_at_or_below_floor_is_ignored() {
        let local_address = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let e = event(vec![(
            AdvertisementSegment::ManufacturerSpecificData(200),
            vec![0xCC, 0xDD, 0xEE, 0xFF],
        )]);
        assert_eq!(classify(&e, &local_address), None);
    }

    #[test]
    fn manufacturer_data_not_matching_host_tail_is_ignored() {
        let local_address = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let e = event(vec![(
            AdvertisementSegment::ManufacturerSpecificData(201),
            vec![0x00, 0x00, 0x00, 0x00],
        )]);
        assert_eq!(classify(&e, &local_address), None);
    }
}
