//! Packet adapter.
//!
//! The evaluation core never sees upstream wire formats. Decoders publish a
//! normalised [`TelemetryEvent`] JSON document on the bus; a [`PacketAdapter`]
//! turns it into one typed [`IncomingPacket`] per fix.
//!
//! Adapters are pure: they hold no device state and touch no capability.

use tracing::{debug, warn};
use trackguard_types::{Fix, IncomingPacket, PacketFlags, TelemetryEvent, TrackError};

/// Converts a normalised telemetry payload into evaluation packets.
pub trait PacketAdapter: Send + Sync {
    /// Parse `payload` into one packet per usable fix, in fix order.
    ///
    /// Fails with [`TrackError::MalformedEvent`] for unparseable JSON and
    /// [`TrackError::NoPackets`] when no usable fix remains.
    fn parse(&self, payload: &str) -> Result<Vec<IncomingPacket>, TrackError>;
}

/// Adapter for the GPS tracker envelope (`{"IMEI": .., "ListPackets": ..}`).
#[derive(Debug, Default, Clone, Copy)]
pub struct GpsTrackerAdapter;

impl GpsTrackerAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Convert an already-decoded event.
    pub fn adapt(&self, event: &TelemetryEvent) -> Result<Vec<IncomingPacket>, TrackError> {
        if event.fixes.is_empty() {
            return Err(TrackError::NoPackets);
        }

        let packets: Vec<IncomingPacket> = event
            .fixes
            .iter()
            .enumerate()
            .filter_map(|(index, fix)| {
                let packet = to_packet(&event.imei, fix);
                if packet.is_none() {
                    warn!(imei = %event.imei, index, "skipping fix without a usable timestamp");
                }
                packet
            })
            .collect();

        if packets.is_empty() {
            return Err(TrackError::NoPackets);
        }
        debug!(imei = %event.imei, packets = packets.len(), "telemetry event adapted");
        Ok(packets)
    }
}

impl PacketAdapter for GpsTrackerAdapter {
    fn parse(&self, payload: &str) -> Result<Vec<IncomingPacket>, TrackError> {
        let event: TelemetryEvent = serde_json::from_str(payload)
            .map_err(|e| TrackError::MalformedEvent(e.to_string()))?;
        self.adapt(&event)
    }
}

/// m/s → km/h, truncated toward zero.
pub fn speed_to_kmh(speed: f64) -> i64 {
    (speed * 3.6) as i64
}

fn to_packet(imei: &str, fix: &Fix) -> Option<IncomingPacket> {
    let datetime = fix.timestamp()?;
    let (positioning_status, position_valid) = match &fix.positioning_status {
        Some(status) => (status.as_code(), status.is_valid()),
        None => (String::new(), false),
    };
    Some(IncomingPacket {
        imei: imei.to_string(),
        speed: speed_to_kmh(fix.speed),
        gsm_signal_strength: fix.gsm_signal_strength.unwrap_or(0),
        datetime,
        positioning_status,
        position_valid,
        latitude: fix.latitude,
        longitude: fix.longitude,
        flags: PacketFlags::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMEI: &str = "864352045580761";

    #[test]
    fn converts_each_fix() -> Result<(), Box<dyn std::error::Error>> {
        let payload = format!(
            r#"{{
                "IMEI": "{IMEI}",
                "ListPackets": {{
                    "packet_0": {{
                        "EventCode": {{"Code": 35, "Name": "Track By Time Interval"}},
                        "Latitude": 19.43, "Longitude": -99.13,
                        "Speed": 10, "Altitude": 2240,
                        "Datetime": "2024-03-01T10:00:00Z",
                        "GSMSignalStrength": 22,
                        "PositioningStatus": "A"
                    }},
                    "packet_1": {{
                        "Latitude": 19.44, "Longitude": -99.14,
                        "Speed": 2.5,
                        "Datetime": "2024-03-01T10:00:30Z",
                        "PositioningStatus": false
                    }}
                }}
            }}"#
        );
        let packets = GpsTrackerAdapter::new().parse(&payload)?;
        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0].imei, IMEI);
        assert_eq!(packets[0].speed, 36);
        assert_eq!(packets[0].gsm_signal_strength, 22);
        assert!(packets[0].position_valid);
        assert_eq!(packets[0].positioning_status, "A");

        assert_eq!(packets[1].speed, 9);
        assert_eq!(packets[1].gsm_signal_strength, 0);
        assert!(!packets[1].position_valid);
        assert_eq!(packets[1].flags, PacketFlags::default());
        Ok(())
    }

    #[test]
    fn zero_timestamp_fix_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let payload = r#"{"IMEI": "1", "ListPackets": [
            {"Speed": 1, "Datetime": "0001-01-01T00:00:00Z"},
            {"Speed": 1, "Datetime": "2024-03-01T10:00:00Z"}
        ]}"#;
        let packets = GpsTrackerAdapter::new().parse(payload)?;
        assert_eq!(packets.len(), 1);
        Ok(())
    }

    #[test]
    fn empty_payload_is_no_packets() {
        let adapter = GpsTrackerAdapter::new();
        let err = adapter.parse(r#"{"IMEI": "1", "ListPackets": {}}"#).unwrap_err();
        assert_eq!(err, TrackError::NoPackets);

        let err = adapter.parse(r#"{"IMEI": "1"}"#).unwrap_err();
        assert_eq!(err, TrackError::NoPackets);
    }

    #[test]
    fn all_fixes_unusable_is_no_packets() {
        let payload = r#"{"IMEI": "1", "ListPackets": [{"Speed": 1}, {"Datetime": ""}]}"#;
        let err = GpsTrackerAdapter::new().parse(payload).unwrap_err();
        assert_eq!(err, TrackError::NoPackets);
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = GpsTrackerAdapter::new().parse("{not json").unwrap_err();
        assert!(matches!(err, TrackError::MalformedEvent(_)));
    }

    #[test]
    fn speed_conversion_truncates() {
        assert_eq!(speed_to_kmh(0.0), 0);
        assert_eq!(speed_to_kmh(2.5), 9);
        assert_eq!(speed_to_kmh(27.78), 100);
    }
}
