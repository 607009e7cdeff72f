use crate::image::{self, ImageArtifact};
use crate::payload::RawPayload;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Sentinel substituted for an absent plate number, so downstream folder
/// names are always well-formed
pub const UNKNOWN_PLATE: &str = "UNKNOWN";

/// Sentinel for a source that neither declared a device id nor matched the
/// IP table
pub const UNKNOWN_CAMERA: &str = "unknown";

/// Ordered candidate paths for the plate number. The camera fleet spans
/// firmware generations: newer units nest everything under `Picture`,
/// older ones post flat fields.
const PLATE_PATHS: &[&[&str]] = &[
    &["Picture", "Plate", "PlateNumber"],
    &["PlateNumber"],
    &["Plate"],
];

const PLATE_COLOR_PATHS: &[&[&str]] = &[&["Picture", "Plate", "PlateColor"], &["PlateColor"]];

const VEHICLE_COLOR_PATHS: &[&[&str]] = &[
    &["Picture", "Vehicle", "VehicleColor"],
    &["VehicleColor"],
];

const DEVICE_PATHS: &[&[&str]] = &[&["Picture", "SnapInfo", "DeviceID"], &["DeviceID"]];

const EVENT_TIME_PATHS: &[&[&str]] = &[&["Picture", "SnapInfo", "AccurateTime"]];

/// Canonical record for one processed camera event
#[derive(Debug)]
pub struct Event {
    /// Unique per request, assigned exactly once at normalization time.
    /// Join key across the file layout, the JSON artifact, and the
    /// datastore row.
    pub event_id: Uuid,
    /// When this process received the request
    pub received_at: DateTime<Utc>,
    /// IP-mapped name, payload device id, or "unknown"
    pub source_camera: String,
    /// Never empty; absence maps to "UNKNOWN"
    pub plate_number: String,
    pub plate_color: Option<String>,
    pub vehicle_color: Option<String>,
    /// Camera-declared capture time, carried verbatim as metadata
    pub accurate_time: Option<String>,
    /// The payload as received
    pub raw_payload: RawPayload,
    /// Images extracted from the payload, in role order
    pub images: Vec<ImageArtifact>,
}

impl Event {
    /// Normalize a decoded payload into a canonical event.
    ///
    /// Every field lookup is total: a missing branch at any nesting depth
    /// falls through to the next candidate path or the sentinel default.
    /// IP-based camera resolution applies only when the payload carries no
    /// device id of its own, so self-declared identity wins over inferred.
    pub fn from_payload(
        payload: RawPayload,
        source_ip: Option<&str>,
        ip_map: &HashMap<String, String>,
    ) -> Self {
        let images = image::extract_all(&payload);
        let json = payload.as_json();

        let plate_number = json
            .and_then(|v| first_str(v, PLATE_PATHS))
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_PLATE)
            .to_string();

        let plate_color = json
            .and_then(|v| first_str(v, PLATE_COLOR_PATHS))
            .map(str::to_owned);
        let vehicle_color = json
            .and_then(|v| first_str(v, VEHICLE_COLOR_PATHS))
            .map(str::to_owned);
        let accurate_time = json
            .and_then(|v| first_str(v, EVENT_TIME_PATHS))
            .map(str::to_owned);

        let source_camera = json
            .and_then(|v| first_str(v, DEVICE_PATHS))
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .or_else(|| source_ip.and_then(|ip| ip_map.get(ip).cloned()))
            .unwrap_or_else(|| UNKNOWN_CAMERA.to_string());

        Self {
            event_id: Uuid::new_v4(),
            received_at: Utc::now(),
            source_camera,
            plate_number,
            plate_color,
            vehicle_color,
            accurate_time,
            raw_payload: payload,
            images,
        }
    }
}

/// Walk one candidate path; total, never panics on shallow or deep payloads
fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

/// First candidate path that resolves to a string wins
fn first_str<'a>(root: &'a Value, paths: &[&[&str]]) -> Option<&'a str> {
    paths
        .iter()
        .find_map(|path| lookup(root, path).and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn normalize(value: Value) -> Event {
        Event::from_payload(RawPayload::Json(value), None, &HashMap::new())
    }

    #[test]
    fn test_nested_plate_extraction() {
        let event = normalize(json!({
            "Picture": {
                "Plate": { "PlateNumber": "KA51AB1234", "PlateColor": "White" },
                "SnapInfo": { "DeviceID": "CAM_001", "AccurateTime": "2024-01-15 10:30:45" },
                "Vehicle": { "VehicleColor": "Blue" },
            }
        }));

        assert_eq!(event.plate_number, "KA51AB1234");
        assert_eq!(event.plate_color.as_deref(), Some("White"));
        assert_eq!(event.vehicle_color.as_deref(), Some("Blue"));
        assert_eq!(event.source_camera, "CAM_001");
        assert_eq!(event.accurate_time.as_deref(), Some("2024-01-15 10:30:45"));
    }

    #[test]
    fn test_flat_plate_fallback() {
        let event = normalize(json!({ "Plate": "MH12XY9999", "DeviceID": "gate-2" }));
        assert_eq!(event.plate_number, "MH12XY9999");
        assert_eq!(event.source_camera, "gate-2");
    }

    #[test]
    fn test_nested_path_wins_over_flat() {
        let event = normalize(json!({
            "Plate": "FLAT",
            "Picture": { "Plate": { "PlateNumber": "NESTED" } },
        }));
        assert_eq!(event.plate_number, "NESTED");
    }

    #[test]
    fn test_missing_plate_defaults_to_sentinel() {
        // At any depth: empty object, missing branch, wrong-typed branch
        for value in [
            json!({}),
            json!({ "Picture": {} }),
            json!({ "Picture": { "Plate": {} } }),
            json!({ "Picture": { "Plate": { "PlateNumber": 42 } } }),
            json!({ "Picture": "not-an-object" }),
            json!({ "Plate": "" }),
        ] {
            let event = normalize(value);
            assert_eq!(event.plate_number, UNKNOWN_PLATE);
            assert!(!event.plate_number.is_empty());
        }
    }

    #[test]
    fn test_ip_resolution_only_when_payload_silent() {
        let mut ip_map = HashMap::new();
        ip_map.insert("192.168.1.108".to_string(), "camera1".to_string());

        // Payload declares a device id: self-declared identity wins
        let event = Event::from_payload(
            RawPayload::Json(json!({ "DeviceID": "CAM_9" })),
            Some("192.168.1.108"),
            &ip_map,
        );
        assert_eq!(event.source_camera, "CAM_9");

        // Payload is silent: the IP table resolves
        let event = Event::from_payload(
            RawPayload::Json(json!({})),
            Some("192.168.1.108"),
            &ip_map,
        );
        assert_eq!(event.source_camera, "camera1");

        // Unmapped IP: sentinel
        let event =
            Event::from_payload(RawPayload::Json(json!({})), Some("10.0.0.1"), &ip_map);
        assert_eq!(event.source_camera, UNKNOWN_CAMERA);
    }

    #[test]
    fn test_raw_payload_gets_sentinels() {
        let event = Event::from_payload(
            RawPayload::Raw(Bytes::from_static(b"garbage")),
            None,
            &HashMap::new(),
        );
        assert_eq!(event.plate_number, UNKNOWN_PLATE);
        assert_eq!(event.source_camera, UNKNOWN_CAMERA);
        assert!(event.images.is_empty());
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = normalize(json!({}));
        let b = normalize(json!({}));
        assert_ne!(a.event_id, b.event_id);
    }
}
