/*!
Payload normalization for the live feed.

Field names drifted across ring firmware revisions, so every field is looked
up through an ordered alias table. A value is taken from the first alias that
is present with the right JSON type; otherwise the previous accepted record
supplies it, and failing that a fixed engineering default.
*/

use crate::error::TelemetryError;
use crate::models::{DeviceId, RecordKind, TelemetryRecord};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

pub const DEFAULT_ALTITUDE_M: f64 = 111.41;
pub const DEFAULT_AMBIENT_TEMP_C: f64 = 31.91;
pub const DEFAULT_SURFACE_TEMP_C: f64 = 31.3;
pub const DEFAULT_OBJECT_TEMP_C: f64 = 33.41;
pub const DEFAULT_PULSE_PROXY: u32 = 75;
pub const DEFAULT_INFRARED: u32 = 1250;
/// Standard sea-level pressure.
pub const DEFAULT_PRESSURE_HPA: f64 = 1013.25;
pub const DEFAULT_BATTERY_PERCENT: f64 = 85.0;

pub const ALTITUDE_KEYS: &[&str] = &["altitude", "alt"];
pub const AMBIENT_TEMP_KEYS: &[&str] = &["ambTemp", "amgTemp", "ambientTemp"];
pub const SURFACE_TEMP_KEYS: &[&str] = &["bmpTemp", "surfaceTemp"];
pub const OBJECT_TEMP_KEYS: &[&str] = &["objTemp", "objectTemp", "temperature"];
pub const PULSE_KEYS: &[&str] = &["bpx", "heartRate", "pulse"];
pub const INFRARED_KEYS: &[&str] = &["irValue", "ir"];
pub const PRESSURE_KEYS: &[&str] = &["pressure", "bmpPressure"];
pub const BATTERY_KEYS: &[&str] = &["batteryLevel", "battery"];
pub const DEVICE_ID_KEYS: &[&str] = &["deviceID", "deviceId"];
pub const DEVICE_NAME_KEYS: &[&str] = &["deviceName"];
pub const POWERED_ON_KEYS: &[&str] = &["isDeviceOn", "deviceOn", "isOnline"];
pub const REACHABLE_KEYS: &[&str] = &["isOnline", "online", "isDeviceOn"];
pub const TIMESTAMP_KEYS: &[&str] = &["timestamp", "ts"];
pub const KIND_KEYS: &[&str] = &["type"];

/// Converts raw feed payloads for one subscribed device into complete records.
#[derive(Debug, Clone)]
pub struct PayloadNormalizer {
    device_id: DeviceId,
}

impl PayloadNormalizer {
    pub fn for_device(device_id: DeviceId) -> Self {
        Self { device_id }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn normalize(&self, raw: &Value, fallback: Option<&TelemetryRecord>) -> TelemetryRecord {
        self.normalize_at(raw, fallback, OffsetDateTime::now_utc())
    }

    pub fn normalize_at(
        &self,
        raw: &Value,
        fallback: Option<&TelemetryRecord>,
        now: OffsetDateTime,
    ) -> TelemetryRecord {
        let empty = Map::new();
        let fields = match raw {
            Value::Object(map) => map,
            other => {
                debug!("payload is not an object ({}), using fallbacks only", json_kind(other));
                &empty
            }
        };
        let reader = FieldReader { fields };

        let captured_at = reader.timestamp(TIMESTAMP_KEYS).unwrap_or(now);

        let record = TelemetryRecord {
            altitude: reader
                .float(ALTITUDE_KEYS)
                .or(fallback.map(|f| f.altitude))
                .unwrap_or(DEFAULT_ALTITUDE_M),
            ambient_temperature: reader
                .float(AMBIENT_TEMP_KEYS)
                .or(fallback.map(|f| f.ambient_temperature))
                .unwrap_or(DEFAULT_AMBIENT_TEMP_C),
            surface_temperature: reader
                .float(SURFACE_TEMP_KEYS)
                .or(fallback.map(|f| f.surface_temperature))
                .unwrap_or(DEFAULT_SURFACE_TEMP_C),
            object_temperature: reader
                .float(OBJECT_TEMP_KEYS)
                .or(fallback.map(|f| f.object_temperature))
                .unwrap_or(DEFAULT_OBJECT_TEMP_C),
            pulse_proxy_value: reader
                .unsigned(PULSE_KEYS)
                .or(fallback.map(|f| f.pulse_proxy_value))
                .unwrap_or(DEFAULT_PULSE_PROXY),
            infrared_value: reader
                .unsigned(INFRARED_KEYS)
                .or(fallback.map(|f| f.infrared_value))
                .unwrap_or(DEFAULT_INFRARED),
            barometric_pressure: reader
                .float(PRESSURE_KEYS)
                .or(fallback.map(|f| f.barometric_pressure))
                .unwrap_or(DEFAULT_PRESSURE_HPA),
            battery_level: reader
                .float(BATTERY_KEYS)
                .or(fallback.map(|f| f.battery_level))
                .unwrap_or(DEFAULT_BATTERY_PERCENT),
            device_id: reader
                .device_id(DEVICE_ID_KEYS)
                .or_else(|| fallback.map(|f| f.device_id.clone()))
                .unwrap_or_else(|| self.device_id.clone()),
            device_display_name: reader
                .text(DEVICE_NAME_KEYS)
                .or_else(|| fallback.and_then(|f| f.device_display_name.clone())),
            powered_on: reader
                .flag(POWERED_ON_KEYS)
                .or(fallback.map(|f| f.powered_on))
                .unwrap_or(true),
            reachable: reader
                .flag(REACHABLE_KEYS)
                .or(fallback.map(|f| f.reachable))
                .unwrap_or(true),
            captured_at,
            record_kind: reader
                .text(KIND_KEYS)
                .and_then(|label| RecordKind::from_feed_label(&label))
                .or(fallback.map(|f| f.record_kind))
                .unwrap_or(RecordKind::Sensor),
        };
        settle(record, fallback)
    }
}

/// Final pass shared by every source before a record becomes `current`:
/// battery within 0..=100 and `captured_at` never earlier than the record it replaces.
pub fn settle(mut record: TelemetryRecord, previous: Option<&TelemetryRecord>) -> TelemetryRecord {
    record.battery_level = if record.battery_level.is_finite() {
        record.battery_level.clamp(0.0, 100.0)
    } else {
        previous.map_or(DEFAULT_BATTERY_PERCENT, |p| p.battery_level)
    };
    if let Some(prev) = previous {
        if record.captured_at < prev.captured_at {
            record.captured_at = prev.captured_at;
        }
    }
    record
}

struct FieldReader<'a> {
    fields: &'a Map<String, Value>,
}

impl FieldReader<'_> {
    /// Walks the aliases in order and returns the first value that converts.
    fn first<T>(&self, keys: &'static [&'static str], convert: impl Fn(&Value) -> Option<T>) -> Option<T> {
        for key in keys {
            let Some(value) = self.fields.get(*key).filter(|v| !v.is_null()) else {
                continue;
            };
            match convert(value) {
                Some(converted) => return Some(converted),
                None => debug!("{}", TelemetryError::MalformedPayload { field: *key }),
            }
        }
        None
    }

    fn float(&self, keys: &'static [&'static str]) -> Option<f64> {
        self.first(keys, |v| v.as_f64().filter(|f| f.is_finite()))
    }

    fn unsigned(&self, keys: &'static [&'static str]) -> Option<u32> {
        self.first(keys, |v| {
            v.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && *f <= u32::MAX as f64)
                .map(|f| f.round() as u32)
        })
    }

    fn flag(&self, keys: &'static [&'static str]) -> Option<bool> {
        self.first(keys, coerce_flag)
    }

    fn text(&self, keys: &'static [&'static str]) -> Option<String> {
        self.first(keys, |v| {
            v.as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }

    fn device_id(&self, keys: &'static [&'static str]) -> Option<DeviceId> {
        self.first(keys, |v| v.as_str().and_then(|s| DeviceId::new(s).ok()))
    }

    fn timestamp(&self, keys: &'static [&'static str]) -> Option<OffsetDateTime> {
        self.first(keys, parse_timestamp)
    }
}

/// Controlled truthy/falsy coercion; anything outside the table is absent.
pub fn coerce_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "yes" => Some(true),
            "false" | "0" | "off" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// RFC 3339 strings, or numbers as Unix epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(s) => OffsetDateTime::parse(s.trim(), &Rfc3339).ok(),
        Value::Number(n) => {
            let millis = n.as_f64().filter(|f| f.is_finite() && *f >= 0.0)?;
            OffsetDateTime::from_unix_timestamp_nanos((millis as i128) * 1_000_000).ok()
        }
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn normalizer() -> PayloadNormalizer {
        PayloadNormalizer::for_device(DeviceId::new("ESP32C3-A835B29E9EF0").unwrap())
    }

    const NOW: OffsetDateTime = datetime!(2025-06-01 10:00:00 UTC);

    #[test]
    fn test_partial_payload_uses_defaults() {
        let raw = json!({"bmpTemp": 31.3, "bpx": 75, "deviceID": "A"});
        let record = normalizer().normalize_at(&raw, None, NOW);

        assert_eq!(record.pulse_proxy_value, 75);
        assert_eq!(record.surface_temperature, 31.3);
        assert_eq!(record.barometric_pressure, DEFAULT_PRESSURE_HPA);
        assert_eq!(record.device_id.as_str(), "A");
        assert_eq!(record.captured_at, NOW);
        assert_eq!(record.record_kind, RecordKind::Sensor);
        assert!(record.powered_on);
        assert!(record.reachable);
    }

    #[test]
    fn test_every_subset_is_fully_populated() {
        let full = json!({
            "altitude": 120.5, "ambTemp": 29.0, "bmpTemp": 30.1, "objTemp": 34.2,
            "bpx": 82, "irValue": 1400, "pressure": 1001.3, "batteryLevel": 64,
            "deviceID": "ESP32C3-A835B29E9EF0", "deviceName": "VitaRing Pro Max",
            "isDeviceOn": true, "isOnline": false, "timestamp": "2025-06-01T09:59:00Z",
            "type": "sensor_data"
        });
        let keys: Vec<String> = full.as_object().unwrap().keys().cloned().collect();

        // Drop one key at a time, then every prefix of the key list.
        let mut subsets: Vec<Vec<&String>> = keys.iter().map(|k| vec![k]).collect();
        for n in 0..=keys.len() {
            subsets.push(keys.iter().take(n).collect());
        }

        for removed in subsets {
            let mut raw = full.clone();
            for key in &removed {
                raw.as_object_mut().unwrap().remove(*key);
            }
            let record = normalizer().normalize_at(&raw, None, NOW);
            for value in [
                record.altitude,
                record.ambient_temperature,
                record.surface_temperature,
                record.object_temperature,
                record.barometric_pressure,
                record.battery_level,
            ] {
                assert!(value.is_finite(), "non-finite field after removing {removed:?}");
            }
            assert!(!record.device_id.as_str().is_empty());
        }
    }

    #[test]
    fn test_fallback_precedes_default() {
        let first = normalizer().normalize_at(&json!({"pressure": 998.2, "bpx": 90}), None, NOW);
        let second = normalizer().normalize_at(&json!({"bpx": 70}), Some(&first), NOW);

        assert_eq!(second.barometric_pressure, 998.2);
        assert_eq!(second.pulse_proxy_value, 70);
    }

    #[test]
    fn test_wrong_types_are_absent() {
        let raw = json!({
            "pressure": "1000.5", "bpx": -4, "altitude": [1, 2],
            "isDeviceOn": "maybe", "deviceID": "", "deviceName": 12
        });
        let record = normalizer().normalize_at(&raw, None, NOW);

        assert_eq!(record.barometric_pressure, DEFAULT_PRESSURE_HPA);
        assert_eq!(record.pulse_proxy_value, DEFAULT_PULSE_PROXY);
        assert_eq!(record.altitude, DEFAULT_ALTITUDE_M);
        assert!(record.powered_on);
        assert_eq!(record.device_id.as_str(), "ESP32C3-A835B29E9EF0");
        assert_eq!(record.device_display_name, None);
    }

    #[test]
    fn test_alias_precedence() {
        // Firestore revision: amgTemp and heartRate, isOnline only.
        let raw = json!({"amgTemp": 27.5, "heartRate": 88.4, "isOnline": false});
        let record = normalizer().normalize_at(&raw, None, NOW);
        assert_eq!(record.ambient_temperature, 27.5);
        assert_eq!(record.pulse_proxy_value, 88);
        assert!(!record.powered_on);
        assert!(!record.reachable);

        // First alias wins when both are present.
        let raw = json!({"isDeviceOn": true, "isOnline": false});
        let record = normalizer().normalize_at(&raw, None, NOW);
        assert!(record.powered_on);
        assert!(!record.reachable);

        // A malformed first alias falls through to the next one.
        let raw = json!({"bpx": "n/a", "heartRate": 64});
        let record = normalizer().normalize_at(&raw, None, NOW);
        assert_eq!(record.pulse_proxy_value, 64);
    }

    #[test]
    fn test_flag_coercion_table() {
        assert_eq!(coerce_flag(&json!(true)), Some(true));
        assert_eq!(coerce_flag(&json!(0)), Some(false));
        assert_eq!(coerce_flag(&json!(1)), Some(true));
        assert_eq!(coerce_flag(&json!(" ON ")), Some(true));
        assert_eq!(coerce_flag(&json!("no")), Some(false));
        assert_eq!(coerce_flag(&json!("offline")), None);
        assert_eq!(coerce_flag(&json!(null)), None);
        assert_eq!(coerce_flag(&json!({})), None);
    }

    #[test]
    fn test_zero_is_a_reading() {
        let record = normalizer().normalize_at(&json!({"altitude": 0, "irValue": 0}), None, NOW);
        assert_eq!(record.altitude, 0.0);
        assert_eq!(record.infrared_value, 0);
    }

    #[test]
    fn test_timestamp_forms_and_monotonic_clamp() {
        let rfc = normalizer().normalize_at(&json!({"timestamp": "2025-06-01T09:00:00Z"}), None, NOW);
        assert_eq!(rfc.captured_at, datetime!(2025-06-01 09:00:00 UTC));

        let millis = normalizer().normalize_at(&json!({"ts": 1_748_768_400_000u64}), None, NOW);
        assert_eq!(millis.captured_at, datetime!(2025-06-01 09:00:00 UTC));

        let garbage = normalizer().normalize_at(&json!({"timestamp": "yesterday"}), None, NOW);
        assert_eq!(garbage.captured_at, NOW);

        // An older capture never moves the clock backwards.
        let older = normalizer().normalize_at(
            &json!({"timestamp": "2025-06-01T08:00:00Z"}),
            Some(&rfc),
            NOW,
        );
        assert_eq!(older.captured_at, rfc.captured_at);
    }

    #[test]
    fn test_non_object_payload() {
        let record = normalizer().normalize_at(&json!("garbled"), None, NOW);
        assert_eq!(record.pulse_proxy_value, DEFAULT_PULSE_PROXY);
        assert_eq!(record.device_id.as_str(), "ESP32C3-A835B29E9EF0");
    }

    #[test]
    fn test_battery_is_clamped() {
        let record = normalizer().normalize_at(&json!({"batteryLevel": 140}), None, NOW);
        assert_eq!(record.battery_level, 100.0);
    }

    #[test]
    fn test_settle_typed_record_against_previous() {
        let previous = normalizer().normalize_at(&json!({"battery": 40}), None, NOW);
        let mut generated = normalizer().normalize_at(&json!({"type": "demo"}), None, datetime!(2025-06-01 09:59:00 UTC));
        generated.battery_level = 130.0;

        let settled = settle(generated, Some(&previous));
        assert_eq!(settled.captured_at, NOW);
        assert_eq!(settled.battery_level, 100.0);
        assert_eq!(settled.record_kind, RecordKind::Demo);

        let mut broken = previous.clone();
        broken.battery_level = f64::NAN;
        assert_eq!(settle(broken, Some(&previous)).battery_level, 40.0);
    }

    #[test]
    fn test_unknown_kind_keeps_fallback() {
        let first = normalizer().normalize_at(&json!({"type": "outdoor"}), None, NOW);
        let second = normalizer().normalize_at(&json!({"type": "v3-frame"}), Some(&first), NOW);
        assert_eq!(second.record_kind, RecordKind::Outdoor);
    }
}
