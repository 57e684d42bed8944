use crate::error::TelemetryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Physical device identifier, used as the last segment of the feed path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self, TelemetryError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(TelemetryError::InvalidOperatorCall(
                "device id must not be empty".into(),
            ));
        }
        if trimmed.contains(['/', '#', '+']) {
            return Err(TelemetryError::InvalidOperatorCall(format!(
                "device id '{trimmed}' contains a path separator or wildcard"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last six characters, as printed on the ring's packaging.
    pub fn short_suffix(&self) -> &str {
        let start = self
            .0
            .char_indices()
            .rev()
            .nth(5)
            .map(|(i, _)| i)
            .unwrap_or(0);
        &self.0[start..]
    }
}

impl TryFrom<String> for DeviceId {
    type Error = TelemetryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Sensor,
    Demo,
    Exercise,
    Rest,
    Outdoor,
    LowBattery,
}

impl RecordKind {
    /// Maps the feed's `type` field. Firmware publishes `sensor_data`.
    pub fn from_feed_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "sensor" | "sensor_data" => Some(Self::Sensor),
            "demo" => Some(Self::Demo),
            "exercise" => Some(Self::Exercise),
            "rest" => Some(Self::Rest),
            "outdoor" => Some(Self::Outdoor),
            "low_battery" | "low-battery" => Some(Self::LowBattery),
            _ => None,
        }
    }
}

/// One fully-populated snapshot of the ring's sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub altitude: f64,
    pub ambient_temperature: f64,
    pub surface_temperature: f64,
    pub object_temperature: f64,
    pub pulse_proxy_value: u32,
    pub infrared_value: u32,
    pub barometric_pressure: f64,
    pub battery_level: f64,
    pub device_id: DeviceId,
    pub device_display_name: Option<String>,
    pub powered_on: bool,
    pub reachable: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub record_kind: RecordKind,
}

impl TelemetryRecord {
    pub fn display_name(&self) -> String {
        match &self.device_display_name {
            Some(name) => name.clone(),
            None => format!("VitaRing {}", self.device_id.short_suffix()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline,
    ManualOffline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Live,
    Synthetic,
    None,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceMode::Live => "live",
            SourceMode::Synthetic => "synthetic",
            SourceMode::None => "none",
        };
        f.write_str(label)
    }
}

/// The hub's single current truth, always broadcast whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub current: Option<TelemetryRecord>,
    pub connection: ConnectionStatus,
    pub active_device_id: DeviceId,
    pub source_mode: SourceMode,
}

impl DeviceState {
    pub fn initial(active_device_id: DeviceId) -> Self {
        Self {
            current: None,
            connection: ConnectionStatus::Offline,
            active_device_id,
            source_mode: SourceMode::None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.connection == ConnectionStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_validation() {
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("   ").is_err());
        assert!(DeviceId::new("realtime/ESP32").is_err());
        assert!(DeviceId::new("ESP32#").is_err());
        assert_eq!(DeviceId::new(" ESP32C3-A835B29E9EF0 ").unwrap().as_str(), "ESP32C3-A835B29E9EF0");
    }

    #[test]
    fn test_short_suffix() {
        let id = DeviceId::new("ESP32C3-A835B29E9EF0").unwrap();
        assert_eq!(id.short_suffix(), "9E9EF0");
        let short = DeviceId::new("A").unwrap();
        assert_eq!(short.short_suffix(), "A");
    }

    #[test]
    fn test_device_id_rejects_empty_on_deserialize() {
        let parsed: Result<DeviceId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
        let parsed: DeviceId = serde_json::from_str("\"ESP32C3-A835629EDEF8\"").unwrap();
        assert_eq!(parsed.as_str(), "ESP32C3-A835629EDEF8");
    }

    #[test]
    fn test_record_kind_labels() {
        assert_eq!(RecordKind::from_feed_label("sensor_data"), Some(RecordKind::Sensor));
        assert_eq!(RecordKind::from_feed_label(" Exercise "), Some(RecordKind::Exercise));
        assert_eq!(RecordKind::from_feed_label("low-battery"), Some(RecordKind::LowBattery));
        assert_eq!(RecordKind::from_feed_label("firmware_v2"), None);
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = DeviceState::initial(DeviceId::new("A").unwrap());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["activeDeviceId"], "A");
        assert_eq!(json["connection"], "offline");
        assert_eq!(json["sourceMode"], "none");
        assert!(json["current"].is_null());
    }
}
