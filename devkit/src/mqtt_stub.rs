/*!
Mock live feed for developing without a broker

Implements the hub's `LiveChannel` in memory. Every effective open and close
is recorded, and the test pushes payloads or absences on the open path.
Pushes happen outside the mock's own lock, from the caller's thread.
*/

use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use vitaring_hub::mqtt::{decode_payload, FeedEvent};
use vitaring_hub::{DeviceId, FeedSignal, LiveChannel, Result, TelemetryError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open(String),
    Close(String),
}

#[derive(Default)]
struct FeedInner {
    open: Option<(DeviceId, FeedSignal)>,
    events: Vec<ChannelEvent>,
    refuse_next_open: Option<String>,
}

/// Cloneable handle; the hub owns one clone, the test keeps another.
#[derive(Clone, Default)]
pub struct MockFeed {
    inner: Arc<Mutex<FeedInner>>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_signal(&self) -> Option<FeedSignal> {
        self.lock().open.as_ref().map(|(_, signal)| signal.clone())
    }

    /// Delivers `raw` on the open path. Returns false when nothing is open.
    pub fn push(&self, raw: Value) -> bool {
        match self.current_signal() {
            Some(signal) => {
                log::info!("[MOCK] feed push: {raw}");
                signal.record(raw);
                true
            }
            None => false,
        }
    }

    /// Delivers bytes the way a retained message would arrive.
    pub fn push_bytes(&self, payload: &[u8]) -> bool {
        match decode_payload(payload) {
            FeedEvent::Record(raw) => self.push(raw),
            FeedEvent::Absent => self.push_absent(),
        }
    }

    pub fn push_absent(&self) -> bool {
        match self.current_signal() {
            Some(signal) => {
                log::info!("[MOCK] feed path absent");
                signal.absent();
                true
            }
            None => false,
        }
    }

    /// Simulates a connection or permission failure on the open subscription.
    pub fn fail_setup(&self, reason: &str) -> bool {
        match self.current_signal() {
            Some(signal) => {
                signal.setup_failed(reason);
                true
            }
            None => false,
        }
    }

    /// The next `open` fails with `SubscriptionSetup(reason)`.
    pub fn refuse_next_open(&self, reason: &str) {
        self.lock().refuse_next_open = Some(reason.to_string());
    }

    /// Signal of the currently open path, kept by tests that want to deliver
    /// late events after a close.
    pub fn signal(&self) -> Option<FeedSignal> {
        self.current_signal()
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.lock().events.clone()
    }

    pub fn open_device(&self) -> Option<String> {
        self.lock().open.as_ref().map(|(id, _)| id.to_string())
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }
}

impl LiveChannel for MockFeed {
    fn open(&mut self, device_id: &DeviceId, signal: FeedSignal) -> Result<()> {
        let mut inner = self.lock();
        if let Some(reason) = inner.refuse_next_open.take() {
            log::info!("[MOCK] refusing open of {device_id}: {reason}");
            return Err(TelemetryError::SubscriptionSetup(reason));
        }
        if inner.open.is_some() {
            return Err(TelemetryError::InvalidOperatorCall("mock feed already open".into()));
        }
        inner.events.push(ChannelEvent::Open(device_id.to_string()));
        inner.open = Some((device_id.clone(), signal));
        Ok(())
    }

    fn close(&mut self) {
        let mut inner = self.lock();
        if let Some((id, _)) = inner.open.take() {
            inner.events.push(ChannelEvent::Close(id.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.lock().open.is_some()
    }
}

/// Ring payloads using the firmware's short field names.
#[derive(Debug, Clone, Default)]
pub struct SensorPayloadBuilder {
    fields: Map<String, Value>,
}

impl SensorPayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn device(self, id: &str) -> Self {
        self.field("deviceID", json!(id))
    }

    pub fn pulse(self, bpx: u32) -> Self {
        self.field("bpx", json!(bpx))
    }

    pub fn surface_temp(self, celsius: f64) -> Self {
        self.field("bmpTemp", json!(celsius))
    }

    pub fn object_temp(self, celsius: f64) -> Self {
        self.field("objTemp", json!(celsius))
    }

    pub fn pressure(self, hpa: f64) -> Self {
        self.field("pressure", json!(hpa))
    }

    pub fn battery(self, percent: f64) -> Self {
        self.field("battery", json!(percent))
    }

    pub fn captured_now(self) -> Self {
        let ts = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        self.field("timestamp", json!(ts))
    }

    /// A complete, plausible resting reading.
    pub fn resting(id: &str) -> Value {
        Self::new()
            .device(id)
            .pulse(68)
            .surface_temp(32.1)
            .object_temp(33.8)
            .pressure(1012.4)
            .battery(91.0)
            .field("ambTemp", json!(24.5))
            .field("altitude", json!(120.0))
            .field("ir", json!(1180))
            .field("type", json!("sensor_data"))
            .build()
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}
