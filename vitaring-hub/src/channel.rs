/*!
Live channel capability.

A channel subscribes to exactly one device path on the push feed and hands
raw payloads to the hub unmodified. It owns no business logic: the only thing
it decides is when the path has gone absent, and it reports that once per
transition.
*/

use crate::error::{Result, TelemetryError};
use crate::models::DeviceId;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LostReason {
    /// The feed reports no data at the device path.
    PathAbsent,
    /// The subscription could not be set up (connection, permission, runtime).
    SetupFailed(String),
}

impl LostReason {
    pub fn to_error(&self) -> TelemetryError {
        match self {
            LostReason::PathAbsent => TelemetryError::FeedLost,
            LostReason::SetupFailed(msg) => TelemetryError::SubscriptionSetup(msg.clone()),
        }
    }
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_error())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lost {
    pub reason: LostReason,
    /// False when the path never delivered anything since `open`.
    pub was_receiving: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Unknown,
    Present,
    Absent,
}

pub type RecordHandler = Arc<dyn Fn(Value) + Send + Sync>;
pub type LostHandler = Arc<dyn Fn(Lost) + Send + Sync>;

/// Callbacks handed to a channel on `open`, plus the absence edge detector.
#[derive(Clone)]
pub struct FeedSignal {
    on_record: RecordHandler,
    on_lost: LostHandler,
    presence: Arc<Mutex<(Presence, bool)>>,
}

impl FeedSignal {
    pub fn new<R, L>(on_record: R, on_lost: L) -> Self
    where
        R: Fn(Value) + Send + Sync + 'static,
        L: Fn(Lost) + Send + Sync + 'static,
    {
        Self {
            on_record: Arc::new(on_record),
            on_lost: Arc::new(on_lost),
            presence: Arc::new(Mutex::new((Presence::Unknown, false))),
        }
    }

    pub fn record(&self, raw: Value) {
        {
            let mut presence = self.presence.lock();
            *presence = (Presence::Present, true);
        }
        (self.on_record)(raw);
    }

    pub fn absent(&self) {
        self.lost(LostReason::PathAbsent);
    }

    pub fn setup_failed(&self, err: impl fmt::Display) {
        error!("live channel setup failed: {err}");
        self.lost(LostReason::SetupFailed(err.to_string()));
    }

    pub fn has_received(&self) -> bool {
        self.presence.lock().1
    }

    fn lost(&self, reason: LostReason) {
        let was_receiving = {
            let mut presence = self.presence.lock();
            if presence.0 == Presence::Absent {
                debug!("feed still absent ({reason}), not signalling again");
                return;
            }
            presence.0 = Presence::Absent;
            presence.1
        };
        (self.on_lost)(Lost { reason, was_receiving });
    }
}

impl fmt::Debug for FeedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSignal")
            .field("presence", &self.presence.lock().0)
            .finish_non_exhaustive()
    }
}

/// Subscription to one device path. At most one `open` is active at a time;
/// the hub closes before reopening. `close` must be idempotent.
///
/// The hub holds its lock across `open` and `close`, so implementations must
/// not call into the signal from either; deliver from a task or another thread.
pub trait LiveChannel: Send {
    fn open(&mut self, device_id: &DeviceId, signal: FeedSignal) -> Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

/// `<root>/<deviceId>`
pub fn feed_path(root: &str, device_id: &DeviceId) -> String {
    format!("{}/{}", root.trim_end_matches('/'), device_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_signal() -> (FeedSignal, Arc<AtomicUsize>, Arc<Mutex<Vec<Lost>>>) {
        let records = Arc::new(AtomicUsize::new(0));
        let losts = Arc::new(Mutex::new(Vec::new()));
        let r = records.clone();
        let l = losts.clone();
        let signal = FeedSignal::new(
            move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            },
            move |lost| l.lock().push(lost),
        );
        (signal, records, losts)
    }

    #[test]
    fn test_absent_fires_once_per_transition() {
        let (signal, records, losts) = counting_signal();

        signal.absent();
        signal.absent();
        assert_eq!(losts.lock().len(), 1);
        assert!(!losts.lock()[0].was_receiving);

        signal.record(json!({"bpx": 80}));
        signal.absent();
        signal.absent();
        assert_eq!(records.load(Ordering::SeqCst), 1);
        assert_eq!(losts.lock().len(), 2);
        assert!(losts.lock()[1].was_receiving);
    }

    #[test]
    fn test_setup_failure_counts_as_absence() {
        let (signal, _, losts) = counting_signal();

        signal.setup_failed("connection refused");
        signal.absent();

        let losts = losts.lock();
        assert_eq!(losts.len(), 1);
        assert!(matches!(losts[0].reason, LostReason::SetupFailed(ref m) if m == "connection refused"));
    }

    #[test]
    fn test_payload_is_forwarded_unmodified() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let signal = FeedSignal::new(move |raw| *s.lock() = Some(raw), |_| {});

        signal.record(json!({"bpx": "garbled", "extra": [1]}));
        assert_eq!(*seen.lock(), Some(json!({"bpx": "garbled", "extra": [1]})));
        assert!(signal.has_received());
    }

    #[test]
    fn test_feed_path() {
        let id = DeviceId::new("ESP32C3-A835B29E9EF0").unwrap();
        assert_eq!(feed_path("realtimeSensorData/", &id), "realtimeSensorData/ESP32C3-A835B29E9EF0");
    }
}
