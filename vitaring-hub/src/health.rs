use crate::models::{ConnectionStatus, DeviceId, SourceMode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubHealth {
    pub uptime_seconds: u64,
    pub phase: String,
    pub source_mode: SourceMode,
    pub connection: ConnectionStatus,
    pub active_device_id: DeviceId,
    pub subscribers: usize,
    pub publications: u64,
    pub records_accepted: u64,
    pub lost_signals: u64,
    pub channel_opens: u64,
    pub stale_events_dropped: u64,
    pub restarts: u64,
}

/// Shared counters; clones observe the same values.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    publications: AtomicU64,
    records_accepted: AtomicU64,
    lost_signals: AtomicU64,
    channel_opens: AtomicU64,
    stale_events_dropped: AtomicU64,
    restarts: AtomicU64,
}

/// Point-in-time view of what the hub is doing, supplied by the hub.
pub struct HubView {
    pub phase: String,
    pub source_mode: SourceMode,
    pub connection: ConnectionStatus,
    pub active_device_id: DeviceId,
    pub subscribers: usize,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn mark_published(&self) {
        self.counters.publications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_record_accepted(&self) {
        self.counters.records_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_lost(&self) {
        self.counters.lost_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_channel_opened(&self) {
        self.counters.channel_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_stale_dropped(&self) {
        self.counters.stale_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_restart(&self) {
        self.counters.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self, view: HubView) -> HubHealth {
        let c = &self.counters;
        HubHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            phase: view.phase,
            source_mode: view.source_mode,
            connection: view.connection,
            active_device_id: view.active_device_id,
            subscribers: view.subscribers,
            publications: c.publications.load(Ordering::Relaxed),
            records_accepted: c.records_accepted.load(Ordering::Relaxed),
            lost_signals: c.lost_signals.load(Ordering::Relaxed),
            channel_opens: c.channel_opens.load(Ordering::Relaxed),
            stale_events_dropped: c.stale_events_dropped.load(Ordering::Relaxed),
            restarts: c.restarts.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let tracker = HealthTracker::new();
        let clone = tracker.clone();
        clone.mark_published();
        clone.mark_published();
        tracker.mark_lost();

        let health = tracker.get_health(HubView {
            phase: "idle".into(),
            source_mode: SourceMode::None,
            connection: ConnectionStatus::Offline,
            active_device_id: DeviceId::new("A").unwrap(),
            subscribers: 0,
        });
        assert_eq!(health.publications, 2);
        assert_eq!(health.lost_signals, 1);
        assert_eq!(health.restarts, 0);
    }
}
