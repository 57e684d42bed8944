/*!
Test harness for the telemetry hub

Builds a hub over a `MockFeed`, subscribes before anything happens and
offers assertions over the publications it has seen.
*/

use crate::mqtt_stub::MockFeed;
use anyhow::Result;
use std::time::Duration;
use tokio::time::timeout;
use vitaring_hub::{
    ConnectionStatus, DeviceId, DeviceIdentityResolver, DeviceState, HubSettings, Subscription, TelemetryHub,
};

pub const ACTIVE_ID: &str = "ESP32C3-A835B29E9EF0";
pub const LEGACY_ID: &str = "ESP32C3-A835629EDEF8";

pub struct HubHarness {
    pub hub: TelemetryHub,
    pub feed: MockFeed,
    subscription: Subscription,
    seen: Vec<DeviceState>,
}

impl HubHarness {
    /// Seeded synthetic source, 100 ms restart grace.
    pub fn new() -> Result<Self> {
        Self::with_settings(HubSettings {
            restart_grace: Duration::from_millis(100),
            synthetic_seed: Some(7),
            ..HubSettings::default()
        })
    }

    pub fn with_settings(settings: HubSettings) -> Result<Self> {
        env_logger::try_init().ok();

        let feed = MockFeed::new();
        let resolver = DeviceIdentityResolver::new(DeviceId::new(ACTIVE_ID)?, vec![DeviceId::new(LEGACY_ID)?]);
        let hub = TelemetryHub::new(settings, Box::new(feed.clone()), resolver);
        let mut subscription = hub.subscribe();
        let seen = subscription.drain();
        anyhow::ensure!(seen.len() == 1, "expected one initial snapshot, got {}", seen.len());

        Ok(Self { hub, feed, subscription, seen })
    }

    /// Publications received since the last call, not counting the initial snapshot.
    pub fn take_published(&mut self) -> Vec<DeviceState> {
        let fresh = self.subscription.drain();
        self.seen.extend(fresh.iter().cloned());
        fresh
    }

    /// Waits up to `ms` for the next publication.
    pub async fn next_published(&mut self, ms: u64) -> Option<DeviceState> {
        let state = timeout(Duration::from_millis(ms), self.subscription.recv()).await.ok()??;
        self.seen.push(state.clone());
        Some(state)
    }

    /// Every publication observed so far, initial snapshot first.
    pub fn history(&self) -> &[DeviceState] {
        &self.seen
    }

    pub fn assert_published_count(&mut self, expected: usize) -> Result<Vec<DeviceState>> {
        let fresh = self.take_published();
        if fresh.len() != expected {
            anyhow::bail!("expected {expected} publications, got {}: {:#?}", fresh.len(), fresh);
        }
        log::info!("{expected} publications as expected");
        Ok(fresh)
    }

    pub fn assert_connection(&self, expected: ConnectionStatus) -> Result<()> {
        let actual = self.hub.snapshot().connection;
        anyhow::ensure!(actual == expected, "connection is {actual:?}, expected {expected:?}");
        Ok(())
    }

    /// Checks the state-level invariants on every publication seen so far.
    pub fn assert_consistent(&self) -> Result<()> {
        for state in &self.seen {
            if state.connection == ConnectionStatus::Online {
                anyhow::ensure!(state.current.is_some(), "online without a record: {state:?}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_stub::SensorPayloadBuilder;

    #[tokio::test]
    async fn test_harness_basic_functionality() {
        let mut harness = HubHarness::new().unwrap();
        assert_eq!(harness.history().len(), 1);

        harness.hub.start_live_resolved().unwrap();
        harness.feed.push(SensorPayloadBuilder::resting(ACTIVE_ID));

        let fresh = harness.assert_published_count(2).unwrap();
        assert_eq!(fresh[1].current.as_ref().unwrap().pulse_proxy_value, 68);
        harness.assert_connection(ConnectionStatus::Online).unwrap();
        harness.assert_consistent().unwrap();
        assert!(harness.next_published(20).await.is_none());
    }
}
