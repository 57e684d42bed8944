/*!
# VitaRing DevKit - test doubles for the telemetry hub

- `MockFeed`: in-memory live channel, driven from the test
- `SensorPayloadBuilder`: ring payloads in the feed's wire vocabulary
- `HubHarness`: hub wired to a `MockFeed` plus a subscription recorder
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{ChannelEvent, MockFeed, SensorPayloadBuilder};
pub use test_utils::HubHarness;
