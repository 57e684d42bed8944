/*!
VitaRing telemetry hub.

Keeps one authoritative view of a single ring's latest readings, fed either
by the live push feed or by the synthetic scenario generator, and streams
every change to subscribers.
*/

pub mod channel;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod hub;
pub mod identity;
pub mod models;
pub mod mqtt;
pub mod normalizer;
pub mod state;
pub mod synthetic;

pub use channel::{FeedSignal, LiveChannel, Lost, LostReason};
pub use error::{Result, TelemetryError};
pub use hub::{HubPhase, HubSettings, Subscription, TelemetryHub};
pub use identity::{DeviceIdentityResolver, IdentityMatch};
pub use models::{ConnectionStatus, DeviceId, DeviceState, RecordKind, SourceMode, TelemetryRecord};
pub use normalizer::PayloadNormalizer;
pub use synthetic::Scenario;
