use crate::models::SourceMode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A payload field failed type expectations. Recovered by the normalizer, never returned to consumers.
    #[error("malformed payload field '{field}'")]
    MalformedPayload { field: &'static str },

    #[error("feed reports no data for device path")]
    FeedLost,

    #[error("subscription setup failed: {0}")]
    SubscriptionSetup(String),

    #[error("invalid operator call: {0}")]
    InvalidOperatorCall(String),

    #[error("operation conflicts with active {active} source")]
    SourceConflict { active: SourceMode },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = TelemetryError> = std::result::Result<T, E>;
