/// Bridge error types.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("MQTT connection error: {0}")]
    Connection(String),

    #[error("MQTT broker did not acknowledge the connection within {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscription { topic: String, reason: String },

    #[error("Failed to decode bird detection: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Failed to load timezone '{0}'")]
    InvalidTimezone(String),

    #[error("Failed to parse time '{input}': {reason}")]
    TimeParse { input: String, reason: String },

    #[error("TimescaleDB error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn subscription(topic: &str, reason: impl ToString) -> Self {
        BridgeError::Subscription {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
