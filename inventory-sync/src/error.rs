use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("could not decode platform response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("inventory level listing requires a location filter")]
    MissingLocationFilter,

    #[error("platform client is not configured: {0}")]
    NotConfigured(&'static str),
}

impl PlatformError {
    /// Network trouble, 5xx and 429 are worth retrying; everything else is
    /// a problem with the request itself.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Http { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            PlatformError::Request(e) => !e.is_decode() && !e.is_builder(),
            PlatformError::Decode(_)
            | PlatformError::MissingLocationFilter
            | PlatformError::NotConfigured(_) => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PlatformError::Http { status, .. } => Some(*status),
            PlatformError::Request(e) => e.status(),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    Invalid(String),
}

impl<E: std::error::Error + 'static> From<bb8::RunError<E>> for StoreError {
    fn from(e: bb8::RunError<E>) -> Self {
        StoreError::Pool(e.to_string())
    }
}

impl From<shared::ParseEnumError> for StoreError {
    fn from(e: shared::ParseEnumError) -> Self {
        StoreError::Invalid(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
}
