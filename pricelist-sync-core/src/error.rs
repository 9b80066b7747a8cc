use thiserror::Error;

/// Failure of a single upstream request. Always considered transient by the fetcher.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Parse(err.to_string())
        } else {
            SourceError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Parse(err.to_string())
    }
}

/// Failure reported by a [`crate::contract::ListStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Change subscription lagged, {0} batches dropped")]
    Lagged(u64),

    #[error("Store error: {0}")]
    Other(String),
}

/// Why an upstream response could not become a [`crate::record::ListRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("upstream response is not a JSON object")]
    NotAnObject,

    #[error("missing or empty `id`")]
    MissingId,

    #[error("missing `validUntil`")]
    MissingValidUntil,

    #[error("unparseable `validUntil` {0}")]
    InvalidValidUntil(String),
}

/// Every failure kind the sync loop can observe. None of them stop the loop; they are logged
/// and the loop re-arms.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Fetch attempt {attempt} failed: {source}")]
    FetchTransient {
        attempt: u32,
        #[source]
        source: SourceError,
    },

    #[error("Fetch gave up after {attempts} attempts")]
    FetchExhausted { attempts: u32 },

    #[error("Malformed upstream record: {0}")]
    MalformedRecord(#[from] MalformedRecord),

    #[error("Failed to persist list {id}: {source}")]
    StoreWrite {
        id: String,
        #[source]
        source: StoreError,
    },

    #[error("Store notification failed: {0}")]
    StoreNotification(#[source] StoreError),

    #[error("Failed to prune stored list {key}: {source}")]
    PruneDelete {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Invalid sync config: {0}")]
    InvalidConfig(String),
}
