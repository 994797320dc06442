use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobdeckError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("geocoding quota exhausted")]
    Quota,

    #[error("fetching {url} failed: {reason}")]
    HttpFetch { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("cannot downgrade version from {current} to {requested}")]
    VersionDowngrade { current: i64, requested: i64 },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, JobdeckError>;

impl From<std::io::Error> for JobdeckError {
    fn from(e: std::io::Error) -> Self {
        JobdeckError::Io(e.to_string())
    }
}

impl From<redb::Error> for JobdeckError {
    fn from(e: redb::Error) -> Self {
        JobdeckError::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for JobdeckError {
    fn from(e: redb::DatabaseError) -> Self {
        JobdeckError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for JobdeckError {
    fn from(e: redb::TransactionError) -> Self {
        JobdeckError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for JobdeckError {
    fn from(e: redb::TableError) -> Self {
        JobdeckError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for JobdeckError {
    fn from(e: redb::StorageError) -> Self {
        JobdeckError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for JobdeckError {
    fn from(e: redb::CommitError) -> Self {
        JobdeckError::Storage(e.to_string())
    }
}

impl From<tantivy::TantivyError> for JobdeckError {
    fn from(e: tantivy::TantivyError) -> Self {
        JobdeckError::Index(e.to_string())
    }
}

impl From<serde_json::Error> for JobdeckError {
    fn from(e: serde_json::Error) -> Self {
        JobdeckError::Decode(e.to_string())
    }
}

impl From<reqwest::Error> for JobdeckError {
    fn from(e: reqwest::Error) -> Self {
        JobdeckError::HttpFetch {
            url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            reason: e.to_string(),
        }
    }
}

impl JobdeckError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            JobdeckError::NotFound(_) => StatusCode::NOT_FOUND,
            JobdeckError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            JobdeckError::Quota => StatusCode::PAYMENT_REQUIRED,
            JobdeckError::HttpFetch { .. } => StatusCode::BAD_GATEWAY,
            JobdeckError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            JobdeckError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            JobdeckError::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            JobdeckError::Index(_) => StatusCode::INTERNAL_SERVER_ERROR,
            JobdeckError::VersionDowngrade { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            JobdeckError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
