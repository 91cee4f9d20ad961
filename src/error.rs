use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("collector failed: {0}")]
    Collector(String),

    #[error("malformed response from {source_name}: {detail}")]
    MalformedResponse { source_name: String, detail: String },

    #[error("cannot write fingerprint store {}: {source}", path.display())]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scan cancelled")]
    Cancelled,

    #[error("tool registry: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Errors that must stop processing instead of degrading to an empty signal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StoreWrite { .. } | Error::Cancelled | Error::InvalidTarget(_) | Error::InvalidPort(_)
        )
    }

    pub fn malformed(source_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::MalformedResponse {
            source_name: source_name.into(),
            detail: detail.into(),
        }
    }
}
