//! Error taxonomy for the metadata gateway.
//!
//! Only [`Error::Configuration`] is fatal. Every other variant is a per-request failure that
//! the gateway logs and degrades to "no metadata available".

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Required setting missing or invalid. Raised at construction, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection failure or client timeout while talking to the provider.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Provider answered with a non-success status.
    #[error("provider returned HTTP {status} for {endpoint}")]
    Status { status: u16, endpoint: String },

    /// Provider body was not valid JSON.
    #[error("failed to parse provider response: {0}")]
    Parse(#[from] serde_json::Error),

    /// The cache backend itself failed.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The store cannot enumerate its keys, so a namespace purge is impossible.
    #[error("bulk purge is not supported by this cache store")]
    PurgeUnsupported,
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        Self::CacheUnavailable(error.to_string())
    }
}

impl Error {
    /// True for failures that should be treated as "metadata absent" rather than surfaced.
    pub fn is_degradable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Transport(_) | Self::Status { .. } => "transport",
            Self::Parse(_) => "parse",
            Self::CacheUnavailable(_) => "cache",
            Self::PurgeUnsupported => "purge",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
