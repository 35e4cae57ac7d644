use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication rejected (HTTP {status}): {body}")]
    Auth { status: u16, body: String },

    #[error("Rate limited (429 Too Many Requests) on {endpoint}")]
    RateLimited { endpoint: String },

    #[error("HTTP {status} from {endpoint}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid payload: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Booking sync error for listing {listing_id}: {message}")]
    Sync { listing_id: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP-style status reported by the trigger surface for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::RateLimited { .. } => 429,
            Error::Http { status: 429, .. } => 429,
            _ => 500,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code() == 429
    }

    /// Missing configuration is the only failure a later run cannot fix on its own.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Error::Config(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
