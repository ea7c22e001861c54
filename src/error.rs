//! Custom error types for HTTPeek

use thiserror::Error;

/// Root CA errors. Both variants are fatal at startup; the proxy listener
/// is not started without a usable root.
#[derive(Error, Debug)]
pub enum CaError {
    #[error("corrupt CA material in {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("CA I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transcript store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("entry not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
