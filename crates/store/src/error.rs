//! Document store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document already exists: {collection}/{id}")]
    AlreadyExists { collection: String, id: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("malformed store response: {0}")]
    Protocol(String),
}
