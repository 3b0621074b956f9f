//! Error types for workpool.

use thiserror::Error;

use crate::handler::HandlerError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A transactional handler or completion callback failed. Used to roll
    /// back the transaction it ran in; never surfaced past the engine.
    #[error("handler failed: {0}")]
    Handler(HandlerError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
