//! # Error Module
//!
//! Error taxonomy shared by the storage engine, the wire protocol and the
//! remote client.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A search was issued without a name or value predicate.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A key field contains the reserved separator byte.
    #[error("invalid field `{field}`: contains reserved separator byte 0x1f")]
    InvalidField { field: &'static str },

    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("encoding error: {0}")]
    Encoding(String),

    /// Malformed frame or unexpected message type on a connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered with an error-response.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("backend is closed")]
    Closed,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the error means the underlying connection can no longer be used.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLost(_) | StoreError::Io(_) | StoreError::Protocol(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
