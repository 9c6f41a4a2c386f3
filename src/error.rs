//! Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Invalid collection name: {0}")]
    InvalidCollectionName(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
