//! Error types shared across the catalog engine.

use thiserror::Error;

/// Failures reported by an external media source.
///
/// These are transient from the engine's point of view: the broker logs them
/// and completes the request without a result.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("media source unavailable: {0}")]
    Unavailable(String),

    #[error("media query failed: {0}")]
    Query(String),

    #[error("operation not supported by this source: {0}")]
    Unsupported(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Engine-level failures surfaced by the public catalog API.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog worker thread is unavailable")]
    WorkerUnavailable,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("flag store error: {0}")]
    FlagStore(#[from] anyhow::Error),

    #[error("request did not complete within {0:?}")]
    Timeout(std::time::Duration),
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
