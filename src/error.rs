//! Error taxonomy for the ingestion core.
//!
//! Schema-level errors ([`IngestError::SchemaConflict`],
//! [`IngestError::MigrationRejected`]) are fatal to registration and surface
//! before any run starts. Per-target errors ([`SiteError`]) and per-subtree
//! storage errors ([`StorageError`]) are recorded as failure counts by the
//! sync engine and never abort a run.

use std::fmt;

use thiserror::Error;

use crate::site::FetchTarget;

/// Classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// A uniqueness constraint was violated (duplicate dedup key in a kind).
    Constraint,
    /// The database could not be opened or reached.
    Unavailable,
    /// A statement failed for any other reason.
    Query,
    /// A stored value could not be decoded into its declared field type.
    Decode,
    /// The entity kind is not part of the registered schema.
    UnknownKind,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageErrorKind::Constraint => "constraint",
            StorageErrorKind::Unavailable => "unavailable",
            StorageErrorKind::Query => "query",
            StorageErrorKind::Decode => "decode",
            StorageErrorKind::UnknownKind => "unknown kind",
        };
        f.write_str(s)
    }
}

/// Transaction-level storage failure.
#[derive(Debug, Error)]
#[error("storage error ({kind}): {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Decode, message)
    }

    pub fn unknown_kind(kind: &str) -> Self {
        Self::new(
            StorageErrorKind::UnknownKind,
            format!("entity kind '{}' is not registered", kind),
        )
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StorageErrorKind::Constraint,
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_) => StorageErrorKind::Unavailable,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StorageErrorKind::Decode,
            _ => StorageErrorKind::Query,
        };
        Self::new(kind, err.to_string())
    }
}

/// Failure reported by a site type's fetch/parse pipeline for one target.
#[derive(Debug, Clone, Error)]
pub enum SiteError {
    /// Network or otherwise transient retrieval failure. Retried.
    #[error("fetch failed for {target}: {message}")]
    Fetch { target: String, message: String },
    /// Content did not have the expected shape. Not retried.
    #[error("parse failed for {target}: {message}")]
    Parse { target: String, message: String },
}

impl SiteError {
    pub fn fetch(target: &FetchTarget, message: impl fmt::Display) -> Self {
        SiteError::Fetch {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    pub fn parse(target: &FetchTarget, message: impl fmt::Display) -> Self {
        SiteError::Parse {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SiteError::Fetch { .. })
    }
}

/// Errors surfaced by the core API.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("schema conflict for site '{site}': {}", .reasons.join("; "))]
    SchemaConflict { site: String, reasons: Vec<String> },

    #[error(
        "migration rejected for site '{site}' at version {version}: {}",
        .reasons.join("; ")
    )]
    MigrationRejected {
        site: String,
        version: u32,
        reasons: Vec<String>,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("a sync run is already active for site '{0}'")]
    RunAlreadyActive(String),

    #[error("unknown site type: '{0}'")]
    UnknownSite(String),

    #[error("unknown entity kind: '{0}'")]
    UnknownKind(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Storage(err.into())
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
