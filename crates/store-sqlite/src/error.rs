use thiserror::Error;
use v6scope_core::InvariantViolation;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// A record breaks a stored invariant and was refused.
    #[error("schema violation in {table} at record {position}: {violation}")]
    SchemaViolation { table: String, position: u64, violation: InvariantViolation },
    /// Populating or indexing a staging area failed; production is untouched.
    #[error("ingestion into {staging} failed: {source}")]
    Ingestion {
        staging: String,
        #[source]
        source: rusqlite::Error,
    },
    /// The atomic replace failed; the staging area is left in place.
    #[error("swap {staging} -> {target} failed: {source}")]
    Swap {
        staging: String,
        target: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("dataset {target} is being refreshed by {holder}")]
    DatasetLocked { target: String, holder: String },
    /// The holder's lease on the target was taken over or released; its staging area is gone.
    #[error("{holder} no longer holds the lease on {target}")]
    LeaseLost { target: String, holder: String },
    #[error("staging area {staging} has {found} rows, expected {expected}")]
    StagingMismatch { staging: String, expected: u64, found: u64 },
    #[error("invalid identifier: {0:?}")]
    Identifier(String),
}
