//! SQLite persistence for scan records, reference datasets, checkpoints and the provenance ledger.
//!
//! Reference datasets are never written in place: they are populated into a staging
//! table and substituted for the production table in one transaction (see [`staging`]).

mod checkpoint;
mod dataset;
mod error;
mod ledger;
mod open;
mod query;
mod scans;
mod schema;
pub mod staging;

pub use checkpoint::Checkpoints;
pub use dataset::{Dataset, IndexSpec};
pub use error::StoreError;
pub use ledger::{LedgerEntry, LedgerMismatch};
pub use open::{Db, DEFAULT_LOCK_TTL};
pub use query::Provider;
pub use staging::{StagingArea, SwapReport};
