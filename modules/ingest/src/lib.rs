//! Reference-dataset ingestion jobs. Each job parses its input, refreshes one dataset
//! through staging and atomic swap, and appends a provenance entry.

pub mod enrich;
pub mod orgs;
pub mod readiness;
pub mod registry;

use serde::Serialize;
use v6scope_store::SwapReport;

/// What an ingestion job did.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub target: String,
    /// Records accepted into the new generation.
    pub records: u64,
    /// Lines deliberately ignored (comments, headers, filtered out).
    pub skipped: u64,
    /// Malformed lines, skipped and counted.
    pub parse_failures: u64,
    pub swap: SwapReport,
    pub ledger_entry: i64,
}
