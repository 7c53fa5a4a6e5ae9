//! Routing dependency graph: distinct next-hop edges from observed paths, and the
//! provider-count resilience classification built on it.

mod builder;
mod resilience;

pub use builder::{build, EdgeSetBuilder, PathFormat, PROGRESS_EVERY};
pub use resilience::{resilience, Resilience, ResilienceReport, ResilienceStatus};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;
use tracing::info;
use v6scope_core::RoutingEdge;
use v6scope_store::{Db, SwapReport};

pub const JOB: &str = "ingest-routes";

#[derive(Debug, Clone, Serialize)]
pub struct RouteReport {
    pub records: u64,
    pub parse_failures: u64,
    pub edges: u64,
    pub swap: SwapReport,
    pub ledger_entry: i64,
}

/// Build the edge set of a routing dump and swap it into production.
pub fn ingest_routes(db: &Db, path: &Path, format: PathFormat) -> Result<RouteReport> {
    let started = Instant::now();
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut builder = EdgeSetBuilder::new();
    builder.read(BufReader::new(file), format)?;
    let (records, failures) = (builder.records(), builder.failures());
    info!(records, edges = builder.len(), failures, elapsed_ms = started.elapsed().as_millis() as u64, "routing dump parsed");

    let source = path.file_name().and_then(|n| n.to_str()).unwrap_or("routes").to_string();
    let edges = builder.into_edges(&source);
    let count = edges.len() as u64;
    let swap = db.refresh::<RoutingEdge, _>(JOB, edges)?;
    let ledger_entry = db.record_operation(
        "ingest-routes",
        &swap.target,
        &json!({ "source_file": path.display().to_string(), "format": format!("{format:?}").to_lowercase() }),
        &json!({ "records": records, "edges": count, "parse_failures": failures, "previous_rows": swap.previous_rows }),
    )?;
    Ok(RouteReport { records, parse_failures: failures, edges: count, swap, ledger_entry })
}
