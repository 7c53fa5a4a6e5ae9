//! Bounded fan-out of the probe engine over a sector's endpoint list.

mod score;

pub use score::{score_groups, GroupScore};

use anyhow::{anyhow, Result};
use probe::Prober;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use v6scope_core::{date_of, now_rfc3339, Measurement, Rollup, ScanRecord, ScanStatus};
use v6scope_store::{Db, StoreError};

pub const DEFAULT_WORKERS: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub group: String,
    pub endpoint: String,
}

impl ScanTarget {
    pub fn new(group: impl Into<String>, endpoint: impl Into<String>) -> Self {
        ScanTarget { group: group.into(), endpoint: endpoint.into() }
    }
}

/// Read `GROUP ENDPOINT` lines. Blank lines and `#` comments are skipped.
pub fn read_targets(reader: impl BufRead) -> Result<Vec<ScanTarget>> {
    let mut targets = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(group), Some(endpoint), None) => targets.push(ScanTarget::new(group, endpoint)),
            _ => return Err(anyhow!("line {}: expected `GROUP ENDPOINT`, got {line:?}", n + 1)),
        }
    }
    Ok(targets)
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub sector: String,
    pub started_at: String,
    /// Records per group, each list in completion order.
    pub groups: BTreeMap<String, Vec<ScanRecord>>,
    /// Sector aggregate first, then one per group.
    pub rollups: Vec<Rollup>,
}

impl ScanOutcome {
    pub fn records(&self) -> impl Iterator<Item = &ScanRecord> {
        self.groups.values().flatten()
    }

    pub fn total(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn aggregate(&self) -> Option<&Rollup> {
        self.rollups.iter().find(|r| r.group.is_none())
    }
}

/// Probe every target with at most `workers` probes in flight.
///
/// A probe that panics is recorded as an `error` measurement; the batch always completes.
pub async fn scan<P: Prober>(prober: Arc<P>, sector: &str, batch: Vec<ScanTarget>, workers: usize) -> ScanOutcome {
    let started_at = now_rfc3339();
    let workers = workers.max(1);
    info!(sector, endpoints = batch.len(), workers, "scan started");

    let sem = Arc::new(Semaphore::new(workers));
    let (tx, mut rx) = mpsc::channel::<(String, Measurement)>(batch.len().max(1));

    for target in batch {
        let permit = match sem.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let tx = tx.clone();
        let prober = prober.clone();
        tokio::spawn(async move {
            let endpoint = target.endpoint.clone();
            let probed = tokio::spawn(async move { prober.probe(&endpoint).await }).await;
            let m = match probed {
                Ok(m) => m,
                Err(e) => {
                    warn!(endpoint = %target.endpoint, error = %e, "probe aborted");
                    Measurement::failed(&target.endpoint, now_rfc3339(), format!("probe aborted: {e}"))
                }
            };
            drop(permit);
            let _ = tx.send((target.group, m)).await;
        });
    }
    drop(tx);

    let mut groups: BTreeMap<String, Vec<ScanRecord>> = BTreeMap::new();
    while let Some((group, m)) = rx.recv().await {
        debug!(endpoint = %m.endpoint, status = %m.status, "probe completed");
        groups.entry(group.clone()).or_default().push(ScanRecord::new(group, sector, m));
    }

    let rollups = rollups(sector, &date_of(&started_at), &groups);
    if let Some(agg) = rollups.first() {
        info!(sector, total = agg.total, ready = agg.ready, rate = agg.rate, "scan finished");
    }
    ScanOutcome { sector: sector.to_string(), started_at, groups, rollups }
}

fn rollups(sector: &str, date: &str, groups: &BTreeMap<String, Vec<ScanRecord>>) -> Vec<Rollup> {
    let tally = |recs: &[ScanRecord]| (recs.len() as u64, recs.iter().filter(|r| r.is_ready()).count() as u64);
    let mut out = Vec::with_capacity(groups.len() + 1);
    let (mut total, mut ready) = (0, 0);
    for recs in groups.values() {
        let (t, r) = tally(recs);
        total += t;
        ready += r;
    }
    out.push(Rollup::compute(date, sector, None, total, ready));
    for (group, recs) in groups {
        let (t, r) = tally(recs);
        out.push(Rollup::compute(date, sector, Some(group), t, r));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub records: usize,
    pub rollups: usize,
    pub ledger_entry: i64,
}

/// Write the outcome: one batched insert of every record, then the rollups, then a ledger entry.
pub fn persist(db: &Db, outcome: &ScanOutcome) -> Result<PersistReport, StoreError> {
    let records: Vec<ScanRecord> = outcome.records().cloned().collect();
    let written = db.insert_scans(&records).map_err(|e| {
        error!(sector = %outcome.sector, error = %e, "bulk scan write failed");
        e
    })?;
    for r in &outcome.rollups {
        db.upsert_rollup(r)?;
    }
    let errors = records.iter().filter(|r| r.measurement.status == ScanStatus::Error).count();
    let agg = outcome.aggregate();
    let ledger_entry = db.record_operation(
        "scan",
        "endpoint_scans",
        &json!({ "sector": outcome.sector, "started_at": outcome.started_at, "groups": outcome.groups.len() }),
        &json!({
            "records": written,
            "ready": agg.map(|a| a.ready),
            "rate": agg.map(|a| a.rate),
            "errors": errors,
        }),
    )?;
    info!(sector = %outcome.sector, records = written, "scan persisted");
    Ok(PersistReport { records: written, rollups: outcome.rollups.len(), ledger_entry })
}
