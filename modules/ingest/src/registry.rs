//! Registry delegation files: `registry|cc|type|start|value|date|status`.

use crate::JobReport;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};
use v6scope_core::{Asn, RegistryEntry};
use v6scope_store::Db;

pub const JOB: &str = "ingest-registry";

/// Largest identifier block one delegation line may expand to.
pub const MAX_BLOCK: u32 = 65_536;

#[derive(Debug, Clone, Serialize)]
pub struct RegistryFilter {
    /// Country codes to keep; empty keeps every region.
    pub regions: Vec<String>,
    pub statuses: Vec<String>,
}

impl Default for RegistryFilter {
    fn default() -> Self {
        RegistryFilter { regions: Vec::new(), statuses: vec!["allocated".into(), "assigned".into()] }
    }
}

impl RegistryFilter {
    fn keeps(&self, region: &str, status: &str) -> bool {
        (self.regions.is_empty() || self.regions.iter().any(|r| r.eq_ignore_ascii_case(region)))
            && self.statuses.iter().any(|s| s == status)
    }
}

#[derive(Debug, Default)]
pub struct ParsedRegistry {
    pub entries: BTreeMap<Asn, RegistryEntry>,
    pub skipped: u64,
    pub failures: u64,
}

/// `YYYYMMDD` to `YYYY-MM-DD`.
fn registry_date(raw: &str) -> Option<String> {
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (y, rest) = raw.split_at(4);
    let (m, d) = rest.split_at(2);
    let (mm, dd): (u8, u8) = (m.parse().ok()?, d.parse().ok()?);
    if !(1..=12).contains(&mm) || !(1..=31).contains(&dd) {
        return None;
    }
    Some(format!("{y}-{m}-{d}"))
}

pub fn parse_registry(reader: impl BufRead, filter: &RegistryFilter, source: &str) -> Result<ParsedRegistry> {
    let mut out = ParsedRegistry::default();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split('|').collect();
        // Version and summary lines are shorter or carry `*` in place of a start value.
        if parts.len() < 7 || parts[2] != "asn" || parts[3] == "*" {
            out.skipped += 1;
            continue;
        }
        let (rir, cc, start, value, date, status) = (parts[0], parts[1], parts[3], parts[4], parts[5], parts[6]);
        if !filter.keeps(cc, status) {
            out.skipped += 1;
            continue;
        }
        let (Ok(start), Ok(count)) = (start.parse::<Asn>(), value.parse::<u32>()) else {
            debug!(line, "unparseable delegation");
            out.failures += 1;
            continue;
        };
        if count > MAX_BLOCK {
            warn!(line, count, "delegation block too large");
            out.failures += 1;
            continue;
        }
        let Some(end) = start.checked_add(count.saturating_sub(1)).filter(|_| count > 0) else {
            out.failures += 1;
            continue;
        };
        let registry_date = registry_date(date);
        for asn in start..=end {
            out.entries.entry(asn).or_insert_with(|| RegistryEntry {
                asn,
                region: cc.to_ascii_uppercase(),
                rir: rir.to_ascii_uppercase(),
                status: status.to_string(),
                registry_date: registry_date.clone(),
                source: source.to_string(),
            });
        }
    }
    Ok(out)
}

pub fn ingest_registry(db: &Db, path: &Path, filter: &RegistryFilter) -> Result<JobReport> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let source = path.file_name().and_then(|n| n.to_str()).unwrap_or("registry").to_string();
    let parsed = parse_registry(BufReader::new(file), filter, &source)?;
    info!(entries = parsed.entries.len(), skipped = parsed.skipped, failures = parsed.failures, "registry parsed");

    let records = parsed.entries.len() as u64;
    let swap = db.refresh::<RegistryEntry, _>(JOB, parsed.entries.into_values())?;
    let ledger_entry = db.record_operation(
        "ingest-registry",
        &swap.target,
        &json!({ "source_file": path.display().to_string(), "filter": filter }),
        &json!({ "records": records, "skipped": parsed.skipped, "parse_failures": parsed.failures, "previous_rows": swap.previous_rows }),
    )?;
    Ok(JobReport { target: swap.target.clone(), records, skipped: parsed.skipped, parse_failures: parsed.failures, swap, ledger_entry })
}
