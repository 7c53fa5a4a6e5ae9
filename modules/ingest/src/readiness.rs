//! Bulk readiness table: `AS<n>,<cc>,<samples>,<capable %>[,<preferred %>]`.

use crate::JobReport;
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};
use v6scope_core::{now_rfc3339, parse_asn, Asn, ReadinessScore, ReadinessStatus};
use v6scope_store::Db;

pub const JOB: &str = "ingest-readiness";

#[derive(Debug, Default)]
pub struct ParsedReadiness {
    pub scores: BTreeMap<Asn, ReadinessScore>,
    pub skipped: u64,
    pub failures: u64,
}

fn percentage(raw: Option<&str>) -> Option<f64> {
    let v: f64 = raw?.trim().trim_end_matches('%').parse().ok()?;
    (v.is_finite() && (0.0..=100.0).contains(&v)).then(|| (v * 100.0).round() / 100.0)
}

/// Parse the table. When `known` is given, identifiers outside it are skipped.
pub fn parse_readiness(reader: impl Read, known: Option<&HashSet<Asn>>, source: &str) -> Result<ParsedReadiness> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(false).flexible(true).trim(csv::Trim::All).from_reader(reader);
    let mut out = ParsedReadiness::default();
    let measured_at = now_rfc3339();
    for (i, row) in rdr.records().enumerate() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                debug!(row = i + 1, error = %e, "unreadable row");
                out.failures += 1;
                continue;
            }
        };
        let first = row.get(0).unwrap_or("");
        if first.is_empty() || first.starts_with('#') || (i == 0 && first.eq_ignore_ascii_case("asn")) {
            out.skipped += 1;
            continue;
        }
        let Ok(asn) = parse_asn(first) else {
            out.failures += 1;
            continue;
        };
        if known.is_some_and(|k| !k.contains(&asn)) {
            out.skipped += 1;
            continue;
        }
        let region = row.get(1).filter(|s| !s.is_empty()).map(|s| s.to_ascii_uppercase());
        let samples = row.get(2).and_then(|s| s.parse::<u64>().ok());
        let capable = percentage(row.get(3));
        let preferred = match row.get(4) {
            None | Some("") => Some(0.0),
            some => percentage(some),
        };
        let (Some(samples), Some(capable), Some(preferred)) = (samples, capable, preferred) else {
            debug!(row = i + 1, asn, "invalid readiness values");
            out.failures += 1;
            continue;
        };
        let score = if samples == 0 {
            ReadinessScore { region, ..ReadinessScore::no_data(asn, source) }
        } else {
            ReadinessScore {
                asn,
                region,
                capable_pct: capable,
                preferred_pct: preferred,
                sample_count: samples,
                status: ReadinessStatus::Ok,
                source: source.to_string(),
                measured_at: measured_at.clone(),
            }
        };
        if out.scores.insert(asn, score).is_some() {
            warn!(asn, "duplicate readiness row; keeping the last");
        }
    }
    Ok(out)
}

pub fn ingest_readiness(db: &Db, path: &Path, registry_only: bool) -> Result<JobReport> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let known: Option<HashSet<Asn>> = if registry_only { Some(db.registry_asns()?.into_iter().collect()) } else { None };
    let source = path.file_name().and_then(|n| n.to_str()).unwrap_or("readiness").to_string();
    let parsed = parse_readiness(file, known.as_ref(), &source)?;
    let records = parsed.scores.len() as u64;
    info!(records, skipped = parsed.skipped, failures = parsed.failures, "readiness table parsed");

    let swap = db.refresh::<ReadinessScore, _>(JOB, parsed.scores.into_values())?;
    let ledger_entry = db.record_operation(
        "ingest-readiness",
        &swap.target,
        &json!({ "source_file": path.display().to_string(), "registry_only": registry_only }),
        &json!({ "records": records, "skipped": parsed.skipped, "parse_failures": parsed.failures }),
    )?;
    Ok(JobReport { target: swap.target.clone(), records, skipped: parsed.skipped, parse_failures: parsed.failures, swap, ledger_entry })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "asn,cc,samples,capable,preferred
AS55836,IN,120000,78.5,71.25
AS4788,my,5000,41.2%
AS9829,IN,0,0,0
AS1,IN,10,140,0
ASX,IN,10,1,1
AS2497,JP,900,12.346,10
";

    #[test]
    fn parses_rows_and_counts_failures() {
        let p = parse_readiness(SAMPLE.as_bytes(), None, "t").unwrap();
        assert_eq!(p.skipped, 1);
        assert_eq!(p.failures, 2);
        assert_eq!(p.scores.len(), 4);
        let jio = &p.scores[&55836];
        assert_eq!((jio.capable_pct, jio.preferred_pct, jio.sample_count), (78.5, 71.25, 120000));
        let tm = &p.scores[&4788];
        assert_eq!(tm.region.as_deref(), Some("MY"));
        assert_eq!(tm.preferred_pct, 0.0);
        assert_eq!(p.scores[&9829].status, ReadinessStatus::NoData);
        assert_eq!(p.scores[&2497].capable_pct, 12.35);
        for s in p.scores.values() {
            assert!(s.validate().is_ok());
        }
    }

    #[test]
    fn registry_filter_drops_unknown_identifiers() {
        let known: HashSet<Asn> = [55836, 9829].into_iter().collect();
        let p = parse_readiness(SAMPLE.as_bytes(), Some(&known), "t").unwrap();
        assert_eq!(p.scores.keys().copied().collect::<Vec<_>>(), vec![9829, 55836]);
    }
}
