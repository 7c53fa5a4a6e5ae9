//! Organization mapping from a JSON-lines AS-to-organization dataset.
//!
//! The dataset mixes `Organization` records (`organizationId`, `name`, `country`) with
//! `ASN`/`AS` records (`asn` or `aut`, `organizationId`, `name`, `source`). The first pass
//! collects organizations, the second resolves each identifier's display name.

use crate::JobReport;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};
use v6scope_core::{parse_asn, Asn, OrgMapping, UNKNOWN_ORGANIZATION};
use v6scope_store::Db;

pub const JOB: &str = "ingest-orgs";
const DEFAULT_SOURCE: &str = "CAIDA";

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "organizationId")]
    organization_id: Option<String>,
    name: Option<String>,
    country: Option<String>,
    asn: Option<serde_json::Value>,
    aut: Option<serde_json::Value>,
    source: Option<String>,
}

struct Organization {
    name: Option<String>,
    country: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn identifier(v: &serde_json::Value) -> Option<Asn> {
    match v {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| Asn::try_from(n).ok()),
        serde_json::Value::String(s) => parse_asn(s).ok(),
        _ => None,
    }
}

#[derive(Default)]
pub struct OrgJoin {
    organizations: HashMap<String, Organization>,
    mappings: BTreeMap<Asn, OrgMapping>,
    pub failures: u64,
}

impl OrgJoin {
    /// First pass: organization records only.
    pub fn read_organizations(&mut self, reader: impl BufRead) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(rec) = serde_json::from_str::<RawRecord>(&line) else {
                self.failures += 1;
                continue;
            };
            if rec.kind.as_deref() != Some("Organization") {
                continue;
            }
            if let Some(id) = rec.organization_id {
                self.organizations.insert(id, Organization { name: non_empty(rec.name), country: non_empty(rec.country) });
            }
        }
        debug!(organizations = self.organizations.len(), "organization pass done");
        Ok(())
    }

    /// Second pass: identifier records, resolved against the organizations seen so far.
    /// Malformed lines were already counted by the first pass.
    pub fn read_identifiers(&mut self, reader: impl BufRead) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            let Ok(rec) = serde_json::from_str::<RawRecord>(&line) else {
                continue;
            };
            if !matches!(rec.kind.as_deref(), Some("ASN") | Some("AS")) {
                continue;
            }
            let Some(asn) = rec.asn.as_ref().or(rec.aut.as_ref()).and_then(identifier) else {
                self.failures += 1;
                continue;
            };
            let org = rec.organization_id.as_ref().and_then(|id| self.organizations.get(id));
            let org_name = org
                .and_then(|o| o.name.clone())
                .or_else(|| non_empty(rec.name))
                .unwrap_or_else(|| UNKNOWN_ORGANIZATION.to_string());
            let region = org.and_then(|o| o.country.clone()).or_else(|| non_empty(rec.country));
            self.mappings.insert(
                asn,
                OrgMapping {
                    asn,
                    org_name,
                    org_id: rec.organization_id,
                    region,
                    source: non_empty(rec.source).unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                },
            );
        }
        Ok(())
    }

    pub fn organizations(&self) -> usize {
        self.organizations.len()
    }

    pub fn into_mappings(self) -> BTreeMap<Asn, OrgMapping> {
        self.mappings
    }
}

pub fn ingest_orgs(db: &Db, path: &Path) -> Result<JobReport> {
    let open = || File::open(path).map(BufReader::new).with_context(|| format!("open {}", path.display()));
    let mut join = OrgJoin::default();
    join.read_organizations(open()?)?;
    join.read_identifiers(open()?)?;
    let (organizations, failures) = (join.organizations(), join.failures);
    let mappings = join.into_mappings();
    let records = mappings.len() as u64;
    info!(organizations, mappings = records, failures, "organization dataset joined");

    let swap = db.refresh::<OrgMapping, _>(JOB, mappings.into_values())?;
    let ledger_entry = db.record_operation(
        "ingest-orgs",
        &swap.target,
        &json!({ "source_file": path.display().to_string() }),
        &json!({ "records": records, "organizations": organizations, "parse_failures": failures }),
    )?;
    Ok(JobReport { target: swap.target.clone(), records, skipped: 0, parse_failures: failures, swap, ledger_entry })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"type":"Organization","organizationId":"ORG-1","name":"Bharti Airtel","country":"IN"}
{"type":"Organization","organizationId":"ORG-2","name":"","country":"MY"}
{"type":"ASN","asn":"9498","organizationId":"ORG-1","name":"BBIL-AP","source":"APNIC"}
{"type":"AS","aut":4788,"organizationId":"ORG-2","name":"TMNET-AS-AP"}
{"type":"ASN","asn":64512,"organizationId":"ORG-404"}
not json
{"type":"ASN","organizationId":"ORG-1"}
"#;

    fn join() -> OrgJoin {
        let mut j = OrgJoin::default();
        j.read_organizations(SAMPLE.as_bytes()).unwrap();
        j.read_identifiers(SAMPLE.as_bytes()).unwrap();
        j
    }

    #[test]
    fn names_prefer_organization_then_direct_then_placeholder() {
        let j = join();
        assert_eq!(j.failures, 2);
        let m = j.into_mappings();
        assert_eq!(m.len(), 3);
        assert_eq!(m[&9498].org_name, "Bharti Airtel");
        assert_eq!(m[&9498].region.as_deref(), Some("IN"));
        assert_eq!(m[&9498].source, "APNIC");
        assert_eq!(m[&4788].org_name, "TMNET-AS-AP");
        assert_eq!(m[&4788].region.as_deref(), Some("MY"));
        assert_eq!(m[&4788].source, "CAIDA");
        assert_eq!(m[&64512].org_name, UNKNOWN_ORGANIZATION);
        assert_eq!(m[&64512].region, None);
    }

    #[test]
    fn ingest_feeds_the_operator_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("as-org2info.jsonl");
        std::fs::write(&path, SAMPLE).unwrap();
        let db = Db::open_in_memory().unwrap();
        let report = ingest_orgs(&db, &path).unwrap();
        assert_eq!(report.records, 3);
        assert_eq!(report.parse_failures, 2);
        assert_eq!(db.org_directory().unwrap().label(9498), "Bharti Airtel");
    }
}
