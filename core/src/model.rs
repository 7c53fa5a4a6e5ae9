use crate::error::{InvariantViolation, ParseError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub type Asn = u32;

/// Label used when an operator identifier has no organization mapping.
pub const FALLBACK_OPERATOR: &str = "Generic Infrastructure";
/// Organization name used when neither the indirect nor the direct name is known.
pub const UNKNOWN_ORGANIZATION: &str = "Unknown Organization";

/// Outcome of one protocol check.
///
/// `Fail` means the check ran and the answer was negative (e.g. NXDOMAIN, handshake
/// refused); `Unknown` means the check could not produce an answer (timeout, resolver
/// failure, or a prerequisite such as an address was missing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Check {
    Pass,
    Fail,
    #[default]
    Unknown,
}

impl Check {
    pub fn is_pass(self) -> bool {
        matches!(self, Check::Pass)
    }

    /// SQL encoding: 1, 0 or NULL.
    pub fn to_sql(self) -> Option<bool> {
        match self {
            Check::Pass => Some(true),
            Check::Fail => Some(false),
            Check::Unknown => None,
        }
    }

    pub fn from_sql(v: Option<bool>) -> Self {
        match v {
            Some(true) => Check::Pass,
            Some(false) => Check::Fail,
            None => Check::Unknown,
        }
    }
}

impl From<bool> for Check {
    fn from(b: bool) -> Self {
        if b { Check::Pass } else { Check::Fail }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Ready,
    Partial,
    Missing,
    Error,
}

impl ScanStatus {
    /// Readiness from the two primary capability checks: both pass => ready,
    /// one passes => partial, none => missing.
    pub fn from_checks(ipv6_dns: Check, ipv6_web: Check) -> Self {
        match (ipv6_dns.is_pass(), ipv6_web.is_pass()) {
            (true, true) => ScanStatus::Ready,
            (true, false) | (false, true) => ScanStatus::Partial,
            (false, false) => ScanStatus::Missing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Ready => "ready",
            ScanStatus::Partial => "partial",
            ScanStatus::Missing => "missing",
            ScanStatus::Error => "error",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(ScanStatus::Ready),
            "partial" => Ok(ScanStatus::Partial),
            "missing" => Ok(ScanStatus::Missing),
            "error" => Ok(ScanStatus::Error),
            other => Err(ParseError::Record { line: other.to_string(), reason: "unknown scan status".into() }),
        }
    }
}

/// Elapsed time in milliseconds rounded to two decimals. Never negative.
pub fn rtt_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100_000.0).round() / 100.0
}

/// One probe of one endpoint. Produced by the probe engine, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub endpoint: String,
    pub ipv6_dns: Check,
    pub ipv4_dns: Check,
    pub ipv6_web: Check,
    pub dnssec: Check,
    pub ipv4_rtt_ms: Option<f64>,
    pub ipv6_rtt_ms: Option<f64>,
    pub asn: Option<Asn>,
    pub operator: Option<String>,
    pub status: ScanStatus,
    pub error: Option<String>,
    pub checked_at: String,
}

impl Measurement {
    /// All checks unknown, status derived on [`Measurement::finish`].
    pub fn pending(endpoint: &str, checked_at: String) -> Self {
        Measurement {
            endpoint: endpoint.to_string(),
            ipv6_dns: Check::Unknown,
            ipv4_dns: Check::Unknown,
            ipv6_web: Check::Unknown,
            dnssec: Check::Unknown,
            ipv4_rtt_ms: None,
            ipv6_rtt_ms: None,
            asn: None,
            operator: None,
            status: ScanStatus::Missing,
            error: None,
            checked_at,
        }
    }

    /// Record for a probe that failed as a whole.
    pub fn failed(endpoint: &str, checked_at: String, error: impl Into<String>) -> Self {
        Measurement {
            status: ScanStatus::Error,
            error: Some(error.into()),
            ..Measurement::pending(endpoint, checked_at)
        }
    }

    pub fn finish(mut self) -> Self {
        self.status = ScanStatus::from_checks(self.ipv6_dns, self.ipv6_web);
        self
    }

    pub fn validate(&self) -> Result<(), InvariantViolation> {
        if self.endpoint.trim().is_empty() {
            return Err(InvariantViolation::Empty("endpoint"));
        }
        check_rtt("ipv4_rtt_ms", self.ipv4_rtt_ms)?;
        check_rtt("ipv6_rtt_ms", self.ipv6_rtt_ms)?;
        if self.ipv6_rtt_ms.is_some() && !self.ipv6_web.is_pass() {
            return Err(InvariantViolation::RttWithoutConnection { field: "ipv6_rtt_ms" });
        }
        if self.status != ScanStatus::Error {
            let expected = ScanStatus::from_checks(self.ipv6_dns, self.ipv6_web);
            if expected != self.status {
                return Err(InvariantViolation::Status { expected: expected.as_str(), found: self.status.as_str() });
            }
        }
        Ok(())
    }
}

fn check_rtt(field: &'static str, v: Option<f64>) -> Result<(), InvariantViolation> {
    match v {
        Some(ms) if !ms.is_finite() || ms < 0.0 => Err(InvariantViolation::Rtt { field, value: ms }),
        _ => Ok(()),
    }
}

/// A measurement placed in its reporting group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub group: String,
    pub sector: String,
    #[serde(flatten)]
    pub measurement: Measurement,
}

impl ScanRecord {
    pub fn new(group: impl Into<String>, sector: impl Into<String>, measurement: Measurement) -> Self {
        ScanRecord { group: group.into(), sector: sector.into(), measurement }
    }

    pub fn is_ready(&self) -> bool {
        self.measurement.status == ScanStatus::Ready
    }
}

/// Per-day readiness snapshot for a sector, optionally narrowed to one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub date: String,
    pub sector: String,
    pub group: Option<String>,
    pub total: u64,
    pub ready: u64,
    pub rate: f64,
    pub timestamp: String,
}

impl Rollup {
    pub fn compute(date: &str, sector: &str, group: Option<&str>, total: u64, ready: u64) -> Self {
        let rate = if total > 0 { (ready as f64 / total as f64 * 1000.0).round() / 10.0 } else { 0.0 };
        Rollup {
            date: date.to_string(),
            sector: sector.to_string(),
            group: group.map(str::to_string),
            total,
            ready,
            rate,
            timestamp: crate::now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub asn: Asn,
    pub region: String,
    pub rir: String,
    pub status: String,
    pub registry_date: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgMapping {
    pub asn: Asn,
    pub org_name: String,
    pub org_id: Option<String>,
    pub region: Option<String>,
    pub source: String,
}

/// `dependent` relies on `provider` as its next hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingEdge {
    pub dependent: Asn,
    pub provider: Asn,
    pub source: String,
}

impl RoutingEdge {
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        if self.dependent == self.provider {
            return Err(InvariantViolation::SelfEdge(self.dependent));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadinessStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "no-data")]
    NoData,
}

impl ReadinessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadinessStatus::Ok => "ok",
            ReadinessStatus::NoData => "no-data",
        }
    }
}

impl FromStr for ReadinessStatus {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(ReadinessStatus::Ok),
            "no-data" => Ok(ReadinessStatus::NoData),
            other => Err(ParseError::Record { line: other.to_string(), reason: "unknown readiness status".into() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessScore {
    pub asn: Asn,
    pub region: Option<String>,
    pub capable_pct: f64,
    pub preferred_pct: f64,
    pub sample_count: u64,
    pub status: ReadinessStatus,
    pub source: String,
    pub measured_at: String,
}

impl ReadinessScore {
    pub fn no_data(asn: Asn, source: &str) -> Self {
        ReadinessScore {
            asn,
            region: None,
            capable_pct: 0.0,
            preferred_pct: 0.0,
            sample_count: 0,
            status: ReadinessStatus::NoData,
            source: source.to_string(),
            measured_at: crate::now_rfc3339(),
        }
    }

    /// Score from raw counts; percentages are `count / samples * 100` rounded to two decimals.
    /// Zero samples yields a no-data score.
    pub fn from_samples(
        asn: Asn,
        region: Option<String>,
        samples: u64,
        capable: u64,
        preferred: u64,
        source: &str,
    ) -> Result<Self, InvariantViolation> {
        if samples == 0 {
            return Ok(ReadinessScore::no_data(asn, source));
        }
        let pct = |n: u64| (n as f64 / samples as f64 * 10_000.0).round() / 100.0;
        let score = ReadinessScore {
            asn,
            region,
            capable_pct: pct(capable),
            preferred_pct: pct(preferred),
            sample_count: samples,
            status: ReadinessStatus::Ok,
            source: source.to_string(),
            measured_at: crate::now_rfc3339(),
        };
        score.validate()?;
        Ok(score)
    }

    pub fn validate(&self) -> Result<(), InvariantViolation> {
        for (field, value) in [("capable_pct", self.capable_pct), ("preferred_pct", self.preferred_pct)] {
            if !(0.0..=100.0).contains(&value) {
                return Err(InvariantViolation::Percentage { field, value });
            }
        }
        if self.status == ReadinessStatus::NoData
            && (self.capable_pct != 0.0 || self.preferred_pct != 0.0 || self.sample_count != 0)
        {
            return Err(InvariantViolation::NoDataNotEmpty(self.asn));
        }
        Ok(())
    }
}

/// Read-only snapshot of the organization mapping, shared by probe workers.
#[derive(Debug, Clone, Default)]
pub struct OrgDirectory(Arc<HashMap<Asn, String>>);

impl OrgDirectory {
    pub fn new(names: HashMap<Asn, String>) -> Self {
        OrgDirectory(Arc::new(names))
    }

    pub fn lookup(&self, asn: Asn) -> Option<&str> {
        self.0.get(&asn).map(String::as_str)
    }

    /// Organization name, or [`FALLBACK_OPERATOR`] when the identifier is unmapped.
    pub fn label(&self, asn: Asn) -> String {
        self.lookup(asn).unwrap_or(FALLBACK_OPERATOR).to_string()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Asn, String)> for OrgDirectory {
    fn from_iter<I: IntoIterator<Item = (Asn, String)>>(iter: I) -> Self {
        OrgDirectory::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_primary_checks() {
        use Check::*;
        assert_eq!(ScanStatus::from_checks(Pass, Pass), ScanStatus::Ready);
        assert_eq!(ScanStatus::from_checks(Pass, Fail), ScanStatus::Partial);
        assert_eq!(ScanStatus::from_checks(Fail, Pass), ScanStatus::Partial);
        assert_eq!(ScanStatus::from_checks(Fail, Fail), ScanStatus::Missing);
        assert_eq!(ScanStatus::from_checks(Unknown, Unknown), ScanStatus::Missing);
        assert_eq!(ScanStatus::from_checks(Pass, Unknown), ScanStatus::Partial);
    }

    #[test]
    fn check_sql_encoding() {
        for c in [Check::Pass, Check::Fail, Check::Unknown] {
            assert_eq!(Check::from_sql(c.to_sql()), c);
        }
    }

    #[test]
    fn rtt_rounds_to_hundredths() {
        assert_eq!(rtt_ms(Duration::from_micros(12_346)), 12.35);
        assert_eq!(rtt_ms(Duration::ZERO), 0.0);
    }

    #[test]
    fn measurement_rejects_negative_or_orphan_rtt() {
        let mut m = Measurement::pending("example.org", crate::now_rfc3339()).finish();
        assert!(m.validate().is_ok());
        m.ipv4_rtt_ms = Some(-1.0);
        assert!(matches!(m.validate(), Err(InvariantViolation::Rtt { .. })));
        m.ipv4_rtt_ms = None;
        m.ipv6_rtt_ms = Some(20.0);
        assert!(matches!(m.validate(), Err(InvariantViolation::RttWithoutConnection { .. })));
    }

    #[test]
    fn measurement_rejects_inconsistent_status() {
        let mut m = Measurement::pending("example.org", crate::now_rfc3339());
        m.ipv6_dns = Check::Pass;
        m.status = ScanStatus::Ready;
        assert!(matches!(m.validate(), Err(InvariantViolation::Status { .. })));
        assert!(m.finish().validate().is_ok());
    }

    #[test]
    fn failed_measurement_is_error_status() {
        let m = Measurement::failed("example.org", crate::now_rfc3339(), "panic");
        assert_eq!(m.status, ScanStatus::Error);
        assert_eq!(m.error.as_deref(), Some("panic"));
        assert!(m.validate().is_ok());
    }

    #[test]
    fn scan_record_serializes_flat() {
        let m = Measurement::pending("uni.edu.my", "2026-01-01T00:00:00Z".into()).finish();
        let rec = ScanRecord::new("MY", "education", m);
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["group"], "MY");
        assert_eq!(v["endpoint"], "uni.edu.my");
        assert_eq!(v["status"], "missing");
        assert_eq!(v["ipv6_dns"], "unknown");
    }

    #[test]
    fn rollup_rate_is_rounded_percentage() {
        let r = Rollup::compute("2026-01-01", "government", None, 3, 1);
        assert_eq!(r.rate, 33.3);
        let empty = Rollup::compute("2026-01-01", "government", Some("IN"), 0, 0);
        assert_eq!(empty.rate, 0.0);
    }

    #[test]
    fn readiness_from_samples() {
        let s = ReadinessScore::from_samples(9829, Some("IN".into()), 200, 150, 99, "test").unwrap();
        assert_eq!(s.capable_pct, 75.0);
        assert_eq!(s.preferred_pct, 49.5);
        assert_eq!(s.status, ReadinessStatus::Ok);

        let none = ReadinessScore::from_samples(9829, None, 0, 10, 10, "test").unwrap();
        assert_eq!(none.status, ReadinessStatus::NoData);
        assert_eq!(none.capable_pct, 0.0);
        assert_eq!(none.sample_count, 0);
    }

    #[test]
    fn readiness_rejects_out_of_range() {
        let err = ReadinessScore::from_samples(1, None, 10, 11, 0, "test").unwrap_err();
        assert!(matches!(err, InvariantViolation::Percentage { field: "capable_pct", .. }));

        let mut s = ReadinessScore::no_data(1, "test");
        s.sample_count = 3;
        assert_eq!(s.validate(), Err(InvariantViolation::NoDataNotEmpty(1)));
    }

    #[test]
    fn self_edges_are_invalid() {
        let e = RoutingEdge { dependent: 7, provider: 7, source: "t".into() };
        assert_eq!(e.validate(), Err(InvariantViolation::SelfEdge(7)));
    }

    #[test]
    fn org_directory_falls_back() {
        let dir: OrgDirectory = [(13335, "Cloudflare".to_string())].into_iter().collect();
        assert_eq!(dir.label(13335), "Cloudflare");
        assert_eq!(dir.label(1), FALLBACK_OPERATOR);
    }
}
