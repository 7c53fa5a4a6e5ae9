use std::collections::HashSet;
use std::io::BufRead;
use std::str::FromStr;
use anyhow::{anyhow, Result};
use tracing::{debug, info};
use v6scope_core::{Asn, RoutingEdge};

pub const PROGRESS_EVERY: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFormat {
    /// One path per line, identifiers separated by whitespace.
    Plain,
    /// `bgpdump -m` output; the path is the seventh `|` field.
    Bgpdump,
    /// Bgpdump when the line contains `|`, plain otherwise.
    Auto,
}

impl FromStr for PathFormat {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(PathFormat::Plain),
            "bgpdump" => Ok(PathFormat::Bgpdump),
            "auto" => Ok(PathFormat::Auto),
            other => Err(anyhow!("unknown path format {other:?} (plain, bgpdump, auto)")),
        }
    }
}

/// Collapses observed paths into the set of distinct `(dependent, provider)` pairs.
/// Memory grows with distinct edges only.
#[derive(Debug, Default)]
pub struct EdgeSetBuilder {
    edges: HashSet<(Asn, Asn)>,
    records: u64,
    failures: u64,
}

impl EdgeSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an edge for every adjacent pair; self pairs (path prepending) are skipped.
    pub fn add_path(&mut self, path: &[Asn]) {
        for w in path.windows(2) {
            if w[0] != w[1] {
                self.edges.insert((w[0], w[1]));
            }
        }
    }

    fn add_record(&mut self, path: &str) -> bool {
        let mut seq: Vec<Asn> = Vec::new();
        let mut segments: Vec<Vec<Asn>> = Vec::new();
        for token in path.split_whitespace() {
            if token.starts_with('{') || token.starts_with('[') {
                // AS_SET: no ordering inside, so the sequence stops here.
                segments.push(std::mem::take(&mut seq));
                continue;
            }
            match token.parse::<Asn>() {
                Ok(asn) => seq.push(asn),
                Err(_) => return false,
            }
        }
        segments.push(seq);
        for s in &segments {
            self.add_path(s);
        }
        true
    }

    pub fn add_line(&mut self, line: &str, format: PathFormat) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        self.records += 1;
        let bgpdump = match format {
            PathFormat::Plain => false,
            PathFormat::Bgpdump => true,
            PathFormat::Auto => line.contains('|'),
        };
        let path = if bgpdump { line.split('|').nth(6) } else { Some(line) };
        let ok = match path {
            Some(p) => self.add_record(p),
            None => false,
        };
        if !ok {
            debug!(line, "unparseable path record");
            self.failures += 1;
        }
        if self.records % PROGRESS_EVERY == 0 {
            info!(records = self.records, edges = self.edges.len(), failures = self.failures, "routing dump progress");
        }
    }

    pub fn read(&mut self, reader: impl BufRead, format: PathFormat) -> Result<()> {
        for line in reader.lines() {
            self.add_line(&line?, format);
        }
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Edges sorted by `(dependent, provider)`.
    pub fn into_edges(self, source: &str) -> Vec<RoutingEdge> {
        let mut pairs: Vec<(Asn, Asn)> = self.edges.into_iter().collect();
        pairs.sort_unstable();
        pairs
            .into_iter()
            .map(|(dependent, provider)| RoutingEdge { dependent, provider, source: source.to_string() })
            .collect()
    }
}

/// Distinct edge set of a batch of paths.
pub fn build<P: AsRef<[Asn]>>(paths: &[P]) -> HashSet<(Asn, Asn)> {
    let mut b = EdgeSetBuilder::new();
    for p in paths {
        b.add_path(p.as_ref());
    }
    b.edges
}
