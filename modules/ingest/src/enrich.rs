//! Checkpointed, rate-limited per-identifier readiness enrichment.
//!
//! Identifiers are processed in ascending order. Every `batch_size` scores are appended to
//! the staging area together with a checkpoint on the last identifier of the batch, so an
//! interrupted run resumes after that identifier and ends with the same dataset as an
//! uninterrupted one. Production is replaced only when the whole keyspace is done.

use crate::JobReport;
use anyhow::{anyhow, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use v6scope_core::ratelimiter::RateLimiter;
use v6scope_core::{Asn, ReadinessScore};
use v6scope_store::{Db, StagingArea};

pub const JOB: &str = "enrich-readiness";
pub const DEFAULT_URL_TEMPLATE: &str = "https://data1.labs.apnic.net/v6stats/v6as/AS{asn}.json";

/// Raw counts reported for one identifier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Samples {
    #[serde(default)]
    pub cc: Option<String>,
    #[serde(default)]
    pub samples: f64,
    #[serde(default)]
    pub capable: f64,
    #[serde(default)]
    pub preferred: f64,
}

/// Where per-identifier counts come from. `Ok(None)` means the source has nothing for it.
pub trait ReadinessSource: Send + Sync {
    fn fetch(&self, asn: Asn) -> impl Future<Output = Result<Option<Samples>>> + Send;
}

pub struct HttpSource {
    client: Client,
    url_template: String,
}

impl HttpSource {
    /// `url_template` must contain `{asn}`.
    pub fn new(url_template: &str, timeout: Duration) -> Result<Self> {
        if !url_template.contains("{asn}") {
            return Err(anyhow!("url template {url_template:?} has no {{asn}} placeholder"));
        }
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("v6scope/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()?;
        Ok(HttpSource { client, url_template: url_template.to_string() })
    }
}

impl ReadinessSource for HttpSource {
    async fn fetch(&self, asn: Asn) -> Result<Option<Samples>> {
        let url = self.url_template.replace("{asn}", &asn.to_string());
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.json::<Samples>().await?))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichOptions {
    /// Job name; also the checkpoint key and the staging lock holder.
    pub job: String,
    pub batch_size: usize,
    pub rate_per_sec: u32,
    /// Extra sleep after every request, on top of the token bucket.
    pub pause: Duration,
    /// Stop after this many identifiers, leaving the run resumable.
    pub max_items: Option<usize>,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        EnrichOptions {
            job: JOB.to_string(),
            batch_size: 50,
            rate_per_sec: 2,
            pause: Duration::from_millis(100),
            max_items: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum EnrichOutcome {
    Completed(JobReport),
    /// Stopped early; the checkpoint and staging area are kept for the next run.
    Suspended { processed: u64, checkpoint: Option<i64> },
}

async fn score_for<S: ReadinessSource>(db: &Db, source: &S, asn: Asn, label: &str) -> Result<ReadinessScore> {
    let region = || db.registry_region(asn);
    let score = match source.fetch(asn).await {
        Ok(Some(s)) if s.samples >= 1.0 => {
            let cc = s.cc.filter(|c| !c.is_empty()).map(|c| c.to_ascii_uppercase());
            let region = match cc {
                Some(cc) => Some(cc),
                None => region()?,
            };
            let counts = |v: f64| v.max(0.0).round() as u64;
            match ReadinessScore::from_samples(asn, region, counts(s.samples), counts(s.capable), counts(s.preferred), label) {
                Ok(score) => score,
                Err(violation) => {
                    warn!(asn, %violation, "inconsistent counts; recording no-data");
                    ReadinessScore::no_data(asn, label)
                }
            }
        }
        Ok(_) => ReadinessScore { region: region()?, ..ReadinessScore::no_data(asn, label) },
        Err(e) => {
            warn!(asn, error = %e, "fetch failed; recording no-data");
            ReadinessScore { region: region()?, ..ReadinessScore::no_data(asn, label) }
        }
    };
    Ok(score)
}

fn flush(db: &Db, area: &mut StagingArea<ReadinessScore>, batch: &mut Vec<ReadinessScore>, job: &str) -> Result<()> {
    let Some(last) = batch.last().map(|s| i64::from(s.asn)) else {
        return Ok(());
    };
    db.populate_checkpointed(area, batch, job, last)?;
    debug!(job, rows = area.rows(), checkpoint = last, "batch staged");
    batch.clear();
    Ok(())
}

/// Enrich `asns`, resuming from the job's checkpoint when one exists.
pub async fn enrich_readiness<S: ReadinessSource>(
    db: &Db,
    source: &S,
    mut asns: Vec<Asn>,
    opts: &EnrichOptions,
) -> Result<EnrichOutcome> {
    let job = opts.job.as_str();
    let batch_size = opts.batch_size.max(1);
    asns.sort_unstable();
    asns.dedup();
    let total = asns.len();

    let checkpoint = db.checkpoints().last(job)?;
    let mut area = match checkpoint {
        Some(last) => {
            let area = db.resume_stage::<ReadinessScore>(job)?;
            let done = asns.iter().take_while(|&&a| i64::from(a) <= last).count();
            if area.rows() == done as u64 {
                asns.drain(..done);
                info!(job, checkpoint = last, remaining = asns.len(), staged = area.rows(), "resuming enrichment");
                area
            } else {
                // Staged rows no longer back the checkpoint (area lost, or the key set changed).
                warn!(job, checkpoint = last, staged = area.rows(), expected = done, "checkpoint is stale; starting over");
                db.checkpoints().clear(job)?;
                db.stage::<ReadinessScore>(job)?
            }
        }
        None => db.stage::<ReadinessScore>(job)?,
    };

    let limiter = RateLimiter::new(opts.rate_per_sec);
    let budget = opts.max_items.unwrap_or(usize::MAX);
    let mut batch = Vec::with_capacity(batch_size);
    let mut processed = 0usize;

    let run: Result<()> = async {
        for &asn in asns.iter().take(budget) {
            limiter.acquire().await;
            batch.push(score_for(db, source, asn, job).await?);
            processed += 1;
            if batch.len() >= batch_size {
                flush(db, &mut area, &mut batch, job)?;
                info!(job, processed, remaining = asns.len() - processed, "enrichment progress");
            }
            if !opts.pause.is_zero() {
                tokio::time::sleep(opts.pause).await;
            }
        }
        flush(db, &mut area, &mut batch, job)
    }
    .await;

    if let Err(e) = run {
        error!(job, error = %e, "enrichment aborted; production left unchanged");
        db.discard(area)?;
        db.checkpoints().clear(job)?;
        return Err(e);
    }

    if processed < asns.len() {
        let checkpoint = db.checkpoints().last(job)?;
        info!(job, processed, checkpoint, "enrichment suspended");
        return Ok(EnrichOutcome::Suspended { processed: processed as u64, checkpoint });
    }

    let swap = db.swap_checkpointed(area, job)?;
    let ledger_entry = db.record_operation(
        "enrich-readiness",
        &swap.target,
        &json!({ "job": job, "identifiers": total, "resumed_from": checkpoint, "batch_size": batch_size, "rate_per_sec": opts.rate_per_sec }),
        &json!({ "records": swap.rows, "processed_this_run": processed, "previous_rows": swap.previous_rows }),
    )?;
    info!(job, rows = swap.rows, "enrichment complete");
    Ok(EnrichOutcome::Completed(JobReport {
        target: swap.target.clone(),
        records: swap.rows,
        skipped: 0,
        parse_failures: 0,
        swap,
        ledger_entry,
    }))
}

/// Enrich every identifier of the current registry generation.
pub async fn enrich_registry<S: ReadinessSource>(db: &Db, source: &S, opts: &EnrichOptions) -> Result<EnrichOutcome> {
    let asns = db.registry_asns()?;
    if asns.is_empty() {
        warn!("registry is empty; nothing to enrich");
    }
    enrich_readiness(db, source, asns, opts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use v6scope_core::ReadinessStatus;

    #[derive(Default)]
    struct FakeSource {
        calls: AtomicUsize,
    }

    impl ReadinessSource for FakeSource {
        async fn fetch(&self, asn: Asn) -> Result<Option<Samples>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if asn % 11 == 0 {
                return Err(anyhow!("HTTP 503"));
            }
            if asn % 13 == 0 {
                return Ok(None);
            }
            let samples = f64::from(asn % 7) * 100.0;
            Ok(Some(Samples { cc: Some("in".into()), samples, capable: samples / 2.0, preferred: samples / 4.0 }))
        }
    }

    fn opts(max_items: Option<usize>) -> EnrichOptions {
        EnrichOptions { rate_per_sec: 1000, pause: Duration::ZERO, max_items, ..Default::default() }
    }

    type Row = (u32, f64, f64, i64, String, Option<String>);

    fn rows(db: &Db) -> Vec<Row> {
        let mut stmt = db
            .conn
            .prepare("SELECT asn, capable_pct, preferred_pct, sample_count, status, region FROM asn_readiness ORDER BY asn")
            .unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)))
            .unwrap();
        rows.collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[tokio::test]
    async fn uninterrupted_run_scores_every_identifier() {
        let db = Db::open_in_memory().unwrap();
        let source = FakeSource::default();
        let outcome = enrich_readiness(&db, &source, (1..=120).rev().collect(), &opts(None)).await.unwrap();
        let EnrichOutcome::Completed(report) = outcome else { panic!("expected completion") };
        assert_eq!(report.records, 120);
        assert_eq!(db.checkpoints().last(JOB).unwrap(), None);

        let all = rows(&db);
        assert_eq!(all.len(), 120);
        let three = &all[2];
        assert_eq!((three.1, three.2, three.3), (50.0, 25.0, 300));
        assert_eq!(three.5.as_deref(), Some("IN"));
        assert_eq!(all[10].4, ReadinessStatus::NoData.as_str()); // 11: fetch error
        assert_eq!(all[6].4, ReadinessStatus::NoData.as_str()); // 7: zero samples
        assert_eq!(db.provenance("asn_readiness").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resumed_run_matches_uninterrupted_run() {
        let keys: Vec<Asn> = (1..=230).collect();

        let reference = Db::open_in_memory().unwrap();
        enrich_readiness(&reference, &FakeSource::default(), keys.clone(), &opts(None)).await.unwrap();

        let db = Db::open_in_memory().unwrap();
        let outcome = enrich_readiness(&db, &FakeSource::default(), keys.clone(), &opts(Some(120))).await.unwrap();
        match outcome {
            EnrichOutcome::Suspended { processed, checkpoint } => {
                assert_eq!(processed, 120);
                assert_eq!(checkpoint, Some(120));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(db.count("asn_readiness").unwrap(), 0);

        let second = FakeSource::default();
        let outcome = enrich_readiness(&db, &second, keys, &opts(None)).await.unwrap();
        assert!(matches!(outcome, EnrichOutcome::Completed(_)));
        assert_eq!(second.calls.load(Ordering::SeqCst), 110);
        assert_eq!(rows(&db), rows(&reference));
    }

    #[tokio::test]
    async fn suspended_run_keeps_production_and_lock() {
        let db = Db::open_in_memory().unwrap();
        db.refresh("seed", (1..=3).map(|a| ReadinessScore::no_data(a, "seed"))).unwrap();

        enrich_readiness(&db, &FakeSource::default(), (1..=80).collect(), &opts(Some(60))).await.unwrap();
        assert_eq!(db.count("asn_readiness").unwrap(), 3);
        assert_eq!(db.checkpoints().last(JOB).unwrap(), Some(60));
        // Another writer cannot refresh the dataset while the job is parked.
        let err = db.refresh("bulk", vec![ReadinessScore::no_data(9, "bulk")]).unwrap_err();
        assert!(matches!(err, v6scope_store::StoreError::DatasetLocked { .. }));
    }

    #[tokio::test]
    async fn leftover_checkpoint_without_staging_restarts_from_the_beginning() {
        let db = Db::open_in_memory().unwrap();
        let keys: Vec<Asn> = (1..=100).collect();
        enrich_readiness(&db, &FakeSource::default(), keys.clone(), &opts(None)).await.unwrap();
        let reference = rows(&db);
        assert_eq!(reference.len(), 100);

        // A crash between publishing and forgetting the marker leaves it behind.
        db.checkpoints().save(JOB, 100).unwrap();
        let source = FakeSource::default();
        let outcome = enrich_readiness(&db, &source, keys, &opts(None)).await.unwrap();
        assert!(matches!(outcome, EnrichOutcome::Completed(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 100);
        assert_eq!(rows(&db), reference);
        assert_eq!(db.checkpoints().last(JOB).unwrap(), None);
    }

    #[tokio::test]
    async fn parked_run_taken_over_by_a_bulk_refresh_starts_over() {
        let db = Db::open_in_memory().unwrap().with_lock_ttl(Duration::ZERO);
        let keys: Vec<Asn> = (1..=100).collect();
        enrich_readiness(&db, &FakeSource::default(), keys.clone(), &opts(Some(60))).await.unwrap();
        assert_eq!(db.checkpoints().last(JOB).unwrap(), Some(60));

        // The parked lease is stale, so a bulk load replaces the dataset and its staging area.
        db.refresh("bulk", (1..=5).map(|a| ReadinessScore::no_data(a, "bulk"))).unwrap();

        let outcome = enrich_readiness(&db, &FakeSource::default(), keys, &opts(None)).await.unwrap();
        let EnrichOutcome::Completed(report) = outcome else { panic!("expected completion") };
        assert_eq!(report.records, 100);
        assert_eq!(db.count("asn_readiness").unwrap(), 100);
    }

    #[test]
    fn url_template_needs_placeholder() {
        assert!(HttpSource::new("https://example.invalid/as.json", Duration::from_secs(1)).is_err());
        assert!(HttpSource::new(DEFAULT_URL_TEMPLATE, Duration::from_secs(1)).is_ok());
    }
}
