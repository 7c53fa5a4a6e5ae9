//! Staging areas and the atomic swap.
//!
//! A refresh of dataset `D` goes through `D::TABLE + "__staging"`: the staging table is
//! created, filled, indexed and then substituted for the production table by a single
//! `DROP` + `ALTER TABLE .. RENAME` transaction. Readers of the production table see the
//! old generation until that transaction commits and the new one afterwards.
//!
//! Each target has at most one staging holder at a time (`dataset_locks`). The lease is
//! re-entrant for the same holder so a crashed checkpointed job can resume its area, and
//! may be taken over once older than the handle's lock TTL. Every write, index and swap
//! renews the lease and fails with `LeaseLost` once another holder owns it.

use crate::dataset::{create_table_sql, insert_sql, Dataset};
use crate::{Db, IndexSpec, StoreError};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use std::marker::PhantomData;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

const POPULATE_CHUNK: usize = 5_000;

/// An isolated, not-yet-visible generation of dataset `D`.
#[derive(Debug)]
pub struct StagingArea<D: Dataset> {
    table: String,
    holder: String,
    rows: u64,
    indexed: Vec<IndexSpec>,
    _dataset: PhantomData<fn() -> D>,
}

impl<D: Dataset> StagingArea<D> {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Rows written so far, including rows from before a resume.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapReport {
    pub staging: String,
    pub target: String,
    pub previous_rows: u64,
    pub rows: u64,
}

pub fn staging_table(target: &str) -> String {
    format!("{target}__staging")
}

pub(crate) fn index_sql(table: &str, generation: &str, spec: &IndexSpec) -> String {
    let name = format!("ix_{table}_{generation}_{}", spec.columns.join("_"));
    let unique = if spec.unique { "UNIQUE " } else { "" };
    format!("CREATE {unique}INDEX IF NOT EXISTS {name} ON {table}({})", spec.columns.join(","))
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

impl Db {
    /// Create a fresh staging area for `D`, dropping any leftover one.
    pub fn stage<D: Dataset>(&self, holder: &str) -> Result<StagingArea<D>, StoreError> {
        self.acquire_lock(D::TABLE, holder)?;
        let table = staging_table(D::TABLE);
        self.conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
        self.conn.execute_batch(&create_table_sql::<D>(&table))?;
        debug!(staging = %table, holder, "staging area created");
        Ok(StagingArea { table, holder: holder.to_string(), rows: 0, indexed: Vec::new(), _dataset: PhantomData })
    }

    /// Reopen the staging area left by an interrupted run of `holder`, or create one.
    /// A staging table left by any other holder is dropped, never continued.
    pub fn resume_stage<D: Dataset>(&self, holder: &str) -> Result<StagingArea<D>, StoreError> {
        let owned = self.acquire_lock(D::TABLE, holder)?;
        let table = staging_table(D::TABLE);
        if !owned && self.table_exists(&table)? {
            warn!(staging = %table, holder, "staging area belongs to another holder; starting over");
            self.conn.execute_batch(&format!("DROP TABLE {table}"))?;
        }
        self.conn.execute_batch(&create_table_sql::<D>(&table))?;
        let rows: i64 = self.conn.query_row(&format!("SELECT COUNT(1) FROM {table}"), [], |r| r.get(0))?;
        if rows > 0 {
            info!(staging = %table, rows, "resuming staging area");
        }
        Ok(StagingArea { table, holder: holder.to_string(), rows: rows as u64, indexed: Vec::new(), _dataset: PhantomData })
    }

    /// Append records to the staging area in chunked transactions. Every record is
    /// validated first; the first violation aborts population.
    pub fn populate<D, I>(&self, area: &mut StagingArea<D>, records: I) -> Result<u64, StoreError>
    where
        D: Dataset,
        I: IntoIterator<Item = D>,
    {
        let mut written = 0u64;
        let mut chunk = Vec::with_capacity(POPULATE_CHUNK);
        for rec in records {
            chunk.push(rec);
            if chunk.len() >= POPULATE_CHUNK {
                written += self.write_chunk(area, &chunk, None)?;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            written += self.write_chunk(area, &chunk, None)?;
        }
        Ok(written)
    }

    /// Append one batch and advance `job`'s checkpoint to `last_key` in the same transaction.
    pub fn populate_checkpointed<D: Dataset>(
        &self,
        area: &mut StagingArea<D>,
        batch: &[D],
        job: &str,
        last_key: i64,
    ) -> Result<u64, StoreError> {
        self.write_chunk(area, batch, Some((job, last_key)))
    }

    fn write_chunk<D: Dataset>(
        &self,
        area: &mut StagingArea<D>,
        chunk: &[D],
        checkpoint: Option<(&str, i64)>,
    ) -> Result<u64, StoreError> {
        for (i, rec) in chunk.iter().enumerate() {
            rec.validate().map_err(|violation| StoreError::SchemaViolation {
                table: D::TABLE.to_string(),
                position: area.rows + i as u64 + 1,
                violation,
            })?;
        }
        let ingest = |source| StoreError::Ingestion { staging: area.table.clone(), source };
        let tx = self.conn.unchecked_transaction().map_err(ingest)?;
        renew_lease(&tx, D::TABLE, &area.holder)?;
        {
            let mut stmt = tx.prepare_cached(&insert_sql::<D>(&area.table)).map_err(ingest)?;
            for rec in chunk {
                stmt.execute(params_from_iter(rec.values())).map_err(ingest)?;
            }
        }
        if let Some((job, key)) = checkpoint {
            crate::checkpoint::save_in(&tx, job, key).map_err(ingest)?;
        }
        tx.commit().map_err(ingest)?;
        area.rows += chunk.len() as u64;
        Ok(chunk.len() as u64)
    }

    /// Build an index on the staging area. Unique indexes fail if the staged data has duplicates.
    pub fn index<D: Dataset>(&self, area: &mut StagingArea<D>, spec: IndexSpec) -> Result<(), StoreError> {
        if area.indexed.contains(&spec) {
            return Ok(());
        }
        renew_lease(&self.conn, D::TABLE, &area.holder)?;
        let generation = uuid::Uuid::new_v4().simple().to_string();
        self.conn
            .execute_batch(&index_sql(&area.table, &generation, &spec))
            .map_err(|source| StoreError::Ingestion { staging: area.table.clone(), source })?;
        area.indexed.push(spec);
        Ok(())
    }

    /// Replace production with the staging area in one transaction. Any of `D::INDEXES`
    /// not yet built are built first. On failure the staging area stays for inspection.
    pub fn swap<D: Dataset>(&self, area: StagingArea<D>) -> Result<SwapReport, StoreError> {
        self.swap_inner(area, None)
    }

    /// Like [`Db::swap`], and forget `job`'s checkpoint in the same transaction.
    pub fn swap_checkpointed<D: Dataset>(&self, area: StagingArea<D>, job: &str) -> Result<SwapReport, StoreError> {
        self.swap_inner(area, Some(job))
    }

    fn swap_inner<D: Dataset>(&self, mut area: StagingArea<D>, job: Option<&str>) -> Result<SwapReport, StoreError> {
        for spec in D::INDEXES {
            self.index(&mut area, *spec)?;
        }
        let target = D::TABLE;
        let swap_err = |source| StoreError::Swap { staging: area.table.clone(), target: target.to_string(), source };
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate).map_err(swap_err)?;
        renew_lease(&tx, target, &area.holder)?;
        let staged: i64 = tx
            .query_row(&format!("SELECT COUNT(1) FROM {}", area.table), [], |r| r.get(0))
            .map_err(swap_err)?;
        if staged as u64 != area.rows {
            return Err(StoreError::StagingMismatch { staging: area.table.clone(), expected: area.rows, found: staged as u64 });
        }
        let previous_rows: i64 = tx
            .query_row(&format!("SELECT COUNT(1) FROM {target}"), [], |r| r.get(0))
            .optional()
            .map_err(swap_err)?
            .unwrap_or(0);
        let result = tx
            .execute_batch(&format!("DROP TABLE IF EXISTS {target}; ALTER TABLE {} RENAME TO {target};", area.table))
            .and_then(|_| tx.execute("DELETE FROM dataset_locks WHERE target=? AND holder=?", params![target, area.holder]))
            .and_then(|_| match job {
                Some(job) => tx.execute("DELETE FROM ingestion_checkpoints WHERE job=?", [job]).map(|_| ()),
                None => Ok(()),
            })
            .and_then(|_| tx.commit());
        if let Err(e) = result {
            error!(staging = %area.table, target, error = %e, "atomic swap failed");
            return Err(swap_err(e));
        }
        info!(staging = %area.table, target, rows = area.rows, previous_rows, "atomic swap completed");
        Ok(SwapReport { staging: area.table.clone(), target: target.to_string(), previous_rows: previous_rows as u64, rows: area.rows })
    }

    /// Drop the staging area and release the lock. Production is untouched. A holder whose
    /// lease was taken over leaves the table alone; it belongs to the new holder.
    pub fn discard<D: Dataset>(&self, area: StagingArea<D>) -> Result<(), StoreError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let released =
            tx.execute("DELETE FROM dataset_locks WHERE target=? AND holder=?", params![D::TABLE, area.holder])?;
        if released == 0 {
            tx.commit()?;
            warn!(staging = %area.table, holder = %area.holder, "lease already lost; staging area left to its holder");
            return Ok(());
        }
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", area.table))?;
        tx.commit()?;
        warn!(staging = %area.table, rows = area.rows, "staging area discarded");
        Ok(())
    }

    /// Stage, populate, index and swap in one call; discard the staging area on any failure
    /// before the swap.
    pub fn refresh<D, I>(&self, holder: &str, records: I) -> Result<SwapReport, StoreError>
    where
        D: Dataset,
        I: IntoIterator<Item = D>,
    {
        let mut area = self.stage::<D>(holder)?;
        let prepared = self.populate(&mut area, records).and_then(|_| {
            for spec in D::INDEXES {
                self.index(&mut area, *spec)?;
            }
            Ok(())
        });
        if let Err(e) = prepared {
            error!(target = D::TABLE, error = %e, "population failed; production left unchanged");
            if let Err(de) = self.discard(area) {
                warn!(error = %de, "could not discard staging area");
            }
            return Err(e);
        }
        self.swap(area)
    }

    /// Take the lease on `target`. Returns `true` when `holder` already had it.
    fn acquire_lock(&self, target: &str, holder: &str) -> Result<bool, StoreError> {
        let now = unix_now();
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let current: Option<(String, i64)> = tx
            .query_row("SELECT holder, acquired_at FROM dataset_locks WHERE target=?", [target], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .optional()?;
        let owned = match current {
            Some((h, at)) if h != holder => {
                let age = now.saturating_sub(at);
                if age < self.lock_ttl.as_secs() as i64 {
                    return Err(StoreError::DatasetLocked { target: target.to_string(), holder: h });
                }
                warn!(target, previous = %h, age_secs = age, "taking over stale dataset lock");
                false
            }
            Some(_) => true,
            None => false,
        };
        tx.execute(
            "INSERT INTO dataset_locks(target, holder, acquired_at) VALUES (?,?,?)
             ON CONFLICT(target) DO UPDATE SET holder=excluded.holder, acquired_at=excluded.acquired_at",
            params![target, holder, now],
        )?;
        tx.commit()?;
        Ok(owned)
    }
}

/// Refresh `holder`'s lease on `target`; fails once the lease belongs to someone else.
fn renew_lease(conn: &Connection, target: &str, holder: &str) -> Result<(), StoreError> {
    let renewed = conn.execute(
        "UPDATE dataset_locks SET acquired_at=? WHERE target=? AND holder=?",
        params![unix_now(), target, holder],
    )?;
    if renewed == 0 {
        return Err(StoreError::LeaseLost { target: target.to_string(), holder: holder.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use v6scope_core::{InvariantViolation, ReadinessScore, RegistryEntry, RoutingEdge};

    fn entry(asn: u32) -> RegistryEntry {
        RegistryEntry {
            asn,
            region: "IN".into(),
            rir: "APNIC".into(),
            status: "allocated".into(),
            registry_date: None,
            source: "test".into(),
        }
    }

    fn edge(d: u32, p: u32) -> RoutingEdge {
        RoutingEdge { dependent: d, provider: p, source: "test".into() }
    }

    #[test]
    fn refresh_replaces_production_wholesale() {
        let db = Db::open_in_memory().unwrap();
        db.refresh("job", (1..=10).map(entry)).unwrap();
        assert_eq!(db.count(RegistryEntry::TABLE).unwrap(), 10);

        let report = db.refresh("job", (100..=102).map(entry)).unwrap();
        assert_eq!(report.previous_rows, 10);
        assert_eq!(report.rows, 3);
        assert_eq!(db.count(RegistryEntry::TABLE).unwrap(), 3);
        assert!(!db.table_exists(&staging_table(RegistryEntry::TABLE)).unwrap());
    }

    #[test]
    fn failed_population_leaves_production_untouched() {
        let db = Db::open_in_memory().unwrap();
        db.refresh("job", (1..=42).map(|i| edge(i, i + 1))).unwrap();

        // Record 501 of 10,000 is a self edge and is refused at the boundary.
        let records = (0..10_000u32).map(|i| if i == 500 { edge(9, 9) } else { edge(i + 1000, i + 50_000) });
        let err = db.refresh("job", records).unwrap_err();
        match err {
            StoreError::SchemaViolation { position, violation, .. } => {
                assert_eq!(position, 501);
                assert_eq!(violation, InvariantViolation::SelfEdge(9));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(db.count(RoutingEdge::TABLE).unwrap(), 42);
        assert!(!db.table_exists(&staging_table(RoutingEdge::TABLE)).unwrap());
    }

    #[test]
    fn duplicate_rows_fail_the_unique_index() {
        let db = Db::open_in_memory().unwrap();
        db.refresh("job", vec![edge(1, 2)]).unwrap();
        let err = db.refresh("job", vec![edge(3, 4), edge(3, 4)]).unwrap_err();
        assert!(matches!(err, StoreError::Ingestion { .. }), "{err}");
        assert_eq!(db.count(RoutingEdge::TABLE).unwrap(), 1);
    }

    #[test]
    fn out_of_range_percentage_is_rejected() {
        let db = Db::open_in_memory().unwrap();
        let mut bad = ReadinessScore::no_data(5, "t");
        bad.status = v6scope_core::ReadinessStatus::Ok;
        bad.capable_pct = 140.0;
        let err = db.refresh("job", vec![bad]).unwrap_err();
        assert!(matches!(err, StoreError::SchemaViolation { .. }));
    }

    #[test]
    fn second_holder_is_locked_out() {
        let db = Db::open_in_memory().unwrap();
        let area = db.stage::<RegistryEntry>("registry-a").unwrap();
        let err = db.stage::<RegistryEntry>("registry-b").unwrap_err();
        assert!(matches!(err, StoreError::DatasetLocked { ref holder, .. } if holder == "registry-a"));
        // Other datasets are independent.
        let other = db.stage::<RoutingEdge>("routes").unwrap();
        db.discard(other).unwrap();
        db.discard(area).unwrap();
        assert!(db.stage::<RegistryEntry>("registry-b").is_ok());
    }

    #[test]
    fn stale_lock_can_be_taken_over() {
        let db = Db::open_in_memory().unwrap().with_lock_ttl(Duration::ZERO);
        let _area = db.stage::<RegistryEntry>("crashed").unwrap();
        assert!(db.stage::<RegistryEntry>("fresh").is_ok());
    }

    #[test]
    fn resume_keeps_rows_of_the_same_holder() {
        let db = Db::open_in_memory().unwrap();
        let mut area = db.stage::<RegistryEntry>("enrich").unwrap();
        db.populate(&mut area, (1..=7).map(entry)).unwrap();
        drop(area); // simulated crash: no swap, no discard

        let resumed = db.resume_stage::<RegistryEntry>("enrich").unwrap();
        assert_eq!(resumed.rows(), 7);
        assert_eq!(db.count(RegistryEntry::TABLE).unwrap(), 0);
        let report = db.swap(resumed).unwrap();
        assert_eq!(report.rows, 7);
        assert_eq!(db.count(RegistryEntry::TABLE).unwrap(), 7);
    }

    #[test]
    fn displaced_holder_cannot_publish() {
        let db = Db::open_in_memory().unwrap().with_lock_ttl(Duration::ZERO);
        db.refresh("seed", (1..=4).map(entry)).unwrap();

        let mut a = db.stage::<RegistryEntry>("a").unwrap();
        db.populate(&mut a, (1..=10).map(entry)).unwrap();
        let mut b = db.stage::<RegistryEntry>("b").unwrap();
        db.populate(&mut b, (100..=102).map(entry)).unwrap();

        let err = db.populate(&mut a, (11..=12).map(entry)).unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { ref holder, .. } if holder == "a"), "{err}");
        let err = db.swap(a).unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }), "{err}");
        assert_eq!(db.count(RegistryEntry::TABLE).unwrap(), 4);

        let report = db.swap(b).unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(db.count(RegistryEntry::TABLE).unwrap(), 3);
    }

    #[test]
    fn displaced_holder_discard_keeps_the_new_holders_rows() {
        let db = Db::open_in_memory().unwrap().with_lock_ttl(Duration::ZERO);
        let a = db.stage::<RegistryEntry>("a").unwrap();
        let mut b = db.stage::<RegistryEntry>("b").unwrap();
        db.populate(&mut b, (1..=5).map(entry)).unwrap();

        db.discard(a).unwrap();
        assert_eq!(db.count(&staging_table(RegistryEntry::TABLE)).unwrap(), 5);
        assert_eq!(db.swap(b).unwrap().rows, 5);
    }

    #[test]
    fn resume_does_not_continue_another_holders_area() {
        let db = Db::open_in_memory().unwrap().with_lock_ttl(Duration::ZERO);
        let mut a = db.stage::<RegistryEntry>("a").unwrap();
        db.populate(&mut a, (1..=5).map(entry)).unwrap();

        let b = db.resume_stage::<RegistryEntry>("b").unwrap();
        assert_eq!(b.rows(), 0);
        assert!(matches!(db.populate(&mut a, vec![entry(6)]), Err(StoreError::LeaseLost { .. })));

        // A released lease does not hand its leftovers to the next resumer either.
        let mut c = db.stage::<RegistryEntry>("c").unwrap();
        db.populate(&mut c, (1..=3).map(entry)).unwrap();
        db.conn.execute("DELETE FROM dataset_locks", []).unwrap();
        assert_eq!(db.resume_stage::<RegistryEntry>("c").unwrap().rows(), 0);
    }

    #[test]
    fn checkpointed_swap_clears_the_checkpoint_with_the_publish() {
        let db = Db::open_in_memory().unwrap();
        let mut area = db.stage::<RegistryEntry>("enrich").unwrap();
        let batch: Vec<_> = (1..=4).map(entry).collect();
        db.populate_checkpointed(&mut area, &batch, "enrich", 4).unwrap();
        assert_eq!(db.checkpoints().last("enrich").unwrap(), Some(4));

        db.swap_checkpointed(area, "enrich").unwrap();
        assert_eq!(db.checkpoints().last("enrich").unwrap(), None);
        assert_eq!(db.count(RegistryEntry::TABLE).unwrap(), 4);
    }

    #[test]
    fn swap_refuses_a_staging_table_that_changed_underneath() {
        let db = Db::open_in_memory().unwrap();
        let mut area = db.stage::<RegistryEntry>("job").unwrap();
        db.populate(&mut area, (1..=5).map(entry)).unwrap();
        db.conn.execute(&format!("DELETE FROM {} WHERE asn > 2", area.table()), []).unwrap();

        let err = db.swap(area).unwrap_err();
        assert!(matches!(err, StoreError::StagingMismatch { expected: 5, found: 2, .. }), "{err}");
        assert_eq!(db.count(RegistryEntry::TABLE).unwrap(), 0);
    }

    #[test]
    fn readers_never_observe_a_partial_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swap.db");
        let writer = Db::open_or_create(&path).unwrap();
        writer.refresh("job", (0..300u32).map(|i| edge(i, i + 1))).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let done_r = done.clone();
        let reader_path = path.clone();
        let reader = std::thread::spawn(move || {
            let db = Db::open_or_create(&reader_path).unwrap();
            let mut seen = Vec::new();
            while !done_r.load(Ordering::SeqCst) {
                seen.push(db.count(RoutingEdge::TABLE).unwrap());
            }
            seen.push(db.count(RoutingEdge::TABLE).unwrap());
            seen
        });

        for round in 0..5u32 {
            let n = if round % 2 == 0 { 12_000 } else { 300 };
            writer.refresh("job", (0..n).map(|i| edge(i, i + 1))).unwrap();
        }
        done.store(true, Ordering::SeqCst);
        let seen = reader.join().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|&c| c == 300 || c == 12_000), "intermediate count observed");
        assert_eq!(*seen.last().unwrap(), 12_000);
    }
}
