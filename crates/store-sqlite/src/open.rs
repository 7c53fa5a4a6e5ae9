use crate::dataset::{create_table_sql, Dataset};
use crate::schema::MIG_0001_INIT;
use crate::staging::index_sql;
use crate::StoreError;
use rusqlite::Connection;
use std::time::Duration;
use tracing::{debug, info};
use v6scope_core::{OrgMapping, ReadinessScore, RegistryEntry, RoutingEdge};

/// Default age after which an abandoned dataset lock may be taken over.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Explicit persistence handle. Construct once, pass to each engine, close when done.
pub struct Db {
    pub conn: Connection,
    pub(crate) lock_ttl: Duration,
}

impl Db {
    pub fn open_or_create(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        info!(path = %path.display(), "store opened");
        Ok(Db { conn, lock_ttl: DEFAULT_LOCK_TTL })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Db { conn, lock_ttl: DEFAULT_LOCK_TTL })
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        debug!("store closed");
        Ok(())
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "mmap_size", 268435456i64)?; // 256 MiB
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    // naive: if endpoint_scans doesn't exist, apply 0001
    let exists: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name='endpoint_scans'",
        [],
        |r| r.get(0),
    )?;
    if exists == 0 {
        conn.execute_batch(MIG_0001_INIT)?;
    }
    // Production datasets exist from the start so readers never hit a missing table.
    create_production::<RegistryEntry>(conn)?;
    create_production::<OrgMapping>(conn)?;
    create_production::<ReadinessScore>(conn)?;
    create_production::<RoutingEdge>(conn)?;
    Ok(())
}

fn create_production<D: Dataset>(conn: &Connection) -> Result<(), StoreError> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
        [D::TABLE],
        |r| r.get(0),
    )?;
    if exists == 0 {
        conn.execute_batch(&create_table_sql::<D>(D::TABLE))?;
        for spec in D::INDEXES {
            conn.execute_batch(&index_sql(D::TABLE, "init", spec))?;
        }
    }
    Ok(())
}
