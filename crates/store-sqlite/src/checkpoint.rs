use crate::{Db, StoreError};
use rusqlite::{params, Connection, OptionalExtension};

/// Resume markers for long-running ingestion jobs, keyed by job name.
pub struct Checkpoints<'a> {
    conn: &'a Connection,
}

impl Db {
    pub fn checkpoints(&self) -> Checkpoints<'_> {
        Checkpoints { conn: &self.conn }
    }
}

impl Checkpoints<'_> {
    /// Last fully processed key, if the job has one.
    pub fn last(&self, job: &str) -> Result<Option<i64>, StoreError> {
        let key = self
            .conn
            .query_row("SELECT last_key FROM ingestion_checkpoints WHERE job=?", [job], |r| r.get(0))
            .optional()?;
        Ok(key)
    }

    pub fn save(&self, job: &str, last_key: i64) -> Result<(), StoreError> {
        save_in(self.conn, job, last_key)?;
        Ok(())
    }

    /// Forget the job's marker; the next run starts from the beginning.
    pub fn clear(&self, job: &str) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM ingestion_checkpoints WHERE job=?", [job])?;
        Ok(())
    }
}

pub(crate) fn save_in(conn: &Connection, job: &str, last_key: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO ingestion_checkpoints(job, last_key, updated_at) VALUES (?,?,?)
         ON CONFLICT(job) DO UPDATE SET last_key=excluded.last_key, updated_at=excluded.updated_at",
        params![job, last_key, v6scope_core::now_rfc3339()],
    )?;
    Ok(())
}
