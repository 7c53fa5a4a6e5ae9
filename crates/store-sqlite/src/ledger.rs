//! Append-only provenance ledger with per-entry content checksums.

use crate::{Db, StoreError};
use rusqlite::{params, Row};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub entry_id: i64,
    pub op_type: String,
    pub target: String,
    pub timestamp: String,
    pub params: Value,
    pub result_summary: Value,
    pub checksum: String,
}

/// An entry whose stored checksum no longer matches its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerMismatch {
    pub entry_id: i64,
    pub timestamp: String,
    pub expected: String,
    pub actual: String,
}

/// SHA-256 over the canonical JSON of the entry content. Object keys serialize sorted.
pub fn checksum(op_type: &str, target: &str, timestamp: &str, params: &Value, result_summary: &Value) -> String {
    let canonical = json!({
        "op_type": op_type,
        "target": target,
        "timestamp": timestamp,
        "params": params,
        "result_summary": result_summary,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

impl LedgerEntry {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<(LedgerEntry, String, String)> {
        let params_json: String = r.get(4)?;
        let summary_json: String = r.get(5)?;
        Ok((
            LedgerEntry {
                entry_id: r.get(0)?,
                op_type: r.get(1)?,
                target: r.get(2)?,
                timestamp: r.get(3)?,
                params: Value::Null,
                result_summary: Value::Null,
                checksum: r.get(6)?,
            },
            params_json,
            summary_json,
        ))
    }

    fn decode((mut entry, params_json, summary_json): (LedgerEntry, String, String)) -> Result<LedgerEntry, StoreError> {
        entry.params = serde_json::from_str(&params_json)?;
        entry.result_summary = serde_json::from_str(&summary_json)?;
        Ok(entry)
    }

    fn recompute(&self) -> String {
        checksum(&self.op_type, &self.target, &self.timestamp, &self.params, &self.result_summary)
    }
}

const SELECT_ENTRY: &str =
    "SELECT entry_id, op_type, target, timestamp, params_json, summary_json, checksum FROM provenance_ledger";

impl Db {
    /// Append one operation record; returns its entry id.
    pub fn record_operation<P, S>(&self, op_type: &str, target: &str, params: &P, result_summary: &S) -> Result<i64, StoreError>
    where
        P: Serialize + ?Sized,
        S: Serialize + ?Sized,
    {
        let params = serde_json::to_value(params)?;
        let summary = serde_json::to_value(result_summary)?;
        let timestamp = v6scope_core::now_rfc3339();
        let sum = checksum(op_type, target, &timestamp, &params, &summary);
        self.conn.execute(
            "INSERT INTO provenance_ledger(op_type, target, timestamp, params_json, summary_json, checksum)
             VALUES (?,?,?,?,?,?)",
            params![op_type, target, timestamp, params.to_string(), summary.to_string(), sum],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(entry_id = id, op_type, target, "ledger entry recorded");
        Ok(id)
    }

    /// Entries for `target`, newest first.
    pub fn provenance(&self, target: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_ENTRY} WHERE target=? ORDER BY entry_id DESC"))?;
        let rows = stmt.query_map([target], LedgerEntry::from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(LedgerEntry::decode(r?)?);
        }
        Ok(out)
    }

    /// Most recent entries across every target.
    pub fn ledger_tail(&self, limit: u32) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_ENTRY} ORDER BY entry_id DESC LIMIT ?"))?;
        let rows = stmt.query_map([limit], LedgerEntry::from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(LedgerEntry::decode(r?)?);
        }
        Ok(out)
    }

    /// Recompute every checksum and report entries that do not match.
    pub fn verify_ledger(&self) -> Result<Vec<LedgerMismatch>, StoreError> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_ENTRY} ORDER BY entry_id"))?;
        let rows = stmt.query_map([], LedgerEntry::from_row)?;
        let mut mismatches = Vec::new();
        for r in rows {
            let (entry, params_json, summary_json) = r?;
            let actual = match LedgerEntry::decode((entry.clone(), params_json, summary_json)) {
                Ok(decoded) => decoded.recompute(),
                Err(_) => String::from("<unreadable>"),
            };
            if actual != entry.checksum {
                warn!(entry_id = entry.entry_id, "ledger checksum mismatch");
                mismatches.push(LedgerMismatch {
                    entry_id: entry.entry_id,
                    timestamp: entry.timestamp,
                    expected: entry.checksum,
                    actual,
                });
            }
        }
        Ok(mismatches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_listed_newest_first() {
        let db = Db::open_in_memory().unwrap();
        db.record_operation("ingest", "asn_registry", &json!({"file": "a"}), &json!({"rows": 1})).unwrap();
        db.record_operation("ingest", "asn_registry", &json!({"file": "b"}), &json!({"rows": 2})).unwrap();
        db.record_operation("scan", "endpoint_scans", &json!({}), &json!({})).unwrap();

        let entries = db.provenance("asn_registry").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].params["file"], "b");
        assert_eq!(entries[1].result_summary["rows"], 1);
        assert!(db.provenance("nothing").unwrap().is_empty());
        assert_eq!(db.ledger_tail(10).unwrap().len(), 3);
    }

    #[test]
    fn untouched_ledger_verifies_clean() {
        let db = Db::open_in_memory().unwrap();
        for i in 0..5 {
            db.record_operation("enrich", "asn_readiness", &json!({"batch": i}), &json!({"ok": true})).unwrap();
        }
        assert!(db.verify_ledger().unwrap().is_empty());
    }

    #[test]
    fn ledger_rejects_updates_and_deletes() {
        let db = Db::open_in_memory().unwrap();
        db.record_operation("ingest", "asn_registry", &json!({}), &json!({})).unwrap();
        assert!(db.conn.execute("UPDATE provenance_ledger SET target='x'", []).is_err());
        assert!(db.conn.execute("DELETE FROM provenance_ledger", []).is_err());
    }

    #[test]
    fn tampering_is_detected() {
        let db = Db::open_in_memory().unwrap();
        db.record_operation("ingest", "asn_registry", &json!({"file": "a"}), &json!({"rows": 10})).unwrap();
        let id = db.record_operation("ingest", "asn_registry", &json!({"file": "b"}), &json!({"rows": 20})).unwrap();

        db.conn.execute_batch("DROP TRIGGER provenance_ledger_no_update").unwrap();
        db.conn
            .execute("UPDATE provenance_ledger SET summary_json='{\"rows\":21}' WHERE entry_id=?", [id])
            .unwrap();

        let bad = db.verify_ledger().unwrap();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].entry_id, id);
        assert_ne!(bad[0].expected, bad[0].actual);
    }

    #[test]
    fn checksum_is_key_order_independent() {
        let a = checksum("op", "t", "ts", &json!({"x": 1, "y": 2}), &json!({}));
        let b = checksum("op", "t", "ts", &json!({"y": 2, "x": 1}), &json!({}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
