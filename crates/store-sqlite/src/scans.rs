use crate::{Db, StoreError};
use rusqlite::{params, Row};
use v6scope_core::{Check, Measurement, Rollup, ScanRecord};

const SCAN_COLUMNS: &str = "endpoint, grp, sector, ipv6_dns, ipv4_dns, ipv6_web, dnssec, ipv4_rtt_ms, ipv6_rtt_ms, asn, operator, status, error, checked_at";

fn scan_from_row(r: &Row<'_>) -> rusqlite::Result<ScanRecord> {
    let status: String = r.get(11)?;
    let status = status
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(ScanRecord {
        group: r.get(1)?,
        sector: r.get(2)?,
        measurement: Measurement {
            endpoint: r.get(0)?,
            ipv6_dns: Check::from_sql(r.get(3)?),
            ipv4_dns: Check::from_sql(r.get(4)?),
            ipv6_web: Check::from_sql(r.get(5)?),
            dnssec: Check::from_sql(r.get(6)?),
            ipv4_rtt_ms: r.get(7)?,
            ipv6_rtt_ms: r.get(8)?,
            asn: r.get(9)?,
            operator: r.get(10)?,
            status,
            error: r.get(12)?,
            checked_at: r.get(13)?,
        },
    })
}

fn rollup_from_row(r: &Row<'_>) -> rusqlite::Result<Rollup> {
    let grp: String = r.get(2)?;
    Ok(Rollup {
        date: r.get(0)?,
        sector: r.get(1)?,
        group: if grp.is_empty() { None } else { Some(grp) },
        total: r.get::<_, i64>(3)? as u64,
        ready: r.get::<_, i64>(4)? as u64,
        rate: r.get(5)?,
        timestamp: r.get(6)?,
    })
}

impl Db {
    /// Append a batch of scan records in one transaction. The whole batch is refused
    /// if any record breaks a measurement invariant.
    pub fn insert_scans(&self, records: &[ScanRecord]) -> Result<usize, StoreError> {
        for (i, rec) in records.iter().enumerate() {
            rec.measurement.validate().map_err(|violation| StoreError::SchemaViolation {
                table: "endpoint_scans".into(),
                position: i as u64 + 1,
                violation,
            })?;
        }
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO endpoint_scans({SCAN_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)"
            ))?;
            for rec in records {
                let m = &rec.measurement;
                stmt.execute(params![
                    m.endpoint,
                    rec.group,
                    rec.sector,
                    m.ipv6_dns.to_sql(),
                    m.ipv4_dns.to_sql(),
                    m.ipv6_web.to_sql(),
                    m.dnssec.to_sql(),
                    m.ipv4_rtt_ms,
                    m.ipv6_rtt_ms,
                    m.asn,
                    m.operator,
                    m.status.as_str(),
                    m.error,
                    m.checked_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Insert or replace the snapshot for `(date, sector, group)`.
    pub fn upsert_rollup(&self, rollup: &Rollup) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO history_logs(date, sector, grp, total, ready, rate, timestamp) VALUES (?,?,?,?,?,?,?)
             ON CONFLICT(date, sector, grp) DO UPDATE SET total=excluded.total, ready=excluded.ready, rate=excluded.rate, timestamp=excluded.timestamp",
            params![
                rollup.date,
                rollup.sector,
                rollup.group.as_deref().unwrap_or(""),
                rollup.total as i64,
                rollup.ready as i64,
                rollup.rate,
                rollup.timestamp,
            ],
        )?;
        Ok(())
    }

    /// Daily snapshots for a sector, oldest first. `group = None` selects the sector aggregate.
    pub fn rollup_history(&self, sector: &str, group: Option<&str>) -> Result<Vec<Rollup>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT date, sector, grp, total, ready, rate, timestamp FROM history_logs
             WHERE sector=? AND grp=? ORDER BY date",
        )?;
        let rows = stmt.query_map(params![sector, group.unwrap_or("")], rollup_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The most recent record of every endpoint scanned in a sector.
    pub fn latest_scans(&self, sector: &str) -> Result<Vec<ScanRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SCAN_COLUMNS} FROM endpoint_scans s
             WHERE sector=?1 AND scan_id = (
               SELECT scan_id FROM endpoint_scans t
               WHERE t.sector=?1 AND t.endpoint=s.endpoint
               ORDER BY t.checked_at DESC, t.scan_id DESC LIMIT 1)
             ORDER BY grp, endpoint"
        ))?;
        let rows = stmt.query_map([sector], scan_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
