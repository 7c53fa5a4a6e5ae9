pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE endpoint_scans (
  scan_id         INTEGER PRIMARY KEY AUTOINCREMENT,
  endpoint        TEXT NOT NULL CHECK (length(endpoint) > 0),
  grp             TEXT NOT NULL,
  sector          TEXT NOT NULL,
  ipv6_dns        INTEGER CHECK (ipv6_dns IN (0,1)),
  ipv4_dns        INTEGER CHECK (ipv4_dns IN (0,1)),
  ipv6_web        INTEGER CHECK (ipv6_web IN (0,1)),
  dnssec          INTEGER CHECK (dnssec IN (0,1)),
  ipv4_rtt_ms     REAL CHECK (ipv4_rtt_ms IS NULL OR ipv4_rtt_ms >= 0),
  ipv6_rtt_ms     REAL CHECK (ipv6_rtt_ms IS NULL OR (ipv6_rtt_ms >= 0 AND ipv6_web = 1)),
  asn             INTEGER CHECK (asn IS NULL OR asn >= 0),
  operator        TEXT,
  status          TEXT NOT NULL CHECK (status IN ('ready','partial','missing','error')),
  error           TEXT,
  checked_at      TEXT NOT NULL
);

CREATE TABLE history_logs (
  date            TEXT NOT NULL,
  sector          TEXT NOT NULL,
  grp             TEXT NOT NULL DEFAULT '',
  total           INTEGER NOT NULL CHECK (total >= 0),
  ready           INTEGER NOT NULL CHECK (ready >= 0 AND ready <= total),
  rate            REAL NOT NULL CHECK (rate BETWEEN 0 AND 100),
  timestamp       TEXT NOT NULL,
  PRIMARY KEY (date, sector, grp)
);

CREATE TABLE ingestion_checkpoints (
  job             TEXT PRIMARY KEY,
  last_key        INTEGER NOT NULL,
  updated_at      TEXT NOT NULL
);

CREATE TABLE dataset_locks (
  target          TEXT PRIMARY KEY,
  holder          TEXT NOT NULL,
  acquired_at     INTEGER NOT NULL
);

CREATE TABLE provenance_ledger (
  entry_id        INTEGER PRIMARY KEY AUTOINCREMENT,
  op_type         TEXT NOT NULL,
  target          TEXT NOT NULL,
  timestamp       TEXT NOT NULL,
  params_json     TEXT NOT NULL,
  summary_json    TEXT NOT NULL,
  checksum        TEXT NOT NULL
);

CREATE TRIGGER provenance_ledger_no_update BEFORE UPDATE ON provenance_ledger
BEGIN
  SELECT RAISE(ABORT, 'provenance ledger is append-only');
END;

CREATE TRIGGER provenance_ledger_no_delete BEFORE DELETE ON provenance_ledger
BEGIN
  SELECT RAISE(ABORT, 'provenance ledger is append-only');
END;

CREATE INDEX idx_scans_endpoint ON endpoint_scans(endpoint);
CREATE INDEX idx_scans_sector_grp ON endpoint_scans(sector, grp);
CREATE INDEX idx_scans_checked ON endpoint_scans(checked_at);
CREATE INDEX idx_ledger_target ON provenance_ledger(target, timestamp);

COMMIT;
"#
;
