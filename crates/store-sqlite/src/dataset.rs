use rusqlite::types::Value;
use v6scope_core::{InvariantViolation, OrgMapping, ReadinessScore, RegistryEntry, RoutingEdge};

/// An index a dataset needs before it may replace production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub columns: &'static [&'static str],
    pub unique: bool,
}

impl IndexSpec {
    pub const fn unique(columns: &'static [&'static str]) -> Self {
        IndexSpec { columns, unique: true }
    }

    pub const fn lookup(columns: &'static [&'static str]) -> Self {
        IndexSpec { columns, unique: false }
    }
}

/// A reference dataset refreshed wholesale through staging and swap.
pub trait Dataset {
    /// Production table name.
    const TABLE: &'static str;
    /// `(name, type and column constraints)` in insert order.
    const COLUMNS: &'static [(&'static str, &'static str)];
    /// Table-level CHECK expressions.
    const CHECKS: &'static [&'static str] = &[];
    const INDEXES: &'static [IndexSpec];

    fn validate(&self) -> Result<(), InvariantViolation>;
    fn values(&self) -> Vec<Value>;
}

pub(crate) fn create_table_sql<D: Dataset>(table: &str) -> String {
    let mut defs: Vec<String> = D::COLUMNS.iter().map(|(name, ty)| format!("{name} {ty}")).collect();
    defs.extend(D::CHECKS.iter().map(|c| format!("CHECK ({c})")));
    format!("CREATE TABLE IF NOT EXISTS {table} ({})", defs.join(", "))
}

pub(crate) fn insert_sql<D: Dataset>(table: &str) -> String {
    let cols: Vec<&str> = D::COLUMNS.iter().map(|(name, _)| *name).collect();
    let marks = vec!["?"; cols.len()].join(",");
    format!("INSERT INTO {table}({}) VALUES ({marks})", cols.join(","))
}

fn opt_text(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

impl Dataset for RegistryEntry {
    const TABLE: &'static str = "asn_registry";
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("asn", "INTEGER NOT NULL CHECK (typeof(asn) = 'integer' AND asn >= 0)"),
        ("region", "TEXT NOT NULL"),
        ("rir", "TEXT NOT NULL"),
        ("status", "TEXT NOT NULL"),
        ("registry_date", "TEXT"),
        ("source", "TEXT NOT NULL"),
    ];
    const INDEXES: &'static [IndexSpec] = &[IndexSpec::unique(&["asn"]), IndexSpec::lookup(&["region"])];

    fn validate(&self) -> Result<(), InvariantViolation> {
        if self.region.is_empty() {
            return Err(InvariantViolation::Empty("region"));
        }
        Ok(())
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.asn.into()),
            Value::Text(self.region.clone()),
            Value::Text(self.rir.clone()),
            Value::Text(self.status.clone()),
            opt_text(&self.registry_date),
            Value::Text(self.source.clone()),
        ]
    }
}

impl Dataset for OrgMapping {
    const TABLE: &'static str = "asn_organizations";
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("asn", "INTEGER NOT NULL CHECK (typeof(asn) = 'integer' AND asn >= 0)"),
        ("org_name", "TEXT NOT NULL"),
        ("org_id", "TEXT"),
        ("region", "TEXT"),
        ("source", "TEXT NOT NULL"),
    ];
    const INDEXES: &'static [IndexSpec] = &[IndexSpec::unique(&["asn"])];

    fn validate(&self) -> Result<(), InvariantViolation> {
        if self.org_name.is_empty() {
            return Err(InvariantViolation::Empty("org_name"));
        }
        Ok(())
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.asn.into()),
            Value::Text(self.org_name.clone()),
            opt_text(&self.org_id),
            opt_text(&self.region),
            Value::Text(self.source.clone()),
        ]
    }
}

impl Dataset for ReadinessScore {
    const TABLE: &'static str = "asn_readiness";
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("asn", "INTEGER NOT NULL CHECK (typeof(asn) = 'integer' AND asn >= 0)"),
        ("region", "TEXT"),
        ("capable_pct", "REAL NOT NULL CHECK (capable_pct BETWEEN 0 AND 100)"),
        ("preferred_pct", "REAL NOT NULL CHECK (preferred_pct BETWEEN 0 AND 100)"),
        ("sample_count", "INTEGER NOT NULL CHECK (sample_count >= 0)"),
        ("status", "TEXT NOT NULL CHECK (status IN ('ok','no-data'))"),
        ("source", "TEXT NOT NULL"),
        ("measured_at", "TEXT NOT NULL"),
    ];
    const CHECKS: &'static [&'static str] =
        &["status = 'ok' OR (capable_pct = 0 AND preferred_pct = 0 AND sample_count = 0)"];
    const INDEXES: &'static [IndexSpec] = &[IndexSpec::unique(&["asn"]), IndexSpec::lookup(&["region"])];

    fn validate(&self) -> Result<(), InvariantViolation> {
        ReadinessScore::validate(self)
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.asn.into()),
            opt_text(&self.region),
            Value::Real(self.capable_pct),
            Value::Real(self.preferred_pct),
            Value::Integer(i64::try_from(self.sample_count).unwrap_or(i64::MAX)),
            Value::Text(self.status.as_str().to_string()),
            Value::Text(self.source.clone()),
            Value::Text(self.measured_at.clone()),
        ]
    }
}

impl Dataset for RoutingEdge {
    const TABLE: &'static str = "routing_edges";
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("dependent", "INTEGER NOT NULL CHECK (typeof(dependent) = 'integer')"),
        ("provider", "INTEGER NOT NULL CHECK (typeof(provider) = 'integer')"),
        ("source", "TEXT NOT NULL"),
    ];
    const CHECKS: &'static [&'static str] = &["dependent <> provider"];
    const INDEXES: &'static [IndexSpec] =
        &[IndexSpec::unique(&["dependent", "provider"]), IndexSpec::lookup(&["provider"])];

    fn validate(&self) -> Result<(), InvariantViolation> {
        RoutingEdge::validate(self)
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.dependent.into()),
            Value::Integer(self.provider.into()),
            Value::Text(self.source.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_includes_table_checks() {
        let sql = create_table_sql::<RoutingEdge>("routing_edges__staging");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS routing_edges__staging ("));
        assert!(sql.contains("CHECK (dependent <> provider)"));
    }

    #[test]
    fn insert_binds_every_column() {
        let sql = insert_sql::<ReadinessScore>("asn_readiness");
        assert_eq!(sql.matches('?').count(), ReadinessScore::COLUMNS.len());
        let s = ReadinessScore::no_data(1, "t");
        assert_eq!(s.values().len(), ReadinessScore::COLUMNS.len());
    }
}
