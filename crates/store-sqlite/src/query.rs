use crate::{Db, StoreError};
use serde::Serialize;
use v6scope_core::{Asn, OrgDirectory};

/// An upstream network of some dependent, with its organization name when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provider {
    pub asn: Asn,
    pub org_name: Option<String>,
    pub source: String,
}

fn check_identifier(name: &str) -> Result<(), StoreError> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok { Ok(()) } else { Err(StoreError::Identifier(name.to_string())) }
}

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        let cnt: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }

    pub fn count(&self, table: &str) -> Result<u64, StoreError> {
        check_identifier(table)?;
        let n: i64 = self.conn.query_row(&format!("SELECT COUNT(1) FROM {table}"), [], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// Snapshot of the organization mapping for probe workers.
    pub fn org_directory(&self) -> Result<OrgDirectory, StoreError> {
        let mut stmt = self.conn.prepare("SELECT asn, org_name FROM asn_organizations")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, Asn>(0)?, r.get::<_, String>(1)?)))?;
        rows.collect::<Result<OrgDirectory, _>>().map_err(StoreError::from)
    }

    /// Organization name of one identifier.
    pub fn org_name(&self, asn: Asn) -> Result<Option<String>, StoreError> {
        use rusqlite::OptionalExtension;
        let name = self
            .conn
            .query_row("SELECT org_name FROM asn_organizations WHERE asn=?", [asn], |r| r.get(0))
            .optional()?;
        Ok(name)
    }

    /// Number of distinct upstream providers of `asn`.
    pub fn provider_count(&self, asn: Asn) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT provider) FROM routing_edges WHERE dependent=?",
            [asn],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn providers(&self, asn: Asn) -> Result<Vec<Provider>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT e.provider, o.org_name, e.source FROM routing_edges e
             LEFT JOIN asn_organizations o ON o.asn = e.provider
             WHERE e.dependent=? ORDER BY e.provider",
        )?;
        let rows = stmt.query_map([asn], |r| Ok(Provider { asn: r.get(0)?, org_name: r.get(1)?, source: r.get(2)? }))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Networks that rely on `asn` as a next hop.
    pub fn customers(&self, asn: Asn) -> Result<Vec<Asn>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT dependent FROM routing_edges WHERE provider=? ORDER BY dependent")?;
        let rows = stmt.query_map([asn], |r| r.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every identifier in the current registry generation, ascending.
    pub fn registry_asns(&self) -> Result<Vec<Asn>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT asn FROM asn_registry ORDER BY asn")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn registry_region(&self, asn: Asn) -> Result<Option<String>, StoreError> {
        use rusqlite::OptionalExtension;
        let region = self
            .conn
            .query_row("SELECT region FROM asn_registry WHERE asn=?", [asn], |r| r.get(0))
            .optional()?;
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v6scope_core::{OrgMapping, RoutingEdge};

    fn edge(d: Asn, p: Asn) -> RoutingEdge {
        RoutingEdge { dependent: d, provider: p, source: "test".into() }
    }

    #[test]
    fn count_refuses_odd_identifiers() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.count("routing_edges").unwrap(), 0);
        assert!(matches!(db.count("routing_edges; DROP TABLE x"), Err(StoreError::Identifier(_))));
        assert!(matches!(db.count(""), Err(StoreError::Identifier(_))));
    }

    #[test]
    fn providers_join_organization_names() {
        let db = Db::open_in_memory().unwrap();
        db.refresh("routes", vec![edge(100, 200), edge(100, 300), edge(400, 200)]).unwrap();
        db.refresh(
            "orgs",
            vec![OrgMapping { asn: 200, org_name: "Transit Co".into(), org_id: None, region: None, source: "t".into() }],
        )
        .unwrap();

        assert_eq!(db.provider_count(100).unwrap(), 2);
        assert_eq!(db.provider_count(200).unwrap(), 0);
        let ps = db.providers(100).unwrap();
        assert_eq!(ps[0].org_name.as_deref(), Some("Transit Co"));
        assert_eq!(ps[1].asn, 300);
        assert_eq!(ps[1].org_name, None);
        assert_eq!(db.org_name(200).unwrap().as_deref(), Some("Transit Co"));
        assert_eq!(db.org_name(300).unwrap(), None);
        assert_eq!(db.customers(200).unwrap(), vec![100, 400]);

        let dir = db.org_directory().unwrap();
        assert_eq!(dir.label(200), "Transit Co");
        assert_eq!(dir.len(), 1);
    }
}
