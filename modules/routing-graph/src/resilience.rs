use serde::Serialize;
use std::fmt;
use v6scope_core::Asn;
use v6scope_store::{Db, Provider, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResilienceStatus {
    Disconnected,
    Critical,
    Redundant,
    HighlyResilient,
}

impl ResilienceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResilienceStatus::Disconnected => "Disconnected",
            ResilienceStatus::Critical => "Critical (single point of failure)",
            ResilienceStatus::Redundant => "Redundant",
            ResilienceStatus::HighlyResilient => "Highly Resilient",
        }
    }
}

impl fmt::Display for ResilienceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resilience {
    pub score: u8,
    pub status: ResilienceStatus,
}

impl Resilience {
    /// Fixed step function over the number of distinct upstream providers.
    pub fn classify(providers: u64) -> Self {
        let (score, status) = match providers {
            0 => (0, ResilienceStatus::Disconnected),
            1 => (10, ResilienceStatus::Critical),
            2 => (60, ResilienceStatus::Redundant),
            _ => (100, ResilienceStatus::HighlyResilient),
        };
        Resilience { score, status }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResilienceReport {
    pub asn: Asn,
    pub org_name: Option<String>,
    pub provider_count: u64,
    pub score: u8,
    pub status: String,
    pub providers: Vec<Provider>,
    pub customers: usize,
}

pub fn resilience(db: &Db, asn: Asn) -> Result<ResilienceReport, StoreError> {
    let provider_count = db.provider_count(asn)?;
    let r = Resilience::classify(provider_count);
    let org_name = db.org_name(asn)?;
    Ok(ResilienceReport {
        asn,
        org_name,
        provider_count,
        score: r.score,
        status: r.status.to_string(),
        providers: db.providers(asn)?,
        customers: db.customers(asn)?.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use v6scope_core::{OrgMapping, RoutingEdge};

    #[test]
    fn breakpoints_are_exact() {
        let score = |n| Resilience::classify(n).score;
        assert_eq!(score(0), 0);
        assert_eq!(score(1), 10);
        assert_eq!(score(2), 60);
        assert_eq!(score(3), 100);
        assert_eq!(score(10), 100);
        assert!(score(0) < score(1) && score(1) < score(2) && score(2) < score(3));
        assert_eq!(Resilience::classify(1).status.to_string(), "Critical (single point of failure)");
        assert_eq!(Resilience::classify(7).status, ResilienceStatus::HighlyResilient);
    }

    #[test]
    fn report_reads_the_stored_graph() {
        let db = Db::open_in_memory().unwrap();
        let edges = [(100, 200), (100, 300), (100, 400), (500, 100), (600, 200)]
            .into_iter()
            .map(|(dependent, provider)| RoutingEdge { dependent, provider, source: "t".into() });
        db.refresh("routes", edges).unwrap();
        db.refresh(
            "orgs",
            vec![OrgMapping { asn: 100, org_name: "Campus Net".into(), org_id: None, region: None, source: "t".into() }],
        )
        .unwrap();

        let r = resilience(&db, 100).unwrap();
        assert_eq!(r.org_name.as_deref(), Some("Campus Net"));
        assert_eq!((r.provider_count, r.score), (3, 100));
        assert_eq!(r.status, "Highly Resilient");
        assert_eq!(r.customers, 1);
        assert_eq!(r.providers.iter().map(|p| p.asn).collect::<Vec<_>>(), vec![200, 300, 400]);

        let lone = resilience(&db, 600).unwrap();
        assert_eq!((lone.score, lone.status.as_str()), (10, "Critical (single point of failure)"));
        assert_eq!(resilience(&db, 999).unwrap().status, "Disconnected");
    }
}
