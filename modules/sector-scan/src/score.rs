use serde::Serialize;
use std::collections::BTreeMap;
use v6scope_core::ScanRecord;

/// Weighted readiness of one group: 40% v6 resolution, 40% v6 web reachability, 20% signed zones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupScore {
    pub rank: usize,
    pub group: String,
    pub score: f64,
    pub total: usize,
    pub missing_dns_pct: u32,
    pub web_unreachable_pct: u32,
    pub missing_dnssec_pct: u32,
}

/// Score every non-empty group and rank them, best first.
pub fn score_groups(groups: &BTreeMap<String, Vec<ScanRecord>>) -> Vec<GroupScore> {
    let mut scores: Vec<GroupScore> = groups
        .iter()
        .filter(|(_, recs)| !recs.is_empty())
        .map(|(group, recs)| {
            let total = recs.len();
            let pct = |n: usize| n as f64 / total as f64 * 100.0;
            let dns = recs.iter().filter(|r| r.measurement.ipv6_dns.is_pass()).count();
            let web = recs.iter().filter(|r| r.measurement.ipv6_web.is_pass()).count();
            let sec = recs.iter().filter(|r| r.measurement.dnssec.is_pass()).count();
            let score = pct(dns) * 0.4 + pct(web) * 0.4 + pct(sec) * 0.2;
            GroupScore {
                rank: 0,
                group: group.clone(),
                score: (score * 10.0).round() / 10.0,
                total,
                missing_dns_pct: pct(total - dns).round() as u32,
                web_unreachable_pct: pct(total - web).round() as u32,
                missing_dnssec_pct: pct(total - sec).round() as u32,
            }
        })
        .collect();
    scores.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.group.cmp(&b.group)));
    for (i, s) in scores.iter_mut().enumerate() {
        s.rank = i + 1;
    }
    scores
}
