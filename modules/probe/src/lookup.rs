use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use v6scope_core::Check;

/// Answer to one DNS question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(Vec<T>),
    /// The name or the record type does not exist.
    Empty,
    /// No answer could be obtained (timeout, server failure).
    Failed(String),
}

impl<T> Lookup<T> {
    pub fn check(&self) -> Check {
        match self {
            Lookup::Found(v) if !v.is_empty() => Check::Pass,
            Lookup::Found(_) | Lookup::Empty => Check::Fail,
            Lookup::Failed(_) => Check::Unknown,
        }
    }

    pub fn first(&self) -> Option<&T> {
        match self {
            Lookup::Found(v) => v.first(),
            _ => None,
        }
    }
}

/// The DNS questions a probe asks.
pub trait NameLookup: Send + Sync + 'static {
    fn ipv6(&self, name: &str) -> impl Future<Output = Lookup<Ipv6Addr>> + Send;
    fn ipv4(&self, name: &str) -> impl Future<Output = Lookup<Ipv4Addr>> + Send;
    fn txt(&self, name: &str) -> impl Future<Output = Lookup<String>> + Send;
    /// Signing keys published for the zone, in presentation format.
    fn dnskey(&self, name: &str) -> impl Future<Output = Lookup<String>> + Send;
}

/// [`NameLookup`] over the system resolver.
pub struct DnsLookup {
    resolver: TokioAsyncResolver,
    deadline: Duration,
}

impl DnsLookup {
    /// One attempt per question, each bounded by `deadline`.
    pub fn new(deadline: Duration) -> Self {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                warn!(error = %e, "system resolver configuration unavailable; using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.timeout = deadline;
        opts.attempts = 1;
        DnsLookup { resolver: TokioAsyncResolver::tokio(config, opts), deadline }
    }

    async fn bounded<T, F>(&self, name: &str, qtype: &str, fut: F) -> Lookup<T>
    where
        F: Future<Output = Result<Vec<T>, ResolveError>>,
    {
        match timeout(self.deadline, fut).await {
            Ok(Ok(v)) if v.is_empty() => Lookup::Empty,
            Ok(Ok(v)) => Lookup::Found(v),
            Ok(Err(e)) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Lookup::Empty,
                _ => {
                    debug!(name, qtype, error = %e, "lookup failed");
                    Lookup::Failed(e.to_string())
                }
            },
            Err(_) => {
                debug!(name, qtype, "lookup timed out");
                Lookup::Failed(format!("{qtype} lookup timed out"))
            }
        }
    }
}

impl NameLookup for DnsLookup {
    async fn ipv6(&self, name: &str) -> Lookup<Ipv6Addr> {
        let fut = async { self.resolver.ipv6_lookup(name).await.map(|l| l.iter().map(|r| r.0).collect()) };
        self.bounded(name, "AAAA", fut).await
    }

    async fn ipv4(&self, name: &str) -> Lookup<Ipv4Addr> {
        let fut = async { self.resolver.ipv4_lookup(name).await.map(|l| l.iter().map(|r| r.0).collect()) };
        self.bounded(name, "A", fut).await
    }

    async fn txt(&self, name: &str) -> Lookup<String> {
        let fut = async { self.resolver.txt_lookup(name).await.map(|l| l.iter().map(|r| r.to_string()).collect()) };
        self.bounded(name, "TXT", fut).await
    }

    async fn dnskey(&self, name: &str) -> Lookup<String> {
        let fut = async {
            self.resolver
                .lookup(name, RecordType::DNSKEY)
                .await
                .map(|l| l.iter().filter(|d| d.record_type() == RecordType::DNSKEY).map(|d| d.to_string()).collect())
        };
        self.bounded(name, "DNSKEY", fut).await
    }
}
