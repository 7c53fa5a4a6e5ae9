//! Dual-stack readiness probe for one endpoint.
//!
//! Every check is isolated: a failing lookup or connection only affects its own field
//! of the resulting [`Measurement`], never the others, and [`Prober::probe`] has no error path.

mod lookup;

pub use lookup::{DnsLookup, Lookup, NameLookup};

use anyhow::{anyhow, Result};
use rustls::ClientConfig;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use v6scope_core::{parse_asn, rtt_ms, Asn, Check, Measurement, OrgDirectory};

pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Service port for the connection checks.
    pub port: u16,
    /// Bound for each DNS question, connect and handshake.
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig { port: DEFAULT_PORT, timeout: DEFAULT_TIMEOUT }
    }
}

/// Anything that can turn an endpoint name into a measurement.
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, endpoint: &str) -> impl Future<Output = Measurement> + Send;
}

pub struct ProbeEngine<L: NameLookup = DnsLookup> {
    lookup: L,
    directory: OrgDirectory,
    tls: TlsConnector,
    config: ProbeConfig,
}

impl ProbeEngine<DnsLookup> {
    pub fn new(directory: OrgDirectory, config: ProbeConfig) -> Self {
        ProbeEngine::with_lookup(DnsLookup::new(config.timeout), directory, config)
    }
}

impl<L: NameLookup> ProbeEngine<L> {
    pub fn with_lookup(lookup: L, directory: OrgDirectory, config: ProbeConfig) -> Self {
        // Ensure a crypto provider is installed (ring)
        let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        ProbeEngine { lookup, directory, tls: TlsConnector::from(Arc::new(tls)), config }
    }

    async fn connect_v4(&self, addr: Option<Ipv4Addr>) -> Option<f64> {
        let addr = SocketAddr::new(IpAddr::V4(addr?), self.config.port);
        let started = Instant::now();
        match timeout(self.config.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Some(rtt_ms(started.elapsed())),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "v4 connect failed");
                None
            }
            Err(_) => {
                debug!(%addr, "v4 connect timed out");
                None
            }
        }
    }

    /// Full TLS handshake over v6. Connect and handshake share one deadline, and the
    /// elapsed time covers both.
    async fn handshake_v6(&self, host: &str, addr: Ipv6Addr) -> Result<f64> {
        let addr = SocketAddr::new(IpAddr::V6(addr), self.config.port);
        let server_name = rustls::pki_types::ServerName::try_from(host.to_owned())
            .map_err(|_| anyhow!("invalid server name {host}"))?;
        let started = Instant::now();
        let handshake = async {
            let stream = TcpStream::connect(addr).await?;
            self.tls.connect(server_name, stream).await
        };
        let _tls = timeout(self.config.timeout, handshake).await??;
        Ok(rtt_ms(started.elapsed()))
    }

    async fn web_v6(&self, host: &str, v6: &Lookup<Ipv6Addr>) -> (Check, Option<f64>) {
        match v6 {
            Lookup::Found(addrs) => match addrs.first() {
                Some(addr) => match self.handshake_v6(host, *addr).await {
                    Ok(rtt) => (Check::Pass, Some(rtt)),
                    Err(e) => {
                        debug!(endpoint = host, error = %e, "v6 handshake failed");
                        (Check::Fail, None)
                    }
                },
                None => (Check::Fail, None),
            },
            Lookup::Empty => (Check::Fail, None),
            Lookup::Failed(_) => (Check::Unknown, None),
        }
    }

    /// Origin network of a v4 address via the Team Cymru DNS interface.
    async fn origin_asn(&self, addr: Option<Ipv4Addr>) -> Option<Asn> {
        let o = addr?.octets();
        let query = format!("{}.{}.{}.{}.origin.asn.cymru.com", o[3], o[2], o[1], o[0]);
        let answer = self.lookup.txt(&query).await;
        let txt = answer.first()?;
        let field = txt.trim_matches('"').split('|').next()?.split_whitespace().next()?;
        match parse_asn(field) {
            Ok(asn) => Some(asn),
            Err(e) => {
                debug!(%query, error = %e, "unparseable origin answer");
                None
            }
        }
    }
}

impl<L: NameLookup> Prober for ProbeEngine<L> {
    async fn probe(&self, endpoint: &str) -> Measurement {
        let host = endpoint.trim().trim_end_matches('.');
        let mut m = Measurement::pending(host, v6scope_core::now_rfc3339());

        let (v6, v4, keys) =
            tokio::join!(self.lookup.ipv6(host), self.lookup.ipv4(host), self.lookup.dnskey(host));
        m.ipv6_dns = v6.check();
        m.ipv4_dns = v4.check();
        m.dnssec = keys.check();

        let v4_addr = v4.first().copied();
        let (v4_rtt, (web, v6_rtt), asn) =
            tokio::join!(self.connect_v4(v4_addr), self.web_v6(host, &v6), self.origin_asn(v4_addr));
        m.ipv4_rtt_ms = v4_rtt;
        m.ipv6_web = web;
        m.ipv6_rtt_ms = v6_rtt;
        m.asn = asn;
        m.operator = asn.map(|a| self.directory.label(a));

        let m = m.finish();
        debug!(endpoint = %m.endpoint, status = %m.status, "probe finished");
        m
    }
}
