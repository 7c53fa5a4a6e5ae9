use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ingest::enrich::{EnrichOptions, EnrichOutcome, HttpSource, DEFAULT_URL_TEMPLATE};
use ingest::registry::RegistryFilter;
use probe::{ProbeConfig, ProbeEngine};
use routing_graph::PathFormat;
use sector_scan::{ScanOutcome, DEFAULT_WORKERS};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use v6scope_core::{parse_asn, Check};
use v6scope_store::Db;

mod config;
mod logging;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "v6scope", version, about = "IPv6 readiness probing and routing-resilience intelligence")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./v6scope.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database path (overrides store.path)
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum LedgerCmd {
    /// Recompute every checksum; exits non-zero on mismatch
    Verify,
    /// Print ledger entries, newest first (JSON lines)
    Show {
        /// Only entries for this dataset
        #[arg(long)]
        target: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Probe a sector's endpoints and store the results
    Scan {
        /// File with `GROUP ENDPOINT` lines (comments with # and blanks ignored)
        #[arg(long, value_name = "FILE")]
        targets: PathBuf,
        /// Sector label, e.g. education or government
        #[arg(long)]
        sector: String,
        /// Max probes in flight
        #[arg(long)]
        workers: Option<usize>,
        /// Timeout per DNS query, connect and handshake in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Service port for connection checks
        #[arg(long)]
        port: Option<u16>,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Also write records to this file (jsonl, or CSV with --csv)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        csv: bool,
        /// Print results without writing to the database
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Print the weighted per-group ranking after the records
        #[arg(long, default_value_t = false)]
        rank: bool,
    },
    /// Replace the registry dataset from a delegation file
    IngestRegistry {
        file: PathBuf,
        /// Country code to keep (repeatable); default: registry.regions or all
        #[arg(long = "region")]
        regions: Vec<String>,
        /// Allocation status to keep (repeatable); default: allocated, assigned
        #[arg(long = "status")]
        statuses: Vec<String>,
    },
    /// Replace the organization mapping from an AS-to-organization JSON-lines file
    IngestOrgs { file: PathBuf },
    /// Replace readiness scores from a CSV table
    IngestReadiness {
        file: PathBuf,
        /// Keep only identifiers present in the registry dataset
        #[arg(long, default_value_t = false)]
        registry_only: bool,
    },
    /// Fetch readiness per registry identifier, resumable via checkpoint
    EnrichReadiness {
        #[arg(long)]
        rate: Option<u32>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        pause_ms: Option<u64>,
        /// URL with an {asn} placeholder
        #[arg(long)]
        url_template: Option<String>,
        /// Stop after N identifiers; rerun to continue
        #[arg(long)]
        max: Option<usize>,
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
    /// Replace the routing graph from a path dump
    IngestRoutes {
        file: PathBuf,
        /// plain, bgpdump or auto
        #[arg(long, default_value = "auto")]
        format: String,
    },
    /// Resilience classification of one or more networks
    Resilience {
        #[arg(required = true)]
        asns: Vec<String>,
    },
    /// Daily readiness snapshots of a sector
    History {
        #[arg(long)]
        sector: String,
        #[arg(long)]
        group: Option<String>,
        /// Latest record per endpoint instead of daily snapshots
        #[arg(long, default_value_t = false)]
        latest: bool,
    },
    /// Provenance ledger
    Ledger {
        #[command(subcommand)]
        cmd: LedgerCmd,
    },
}

fn open_db(cfg: &config::Config, cli_db: Option<&Path>) -> Result<Db> {
    let path = cli_db
        .map(Path::to_path_buf)
        .or_else(|| cfg.store.path.clone())
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_DB));
    let mut db = Db::open_or_create(&path).with_context(|| format!("open database {}", path.display()))?;
    if let Some(secs) = cfg.store.lock_ttl_secs {
        db = db.with_lock_ttl(Duration::from_secs(secs));
    }
    Ok(db)
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn check_label(c: Check) -> &'static str {
    match c {
        Check::Pass => "yes",
        Check::Fail => "no",
        Check::Unknown => "?",
    }
}

fn print_scan(outcome: &ScanOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => emit(outcome)?,
        OutputFormat::Jsonl => {
            for r in outcome.records() {
                emit(r)?;
            }
        }
        OutputFormat::Text => {
            for r in outcome.records() {
                let m = &r.measurement;
                let ms = |v: Option<f64>| v.map(|x| format!("{x:.2}ms")).unwrap_or_else(|| "-".into());
                println!(
                    "{:<4} {:<40} {:<8} v6dns={} v6web={} dnssec={} v4={} v6={} {}",
                    r.group,
                    m.endpoint,
                    m.status.as_str(),
                    check_label(m.ipv6_dns),
                    check_label(m.ipv6_web),
                    check_label(m.dnssec),
                    ms(m.ipv4_rtt_ms),
                    ms(m.ipv6_rtt_ms),
                    m.operator.as_deref().unwrap_or("")
                );
            }
            for r in &outcome.rollups {
                println!(
                    "{} {} {}: {}/{} ready ({:.1}%)",
                    r.date,
                    r.sector,
                    r.group.as_deref().unwrap_or("*"),
                    r.ready,
                    r.total,
                    r.rate
                );
            }
        }
    }
    Ok(())
}

fn write_scan_file(outcome: &ScanOutcome, path: &Path, csv: bool) -> Result<()> {
    if csv {
        let mut wtr = csv::Writer::from_writer(File::create(path)?);
        wtr.write_record([
            "group", "sector", "endpoint", "status", "ipv6_dns", "ipv4_dns", "ipv6_web", "dnssec", "ipv4_rtt_ms",
            "ipv6_rtt_ms", "asn", "operator", "error", "checked_at",
        ])?;
        for r in outcome.records() {
            let m = &r.measurement;
            let opt = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
            wtr.write_record([
                r.group.clone(),
                r.sector.clone(),
                m.endpoint.clone(),
                m.status.to_string(),
                check_label(m.ipv6_dns).to_string(),
                check_label(m.ipv4_dns).to_string(),
                check_label(m.ipv6_web).to_string(),
                check_label(m.dnssec).to_string(),
                opt(m.ipv4_rtt_ms),
                opt(m.ipv6_rtt_ms),
                m.asn.map(|a| a.to_string()).unwrap_or_default(),
                m.operator.clone().unwrap_or_default(),
                m.error.clone().unwrap_or_default(),
                m.checked_at.clone(),
            ])?;
        }
        wtr.flush()?;
    } else {
        let mut w = BufWriter::new(File::create(path)?);
        for r in outcome.records() {
            writeln!(w, "{}", serde_json::to_string(r)?)?;
        }
        w.flush()?;
    }
    Ok(())
}

fn main() -> Result<()> {
    logging::init_logging();
    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Version => {
            println!("v6scope {} (core {})", env!("CARGO_PKG_VERSION"), v6scope_core::version());
        }
        Commands::Scan { targets, sector, workers, timeout_ms, port, format, out, csv, dry_run, rank } => {
            let batch = sector_scan::read_targets(BufReader::new(
                File::open(&targets).with_context(|| format!("open {}", targets.display()))?,
            ))?;
            if batch.is_empty() {
                return Err(anyhow!("no targets in {}", targets.display()));
            }
            let db = open_db(&cfg, cli.db.as_deref())?;
            let probe_cfg = ProbeConfig {
                port: port.or(cfg.probe.port).unwrap_or(probe::DEFAULT_PORT),
                timeout: timeout_ms.or(cfg.probe.timeout_ms).map(Duration::from_millis).unwrap_or(probe::DEFAULT_TIMEOUT),
            };
            let workers = workers.or(cfg.probe.workers).unwrap_or(DEFAULT_WORKERS);
            let directory = db.org_directory()?;
            if directory.is_empty() {
                warn!("organization mapping is empty; operators will use the fallback label");
            }
            let started = Instant::now();
            let rt = tokio::runtime::Runtime::new()?;
            let outcome = rt.block_on(async {
                let engine = Arc::new(ProbeEngine::new(directory, probe_cfg));
                sector_scan::scan(engine, &sector, batch, workers).await
            });
            info!(duration_ms = started.elapsed().as_millis() as u64, "probing done");
            print_scan(&outcome, format)?;
            if rank {
                for s in sector_scan::score_groups(&outcome.groups) {
                    emit(&s)?;
                }
            }
            if let Some(path) = out {
                write_scan_file(&outcome, &path, csv)?;
            }
            if !dry_run {
                let report = sector_scan::persist(&db, &outcome)?;
                info!(records = report.records, rollups = report.rollups, "scan stored");
            }
            db.close()?;
        }
        Commands::IngestRegistry { file, regions, statuses } => {
            let defaults = RegistryFilter::default();
            let filter = RegistryFilter {
                regions: if regions.is_empty() { cfg.registry.regions.clone().unwrap_or_default() } else { regions },
                statuses: if statuses.is_empty() {
                    cfg.registry.statuses.clone().unwrap_or(defaults.statuses)
                } else {
                    statuses
                },
            };
            let db = open_db(&cfg, cli.db.as_deref())?;
            emit(&ingest::registry::ingest_registry(&db, &file, &filter)?)?;
            db.close()?;
        }
        Commands::IngestOrgs { file } => {
            let db = open_db(&cfg, cli.db.as_deref())?;
            emit(&ingest::orgs::ingest_orgs(&db, &file)?)?;
            db.close()?;
        }
        Commands::IngestReadiness { file, registry_only } => {
            let db = open_db(&cfg, cli.db.as_deref())?;
            emit(&ingest::readiness::ingest_readiness(&db, &file, registry_only)?)?;
            db.close()?;
        }
        Commands::EnrichReadiness { rate, batch_size, pause_ms, url_template, max, timeout_ms } => {
            let defaults = EnrichOptions::default();
            let opts = EnrichOptions {
                batch_size: batch_size.or(cfg.enrich.batch_size).unwrap_or(defaults.batch_size),
                rate_per_sec: rate.or(cfg.enrich.rate_per_sec).unwrap_or(defaults.rate_per_sec),
                pause: pause_ms.or(cfg.enrich.pause_ms).map(Duration::from_millis).unwrap_or(defaults.pause),
                max_items: max,
                ..defaults
            };
            let template = url_template
                .or_else(|| cfg.enrich.url_template.clone())
                .unwrap_or_else(|| DEFAULT_URL_TEMPLATE.to_string());
            let source = HttpSource::new(&template, Duration::from_millis(timeout_ms))?;
            let db = open_db(&cfg, cli.db.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            let outcome = rt.block_on(ingest::enrich::enrich_registry(&db, &source, &opts))?;
            if let EnrichOutcome::Suspended { processed, .. } = &outcome {
                info!(processed, "run again to continue from the checkpoint");
            }
            emit(&outcome)?;
            db.close()?;
        }
        Commands::IngestRoutes { file, format } => {
            let format: PathFormat = format.parse()?;
            let db = open_db(&cfg, cli.db.as_deref())?;
            emit(&routing_graph::ingest_routes(&db, &file, format)?)?;
            db.close()?;
        }
        Commands::Resilience { asns } => {
            let db = open_db(&cfg, cli.db.as_deref())?;
            for raw in asns {
                let asn = parse_asn(&raw)?;
                emit(&routing_graph::resilience(&db, asn)?)?;
            }
            db.close()?;
        }
        Commands::History { sector, group, latest } => {
            let db = open_db(&cfg, cli.db.as_deref())?;
            if latest {
                for r in db.latest_scans(&sector)? {
                    if group.as_deref().map_or(true, |g| g == r.group) {
                        emit(&r)?;
                    }
                }
            } else {
                for r in db.rollup_history(&sector, group.as_deref())? {
                    emit(&r)?;
                }
            }
            db.close()?;
        }
        Commands::Ledger { cmd } => {
            let db = open_db(&cfg, cli.db.as_deref())?;
            match cmd {
                LedgerCmd::Verify => {
                    let bad = db.verify_ledger()?;
                    for m in &bad {
                        emit(m)?;
                    }
                    if !bad.is_empty() {
                        return Err(anyhow!("{} ledger entries failed verification", bad.len()));
                    }
                    info!("ledger verified");
                }
                LedgerCmd::Show { target, limit } => {
                    let entries = match target {
                        Some(t) => db.provenance(&t)?.into_iter().take(limit as usize).collect(),
                        None => db.ledger_tail(limit)?,
                    };
                    for e in entries {
                        emit(&e)?;
                    }
                }
            }
            db.close()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ledger_show_parses() {
        let cli = Cli::try_parse_from(["v6scope", "--db", "x.db", "ledger", "show", "--target", "routing_edges"]).unwrap();
        assert_eq!(cli.db.as_deref(), Some(Path::new("x.db")));
        assert!(matches!(cli.command, Commands::Ledger { cmd: LedgerCmd::Show { limit: 20, .. } }));
    }

    #[test]
    fn scan_requires_targets_and_sector() {
        assert!(Cli::try_parse_from(["v6scope", "scan", "--sector", "education"]).is_err());
        let cli = Cli::try_parse_from(["v6scope", "scan", "--targets", "t.txt", "--sector", "education", "--format", "jsonl"]).unwrap();
        assert!(matches!(cli.command, Commands::Scan { format: OutputFormat::Jsonl, .. }));
    }
}
