use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "v6scope.yaml";
pub const DEFAULT_DB: &str = "v6scope.db";

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
    pub lock_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    pub timeout_ms: Option<u64>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EnrichConfig {
    pub rate_per_sec: Option<u32>,
    pub batch_size: Option<usize>,
    pub pause_ms: Option<u64>,
    pub url_template: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    pub regions: Option<Vec<String>>,
    pub statuses: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Explicit path must exist and parse. Without one, `./v6scope.yaml` is used when present.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("read config {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse_config(s: &str) -> Result<Config> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(s)?)
}
