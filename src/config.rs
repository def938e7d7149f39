//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "./data/archive.sqlite"
//!
//! [sync]
//! concurrency = 4
//! max_retries = 2
//!
//! [fetch]
//! min_interval_ms = 500
//! min_interval_jitter_ms = 200
//! archive_dir = "./data/files"
//!
//! [sites.json.demo]
//! base = "./fixtures/demo"
//! roots = [{ kind = "index", locator = "index.json" }]
//!
//! [[sites.json.demo.kinds]]
//! name = "index"
//! dedup_key = ["id"]
//! redescend = true
//! fields = [{ name = "id", type = "text", required = true }]
//! ```
//!
//! [`SyncOptions`] is the explicit per-run configuration handed to
//! [`SyncEngine::start_run`](crate::sync::SyncEngine::start_run). It can be
//! overridden from a flat `name -> value` preference mapping.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::schema::{check_identifier, EntityKind, EntitySchema};
use crate::site::FetchTarget;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncOptions,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub sites: SitesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Per-run sync settings.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Maximum number of sibling targets fetched concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries for transient fetch failures (parse failures are never retried).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before the first retry; doubles on each attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Finished runs retained per site for operator review.
    #[serde(default = "default_keep_runs")]
    pub keep_runs: usize,
}

fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_keep_runs() -> usize {
    20
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            keep_runs: default_keep_runs(),
        }
    }
}

impl SyncOptions {
    /// Build options from a flat preference mapping, starting from defaults.
    pub fn from_prefs(prefs: &BTreeMap<String, String>) -> Result<Self> {
        let mut opts = Self::default();
        opts.apply_prefs(prefs)?;
        Ok(opts)
    }

    /// Override fields from `sync.*` preference names.
    pub fn apply_prefs(&mut self, prefs: &BTreeMap<String, String>) -> Result<()> {
        for (name, value) in prefs {
            match name.as_str() {
                "sync.concurrency" => self.concurrency = parse_pref(name, value)?,
                "sync.max_retries" => self.max_retries = parse_pref(name, value)?,
                "sync.retry_backoff_ms" => self.retry_backoff_ms = parse_pref(name, value)?,
                "sync.keep_runs" => self.keep_runs = parse_pref(name, value)?,
                other => bail!(
                    "Unknown preference: '{}'. Available: sync.concurrency, sync.max_retries, \
                     sync.retry_backoff_ms, sync.keep_runs",
                    other
                ),
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("sync.concurrency must be >= 1");
        }
        if self.keep_runs == 0 {
            bail!("sync.keep_runs must be >= 1");
        }
        Ok(())
    }
}

fn parse_pref<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, name, e))
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum delay between two HTTP requests. `0` disables throttling.
    #[serde(default)]
    pub min_interval_ms: u64,
    /// Random offset in `[-jitter, +jitter]` added to each delay.
    #[serde(default)]
    pub min_interval_jitter_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Directory that file fields (`{"file": ...}` in JSON documents) are
    /// archived to. Unset keeps only their locators.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    /// Record file locators without downloading them during a sync.
    #[serde(default = "default_archive_defer")]
    pub archive_defer: bool,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_archive_defer() -> bool {
    true
}
fn default_user_agent() -> String {
    format!("sitear/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            min_interval_ms: 0,
            min_interval_jitter_ms: 0,
            user_agent: default_user_agent(),
            archive_dir: None,
            archive_defer: default_archive_defer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SitesConfig {
    #[serde(default)]
    pub json: BTreeMap<String, JsonSiteConfig>,
}

/// A declarative site type whose pages are JSON documents.
#[derive(Debug, Deserialize, Clone)]
pub struct JsonSiteConfig {
    /// Directory or `http(s)://` URL that locators are resolved against.
    pub base: String,
    pub roots: Vec<FetchTarget>,
    #[serde(default)]
    pub description: Option<String>,
    pub kinds: Vec<EntityKind>,
}

impl JsonSiteConfig {
    pub fn schema(&self) -> EntitySchema {
        EntitySchema {
            kinds: self.kinds.clone(),
        }
    }
}

impl Config {
    /// Config with defaults and no sites, pointing at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            sync: SyncOptions::default(),
            fetch: FetchConfig::default(),
            sites: SitesConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    config.sync.validate()?;

    if config.fetch.timeout_secs == 0 {
        bail!("fetch.timeout_secs must be > 0");
    }
    if config.fetch.min_interval_jitter_ms > config.fetch.min_interval_ms {
        bail!("fetch.min_interval_jitter_ms must not exceed fetch.min_interval_ms");
    }

    for (name, site) in &config.sites.json {
        check_identifier(name, "site").map_err(|e| anyhow::anyhow!("sites.json.{}: {}", name, e))?;
        if site.roots.is_empty() {
            bail!("sites.json.{}.roots must not be empty", name);
        }
        let schema = site.schema();
        schema
            .validate()
            .map_err(|e| anyhow::anyhow!("sites.json.{}: {}", name, e))?;
        for root in &site.roots {
            if schema.get(&root.kind).is_none() {
                bail!(
                    "sites.json.{}: root target '{}' names an undeclared kind",
                    name,
                    root
                );
            }
        }
    }

    Ok(config)
}
