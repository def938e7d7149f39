//! Site type contract and registry.
//!
//! A site type bundles an [`EntitySchema`], a fetch/parse pipeline and the
//! dedup rules for one family of data sources. The sync engine only ever
//! talks to the [`SiteType`] trait; concrete site types are registered by
//! name in a [`SiteRegistry`] at startup.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │             SiteRegistry             │
//! │  ┌──────────────┐  ┌──────────────┐  │
//! │  │ JSON (config)│  │ Custom (Rust)│  │
//! │  └──────────────┘  └──────────────┘  │
//! └──────────────────┬───────────────────┘
//!                    ▼
//!      SchemaRegistry::register → SyncEngine::start_run
//! ```
//!
//! # Traversal contract
//!
//! [`SiteType::fetch_and_parse`] returns the entity produced by a target
//! (with any inline children parsed from the same content), the child
//! targets of that entity, and an optional continuation marker for the next
//! page of roots. It must not touch storage.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{IngestError, SiteError};
use crate::fetch::HttpFetcher;
use crate::models::{DedupKey, Entity, EntityTree};
use crate::schema::{EntityKind, EntitySchema};
use crate::site_json::JsonSite;

/// One unit of crawl work: a page or record to retrieve and parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchTarget {
    /// Entity kind the target is expected to produce.
    pub kind: String,
    /// Site-specific address (URL, path, identifier).
    pub locator: String,
}

impl FetchTarget {
    pub fn new(kind: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            locator: locator.into(),
        }
    }
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.locator)
    }
}

/// Result of fetching and parsing one target.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub tree: EntityTree,
    /// Targets whose entities are children of `tree.entity`.
    pub targets: Vec<FetchTarget>,
    pub continuation: Option<String>,
}

impl Parsed {
    pub fn new(tree: impl Into<EntityTree>) -> Self {
        Self {
            tree: tree.into(),
            targets: Vec::new(),
            continuation: None,
        }
    }

    pub fn with_target(mut self, target: FetchTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_continuation(mut self, marker: impl Into<String>) -> Self {
        self.continuation = Some(marker.into());
        self
    }
}

/// Where an interrupted or partially failed run left off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    /// Root targets that were not reached or failed.
    #[serde(default)]
    pub pending: Vec<FetchTarget>,
    /// Last continuation marker seen at root level.
    #[serde(default)]
    pub continuation: Option<String>,
}

impl ResumeState {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.continuation.is_none()
    }
}

/// A pluggable site type.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use site_archive::error::SiteError;
/// use site_archive::models::Entity;
/// use site_archive::schema::{EntityKind, EntitySchema, Field};
/// use site_archive::site::{FetchTarget, Parsed, ResumeState, SiteType};
///
/// struct Weather;
///
/// #[async_trait]
/// impl SiteType for Weather {
///     fn name(&self) -> &str { "weather" }
///
///     fn schema(&self) -> EntitySchema {
///         EntitySchema::new().kind(
///             EntityKind::new("reading")
///                 .field(Field::text("station").required())
///                 .field(Field::real("celsius"))
///                 .dedup_key(["station"]),
///         )
///     }
///
///     async fn root_targets(
///         &self,
///         _previous: Option<&ResumeState>,
///     ) -> Result<Vec<FetchTarget>, SiteError> {
///         Ok(vec![FetchTarget::new("reading", "KSEA")])
///     }
///
///     async fn fetch_and_parse(&self, target: &FetchTarget) -> Result<Parsed, SiteError> {
///         Ok(Parsed::new(
///             Entity::new("reading")
///                 .with("station", target.locator.as_str())
///                 .with("celsius", 11.5),
///         ))
///     }
/// }
/// ```
#[async_trait]
pub trait SiteType: Send + Sync {
    /// Registry name; also prefixes the site's storage tables.
    fn name(&self) -> &str;

    /// One-line description shown by `sitear sites`.
    fn description(&self) -> &str {
        ""
    }

    fn schema(&self) -> EntitySchema;

    /// Entry points for this run, given the state saved by the last run.
    async fn root_targets(
        &self,
        previous: Option<&ResumeState>,
    ) -> Result<Vec<FetchTarget>, SiteError>;

    async fn fetch_and_parse(&self, target: &FetchTarget) -> Result<Parsed, SiteError>;

    /// Dedup key of a candidate. Must not depend on storage.
    fn dedup_key(&self, kind: &EntityKind, entity: &Entity) -> Result<DedupKey, IngestError> {
        DedupKey::derive(kind, entity)
    }

    /// Walk child targets of `kind` even when an entity is an unchanged
    /// duplicate.
    fn always_redescend(&self, kind: &EntityKind) -> bool {
        kind.redescend
    }

    /// Target for the next page of roots named by a continuation marker.
    fn continuation_target(&self, _marker: &str) -> Option<FetchTarget> {
        None
    }
}

/// Site types available to this process, keyed by name.
#[derive(Default, Clone)]
pub struct SiteRegistry {
    sites: Vec<Arc<dyn SiteType>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with every `[sites.json.*]` entry of the config.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        if config.sites.json.is_empty() {
            return Ok(registry);
        }

        let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
        for (name, cfg) in &config.sites.json {
            let site = JsonSite::new(name.clone(), cfg.clone(), fetcher.clone());
            registry.register(Arc::new(site))?;
        }
        Ok(registry)
    }

    /// Register a site type. Names must be unique.
    pub fn register(&mut self, site: Arc<dyn SiteType>) -> Result<(), IngestError> {
        if self.find(site.name()).is_some() {
            return Err(IngestError::InvalidSchema(format!(
                "site type '{}' is already registered",
                site.name()
            )));
        }
        tracing::debug!(site = site.name(), "registered site type");
        self.sites.push(site);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn SiteType>> {
        self.sites.iter().find(|s| s.name() == name).cloned()
    }

    /// Look up a site type, failing with [`IngestError::UnknownSite`].
    pub fn get(&self, name: &str) -> Result<Arc<dyn SiteType>, IngestError> {
        self.find(name)
            .ok_or_else(|| IngestError::UnknownSite(name.to_string()))
    }

    pub fn sites(&self) -> &[Arc<dyn SiteType>] {
        &self.sites
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
