//! Schema registry and migration engine.
//!
//! Every registered site type has a chain of schema versions recorded in
//! `_schema_versions`. On registration the declared [`EntitySchema`] is
//! diffed against the latest recorded version and classified:
//!
//! - [`SchemaDiff::NoChange`]: the existing handle is returned.
//! - [`SchemaDiff::AdditiveCompatible`]: applied in one transaction by
//!   [`Store::create_schema`], bumping the version. Existing rows receive
//!   declared defaults for new fields.
//! - [`SchemaDiff::Incompatible`]: rejected with
//!   [`IngestError::MigrationRejected`]; storage is not touched.

use std::fmt;

use anyhow::Result as AnyResult;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::schema::{EntityKind, EntitySchema, FieldType};
use crate::site::{SiteRegistry, SiteType};
use crate::store::{SchemaHandle, Store};

/// A single compatible structural change between two schema versions.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    AddKind(String),
    AddField {
        kind: String,
        field: String,
    },
    WidenField {
        kind: String,
        field: String,
        from: FieldType,
        to: FieldType,
    },
    RelaxField {
        kind: String,
        field: String,
    },
    AddRelation {
        kind: String,
        relation: String,
    },
    /// No storage layout change (defaults, `redescend`, field order).
    Metadata {
        kind: String,
        detail: String,
    },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::AddKind(kind) => write!(f, "add kind '{}'", kind),
            Change::AddField { kind, field } => write!(f, "add field '{}.{}'", kind, field),
            Change::WidenField {
                kind,
                field,
                from,
                to,
            } => write!(f, "widen '{}.{}' from {} to {}", kind, field, from, to),
            Change::RelaxField { kind, field } => {
                write!(f, "make '{}.{}' optional", kind, field)
            }
            Change::AddRelation { kind, relation } => {
                write!(f, "add relation '{}.{}'", kind, relation)
            }
            Change::Metadata { kind, detail } => write!(f, "{}: {}", kind, detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDiff {
    NoChange,
    AdditiveCompatible(Vec<Change>),
    Incompatible(Vec<String>),
}

impl SchemaDiff {
    pub fn label(&self) -> &'static str {
        match self {
            SchemaDiff::NoChange => "no change",
            SchemaDiff::AdditiveCompatible(_) => "additive",
            SchemaDiff::Incompatible(_) => "incompatible",
        }
    }
}

/// Classify the structural difference between the stored schema `old` and
/// the declared schema `new`.
pub fn diff(old: &EntitySchema, new: &EntitySchema) -> SchemaDiff {
    let mut changes = Vec::new();
    let mut reasons = Vec::new();

    for old_kind in &old.kinds {
        match new.get(&old_kind.name) {
            None => reasons.push(format!("kind '{}' was removed", old_kind.name)),
            Some(new_kind) => diff_kind(old_kind, new_kind, &mut changes, &mut reasons),
        }
    }

    for new_kind in &new.kinds {
        if old.get(&new_kind.name).is_none() {
            changes.push(Change::AddKind(new_kind.name.clone()));
        }
    }

    if !reasons.is_empty() {
        SchemaDiff::Incompatible(reasons)
    } else if changes.is_empty() {
        SchemaDiff::NoChange
    } else {
        SchemaDiff::AdditiveCompatible(changes)
    }
}

fn diff_kind(
    old: &EntityKind,
    new: &EntityKind,
    changes: &mut Vec<Change>,
    reasons: &mut Vec<String>,
) {
    let kind = &old.name;

    if old.dedup_key != new.dedup_key {
        reasons.push(format!(
            "dedup key of '{}' changed from [{}] to [{}]",
            kind,
            old.dedup_key.join(", "),
            new.dedup_key.join(", ")
        ));
    }

    for old_field in &old.fields {
        let Some(new_field) = new.get_field(&old_field.name) else {
            reasons.push(format!("field '{}.{}' was removed", kind, old_field.name));
            continue;
        };

        if old_field.ty != new_field.ty {
            if old_field.ty.widens_to(new_field.ty) {
                changes.push(Change::WidenField {
                    kind: kind.clone(),
                    field: old_field.name.clone(),
                    from: old_field.ty,
                    to: new_field.ty,
                });
            } else {
                reasons.push(format!(
                    "field '{}.{}' cannot change type from {} to {}",
                    kind, old_field.name, old_field.ty, new_field.ty
                ));
            }
        }

        match (old_field.required, new_field.required) {
            (false, true) => reasons.push(format!(
                "field '{}.{}' cannot become required",
                kind, old_field.name
            )),
            (true, false) => changes.push(Change::RelaxField {
                kind: kind.clone(),
                field: old_field.name.clone(),
            }),
            _ => {}
        }

        if old_field.default != new_field.default && old_field.ty == new_field.ty {
            changes.push(Change::Metadata {
                kind: kind.clone(),
                detail: format!("default of '{}' changed", old_field.name),
            });
        }
    }

    for new_field in &new.fields {
        if old.get_field(&new_field.name).is_some() {
            continue;
        }
        if new_field.required && new_field.default.is_none() {
            reasons.push(format!(
                "new field '{}.{}' is required but has no default",
                kind, new_field.name
            ));
        } else {
            changes.push(Change::AddField {
                kind: kind.clone(),
                field: new_field.name.clone(),
            });
        }
    }

    let old_order: Vec<&str> = old.fields.iter().map(|f| f.name.as_str()).collect();
    let new_order: Vec<&str> = new
        .fields
        .iter()
        .map(|f| f.name.as_str())
        .filter(|n| old.get_field(n).is_some())
        .collect();
    if old_order.len() == new_order.len() && old_order != new_order {
        changes.push(Change::Metadata {
            kind: kind.clone(),
            detail: "field order changed".to_string(),
        });
    }

    for old_rel in &old.relations {
        match new.get_relation(&old_rel.name) {
            None => reasons.push(format!("relation '{}.{}' was removed", kind, old_rel.name)),
            Some(r) if r.kind != old_rel.kind => reasons.push(format!(
                "relation '{}.{}' cannot move from '{}' to '{}'",
                kind, old_rel.name, old_rel.kind, r.kind
            )),
            Some(_) => {}
        }
    }
    for new_rel in &new.relations {
        if old.get_relation(&new_rel.name).is_none() {
            changes.push(Change::AddRelation {
                kind: kind.clone(),
                relation: new_rel.name.clone(),
            });
        }
    }

    if old.redescend != new.redescend {
        changes.push(Change::Metadata {
            kind: kind.clone(),
            detail: format!("redescend set to {}", new.redescend),
        });
    }
}

/// Create the internal bookkeeping tables. Idempotent.
pub async fn ensure_internal_tables(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _schema_versions (
            site TEXT NOT NULL,
            version INTEGER NOT NULL,
            schema_json TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            PRIMARY KEY (site, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _sync_runs (
            id TEXT PRIMARY KEY,
            site TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            counts_json TEXT NOT NULL DEFAULT '{}',
            fetches INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _checkpoints (
            site TEXT PRIMARY KEY,
            state_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_runs_site_started ON _sync_runs(site, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Bootstrap the database and register every configured site (`sitear init`).
pub async fn run_migrations(config: &Config) -> AnyResult<()> {
    let store = Store::open(config).await?;
    let registry = SiteRegistry::from_config(config)?;
    let result = SchemaRegistry::new(store.clone())
        .register_all(&registry)
        .await;
    store.close().await;

    for handle in result? {
        println!("  {:<20} schema v{}", handle.site, handle.version);
    }
    Ok(())
}

/// Run the `migrate` command: show (and unless `dry_run`, apply) the
/// schema changes of one or all configured sites.
pub async fn run_migrate(config: &Config, site: Option<&str>, dry_run: bool) -> AnyResult<()> {
    let store = Store::open(config).await?;
    let registry = SiteRegistry::from_config(config)?;
    let sites = match site {
        Some(name) => vec![registry.get(name)?],
        None => registry.sites().to_vec(),
    };
    if sites.is_empty() {
        println!("No sites configured.");
    }

    let schemas = SchemaRegistry::new(store.clone());
    let mut rejected = 0;
    for site in &sites {
        let plan = schemas.plan(site.as_ref()).await?;
        let current = plan
            .current_version
            .map(|v| format!("v{}", v))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {} -> v{}  {}",
            plan.site,
            current,
            plan.next_version(),
            plan.diff.label()
        );
        match &plan.diff {
            SchemaDiff::NoChange => continue,
            SchemaDiff::AdditiveCompatible(changes) => {
                for change in changes {
                    println!("    + {}", change);
                }
            }
            SchemaDiff::Incompatible(reasons) => {
                for reason in reasons {
                    println!("    ! {}", reason);
                }
                rejected += 1;
                continue;
            }
        }
        if !dry_run {
            schemas.register(site.as_ref()).await?;
        }
    }
    store.close().await;

    if rejected > 0 {
        anyhow::bail!("{} site(s) have incompatible schema changes", rejected);
    }
    Ok(())
}

/// What registering a site would do, without applying it.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub site: String,
    pub current_version: Option<u32>,
    pub diff: SchemaDiff,
}

impl MigrationPlan {
    pub fn next_version(&self) -> u32 {
        match (&self.diff, self.current_version) {
            (SchemaDiff::AdditiveCompatible(_), Some(v)) => v + 1,
            (_, Some(v)) => v,
            (_, None) => 1,
        }
    }
}

/// Registers site types against the store, migrating their layout.
#[derive(Clone)]
pub struct SchemaRegistry {
    store: Store,
}

impl SchemaRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Diff the site's declared schema against storage without applying.
    pub async fn plan(&self, site: &dyn SiteType) -> Result<MigrationPlan> {
        let schema = site.schema();
        schema.validate()?;
        let current = self.store.current_schema(site.name()).await?;
        let (current_version, diff) = match current {
            None => {
                let changes = schema
                    .kinds
                    .iter()
                    .map(|k| Change::AddKind(k.name.clone()))
                    .collect();
                (None, SchemaDiff::AdditiveCompatible(changes))
            }
            Some((version, old)) => (Some(version), diff(&old, &schema)),
        };
        Ok(MigrationPlan {
            site: site.name().to_string(),
            current_version,
            diff,
        })
    }

    /// Register a site type, creating or migrating its storage layout.
    pub async fn register(&self, site: &dyn SiteType) -> Result<SchemaHandle> {
        let plan = self.plan(site).await?;
        if let SchemaDiff::Incompatible(reasons) = plan.diff {
            tracing::warn!(site = %plan.site, reasons = ?reasons, "migration rejected");
            return Err(IngestError::MigrationRejected {
                site: plan.site,
                version: plan.current_version.unwrap_or(0),
                reasons,
            });
        }
        self.store.create_schema(site.name(), &site.schema()).await
    }

    /// Register every site in `registry`, stopping at the first rejection.
    pub async fn register_all(&self, registry: &SiteRegistry) -> Result<Vec<SchemaHandle>> {
        let mut handles = Vec::new();
        for site in registry.sites() {
            handles.push(self.register(site.as_ref()).await?);
        }
        Ok(handles)
    }
}
