//! Entity retrieval by dedup key or surrogate id.
//!
//! Reads an entity through the [`EntityMapper`] of the site's latest
//! registered schema and counts its children along every relation. Used by
//! the `sitear get` command.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::config::Config;
use crate::mapper::EntityMapper;
use crate::models::{DedupKey, EntityId};
use crate::store::Store;

/// How the entity is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Key(String),
    Id(i64),
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityResponse {
    pub site: String,
    pub kind: String,
    pub schema_version: u32,
    pub id: i64,
    pub parent_id: Option<i64>,
    pub fields: BTreeMap<String, String>,
    pub children: Vec<RelationCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationCount {
    pub relation: String,
    pub kind: String,
    pub count: i64,
}

/// Core get function returning structured data.
pub async fn get_entity(
    config: &Config,
    site: &str,
    kind: &str,
    entity: &EntityRef,
) -> Result<EntityResponse> {
    let store = Store::open(config).await?;
    let result = lookup(&store, site, kind, entity).await;
    store.close().await;
    result
}

async fn lookup(store: &Store, site: &str, kind: &str, entity: &EntityRef) -> Result<EntityResponse> {
    let handle = store.handle(site).await?.ok_or_else(|| {
        anyhow!(
            "site '{}' has no registered schema; run `sitear init` first",
            site
        )
    })?;
    let version = handle.version;
    let relations = handle
        .schema
        .get(kind)
        .map(|k| k.relations.clone())
        .ok_or_else(|| anyhow!("site '{}' has no entity kind '{}'", site, kind))?;

    let mapper = EntityMapper::new(store.clone(), handle);
    let found = match entity {
        EntityRef::Key(key) => mapper.find(kind, &DedupKey::from(key.as_str())).await?,
        EntityRef::Id(id) => mapper.get(kind, EntityId(*id)).await?,
    };
    let found = found.ok_or_else(|| match entity {
        EntityRef::Key(key) => anyhow!("{} not found: key {}", kind, key),
        EntityRef::Id(id) => anyhow!("{} not found: id {}", kind, id),
    })?;

    let mut children = Vec::with_capacity(relations.len());
    for rel in &relations {
        children.push(RelationCount {
            relation: rel.name.clone(),
            kind: rel.kind.clone(),
            count: mapper.count_children(&found, &rel.name).await?,
        });
    }

    Ok(EntityResponse {
        site: site.to_string(),
        kind: found.kind.clone(),
        schema_version: version,
        id: found.id.map(|id| id.0).unwrap_or_default(),
        parent_id: found.parent.map(|id| id.0),
        fields: found
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect(),
        children,
    })
}

/// CLI entry point: calls get_entity and prints to stdout.
pub async fn run_get(config: &Config, site: &str, kind: &str, entity: &EntityRef) -> Result<()> {
    let found = get_entity(config, site, kind, entity).await?;

    println!("--- {} #{} ---", found.kind, found.id);
    println!("site:     {} (schema v{})", found.site, found.schema_version);
    if let Some(parent) = found.parent_id {
        println!("parent:   #{}", parent);
    }
    for (name, value) in &found.fields {
        println!("{:<9} {}", format!("{}:", name), value);
    }

    if !found.children.is_empty() {
        println!();
        println!("--- Children ---");
        for rel in &found.children {
            println!("{:<16} {:>6}  ({})", rel.relation, rel.count, rel.kind);
        }
    }

    Ok(())
}
