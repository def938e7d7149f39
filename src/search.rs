//! Term search over one field of a stored entity kind.
//!
//! Matching is a case-insensitive substring test per term: every `--all`
//! term must occur, at least one `--any` term must occur (when any are
//! given), and no `--not` term may occur.

use anyhow::{anyhow, bail, Result};

use crate::config::Config;
use crate::mapper::{EntityMapper, TermQuery};
use crate::store::Store;

const PREVIEW_CHARS: usize = 60;

/// Run the `search` command and print matching entities.
pub async fn run_search(
    config: &Config,
    site: &str,
    kind: &str,
    field: &str,
    terms: &TermQuery,
    limit: Option<i64>,
) -> Result<()> {
    if terms.is_empty() {
        bail!("Give at least one term with --all, --any or --not.");
    }

    let store = Store::open(config).await?;
    let result = search(&store, site, kind, field, terms, limit).await;
    store.close().await;
    let hits = result?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for entity in &hits {
        let id = entity.id.map(|id| id.to_string()).unwrap_or_default();
        let value = entity
            .get(field)
            .map(|v| preview(&v.to_string()))
            .unwrap_or_default();
        println!("#{:<8} {}", id, value);
    }
    println!();
    println!("{} result(s)", hits.len());
    Ok(())
}

async fn search(
    store: &Store,
    site: &str,
    kind: &str,
    field: &str,
    terms: &TermQuery,
    limit: Option<i64>,
) -> Result<Vec<crate::models::Entity>> {
    let handle = store
        .handle(site)
        .await?
        .ok_or_else(|| anyhow!("site '{}' has no registered schema", site))?;
    let mapper = EntityMapper::new(store.clone(), handle);
    Ok(mapper.search(kind, field, terms, limit).await?)
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= PREVIEW_CHARS && !text.contains('\n') {
        return line.to_string();
    }
    let cut: String = line.chars().take(PREVIEW_CHARS).collect();
    format!("{}...", cut)
}
