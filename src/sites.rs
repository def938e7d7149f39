use anyhow::Result;

use crate::config::Config;
use crate::site::SiteRegistry;
use crate::store::Store;

/// Run the `sites` command: configured site types and their stored schema
/// versions, plus sites that only exist in the database.
pub async fn list_sites(config: &Config) -> Result<()> {
    let registry = SiteRegistry::from_config(config)?;
    let store = Store::open(config).await?;
    let stored = store.registered_sites().await;
    store.close().await;
    let stored = stored?;

    if registry.is_empty() && stored.is_empty() {
        println!("No sites configured.");
        return Ok(());
    }

    println!("{:<20} {:<8} {:<6} DESCRIPTION", "SITE", "SCHEMA", "KINDS");
    for site in registry.sites() {
        let version = stored
            .iter()
            .find(|s| s.site == site.name())
            .map(|s| format!("v{}", s.version))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<8} {:<6} {}",
            site.name(),
            version,
            site.schema().kinds.len(),
            site.description()
        );
    }

    for orphan in stored
        .iter()
        .filter(|s| registry.find(&s.site).is_none())
    {
        println!(
            "{:<20} {:<8} {:<6} (not configured; last migrated {})",
            orphan.site,
            format!("v{}", orphan.version),
            "?",
            orphan.applied_at
        );
    }

    Ok(())
}
