//! # Site Archive CLI (`sitear`)
//!
//! The `sitear` binary initializes the archive, migrates site schemas, runs
//! incremental syncs and inspects what was stored.
//!
//! ## Usage
//!
//! ```bash
//! sitear --config ./config/sitear.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sitear init` | Create the database and register every configured site |
//! | `sitear sites` | List site types and their schema versions |
//! | `sitear migrate [site]` | Show and apply schema changes |
//! | `sitear sync <site>` | Run one incremental update pass |
//! | `sitear runs [site]` | Show recent run history |
//! | `sitear get <site> <kind> <key>` | Print one entity and its child counts |
//! | `sitear search <site> <kind> <field>` | Term search over one field |
//!
//! ## Examples
//!
//! ```bash
//! # Preview schema changes without applying them
//! sitear migrate auction --dry-run
//!
//! # Sync with a one-off override of the retry policy
//! sitear sync auction --set sync.max_retries=5
//!
//! # Listings whose title mentions oak but not veneer
//! sitear search auction listing title --all oak --not veneer
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use site_archive::get::EntityRef;
use site_archive::mapper::TermQuery;
use site_archive::progress::ProgressMode;
use site_archive::{config, get, migrate, runs, search, sites, sync};

/// Site Archive CLI: incremental, schema-versioned archival of paged data
/// sources into SQLite.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/sitear.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "sitear",
    about = "Site Archive: incremental, schema-versioned archival of paged data sources",
    version,
    long_about = "Site Archive walks configured data sources, recognizes records it has already \
    stored by their dedup keys, and commits only new or changed subtrees to SQLite. Schemas are \
    versioned and migrated additively."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sitear.toml")]
    config: PathBuf,

    /// Verbose logging (debug level). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and register every configured site.
    ///
    /// Idempotent: running it again only applies pending additive schema
    /// changes.
    Init,

    /// List configured site types and their stored schema versions.
    Sites,

    /// Show and apply schema changes for one site or all sites.
    ///
    /// Incompatible changes (removed fields, narrowed types, a changed
    /// dedup key) are reported and never applied.
    Migrate {
        /// Site name. All configured sites when omitted.
        site: Option<String>,

        /// Only print the classified changes.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run one incremental update pass over a site.
    ///
    /// Ctrl-C cancels cooperatively: the current target finishes, unvisited
    /// roots are saved and picked up by the next run.
    Sync {
        /// Site name from `[sites.json.<name>]`.
        site: String,

        /// Override a `[sync]` option for this run (`sync.concurrency=8`).
        #[arg(long = "set", value_parser = parse_key_val)]
        prefs: Vec<(String, String)>,

        /// Progress output on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show recent sync runs.
    Runs {
        /// Only runs of this site.
        site: Option<String>,

        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Print one entity, its fields and child counts.
    Get {
        site: String,
        kind: String,
        /// Dedup key (single-field keys are stored verbatim).
        key: Option<String>,
        /// Look up by surrogate id instead of dedup key.
        #[arg(long, conflicts_with = "key")]
        id: Option<i64>,
    },

    /// Search one field of an entity kind for terms.
    Search {
        site: String,
        kind: String,
        field: String,

        /// Terms that must all occur.
        #[arg(long = "all")]
        all: Vec<String>,

        /// Terms of which at least one must occur.
        #[arg(long = "any")]
        any: Vec<String>,

        /// Terms that must not occur.
        #[arg(long = "not")]
        not: Vec<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,
    },
}

/// Parse a `key=value` pair for `--set` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "site_archive=debug,sitear=debug,warn"
    } else {
        "site_archive=info,sitear=info,warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sites => {
            sites::list_sites(&cfg).await?;
        }
        Commands::Migrate { site, dry_run } => {
            migrate::run_migrate(&cfg, site.as_deref(), dry_run).await?;
        }
        Commands::Sync {
            site,
            prefs,
            progress,
        } => {
            let mut opts = cfg.sync.clone();
            let prefs: BTreeMap<String, String> = prefs.into_iter().collect();
            opts.apply_prefs(&prefs)?;
            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();
            sync::run_sync(&cfg, &site, &opts, reporter).await?;
        }
        Commands::Runs { site, limit } => {
            runs::run_runs(&cfg, site.as_deref(), limit).await?;
        }
        Commands::Get { site, kind, key, id } => {
            let entity = match (key, id) {
                (_, Some(id)) => EntityRef::Id(id),
                (Some(key), None) => EntityRef::Key(key),
                (None, None) => anyhow::bail!("Give a dedup key or --id."),
            };
            get::run_get(&cfg, &site, &kind, &entity).await?;
        }
        Commands::Search {
            site,
            kind,
            field,
            all,
            any,
            not,
            limit,
        } => {
            let terms = TermQuery { all, any, not };
            search::run_search(&cfg, &site, &kind, &field, &terms, limit).await?;
        }
    }

    Ok(())
}
