//! # Site Archive
//!
//! Incremental, schema-versioned archival of paged data sources into SQLite.
//!
//! A *site type* declares an entity schema and knows how to fetch and parse
//! its pages. The sync engine walks the site's target graph, decides for each
//! parsed entity whether it is new, an unchanged duplicate or an update, and
//! commits whole subtrees atomically. Unchanged subtrees are not walked
//! again, so repeated runs are cheap and idempotent.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Site types  │──▶│ Sync engine │──▶│ Entity store │
//! │ JSON/custom │   │ decide+walk │   │ SQLite/sqlx  │
//! └─────────────┘   └──────┬──────┘   └──────┬───────┘
//!                          │                 │
//!                   ┌──────┴──────┐   ┌──────┴───────┐
//!                   │ runs +      │   │ schema       │
//!                   │ checkpoints │   │ migrations   │
//!                   └─────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sitear init                        # create database, register sites
//! sitear migrate --dry-run           # preview schema changes
//! sitear sync auction                # run an update pass
//! sitear runs auction                # review run history
//! sitear get auction listing L1      # inspect one entity
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and per-run sync options |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Values, entities, dedup keys, storage rows |
//! | [`schema`] | Entity schema declarations and validation |
//! | [`migrate`] | Schema diffing, versioning and registration |
//! | [`store`] | Transactional SQLite entity storage |
//! | [`mapper`] | Entity/row conversion and lazy read queries |
//! | [`site`] | Site type contract and registry |
//! | [`site_json`] | Built-in JSON document site type |
//! | [`fetch`] | Throttled HTTP client |
//! | [`sync`] | Incremental sync engine |
//! | [`runs`] | Run history and resume checkpoints |
//! | [`progress`] | Sync progress reporting |
//! | [`db`] | Database connection |

pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod get;
pub mod mapper;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod runs;
pub mod schema;
pub mod search;
pub mod site;
pub mod site_json;
pub mod sites;
pub mod store;
pub mod sync;
