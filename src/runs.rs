//! Sync run records, run history and resume checkpoints.
//!
//! Every run is recorded in `_sync_runs` when it starts and updated when it
//! finishes, so a process that dies mid-run leaves a `running` row behind.
//! The next run of that site marks such rows `interrupted`. History is
//! pruned to `sync.keep_runs` finished runs per site.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result as AnyResult;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{StorageError, StorageErrorKind};
use crate::models::parse_timestamp;
use crate::site::ResumeState;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
    /// The process stopped while the run was active.
    Interrupted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "failed" => Ok(RunStatus::Failed),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Per-kind outcome counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub new: u64,
    pub duplicate: u64,
    pub updated: u64,
    pub failed: u64,
}

impl KindCounts {
    fn add(&mut self, other: &KindCounts) {
        self.new += other.new;
        self.duplicate += other.duplicate;
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

/// Summary of one sync run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRun {
    pub id: String,
    pub site: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: BTreeMap<String, KindCounts>,
    /// Number of `fetch_and_parse` calls issued, retries included.
    pub fetches: u64,
    pub error: Option<String>,
}

impl SyncRun {
    pub fn start(site: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            site: site.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            counts: BTreeMap::new(),
            fetches: 0,
            error: None,
        }
    }

    pub fn counts_mut(&mut self, kind: &str) -> &mut KindCounts {
        self.counts.entry(kind.to_string()).or_default()
    }

    /// Counters for `kind` (zero when the kind was never seen).
    pub fn counts(&self, kind: &str) -> KindCounts {
        self.counts.get(kind).copied().unwrap_or_default()
    }

    pub fn total(&self) -> KindCounts {
        let mut total = KindCounts::default();
        for c in self.counts.values() {
            total.add(c);
        }
        total
    }

    pub fn failures(&self) -> u64 {
        self.total().failed
    }
}

fn run_ts(ts: &DateTime<Utc>) -> String {
    // Fixed precision keeps the text sortable.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Flag runs of `site` left `running` by a dead process.
pub async fn mark_interrupted(pool: &SqlitePool, site: &str) -> Result<u64, StorageError> {
    let res = sqlx::query(
        "UPDATE _sync_runs SET status = 'interrupted', finished_at = ? WHERE site = ? AND status = 'running'",
    )
    .bind(run_ts(&Utc::now()))
    .bind(site)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn record_start(pool: &SqlitePool, run: &SyncRun) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO _sync_runs (id, site, status, started_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&run.id)
    .bind(&run.site)
    .bind(run.status.as_str())
    .bind(run_ts(&run.started_at))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_finish(pool: &SqlitePool, run: &SyncRun) -> Result<(), StorageError> {
    let counts_json = serde_json::to_string(&run.counts)
        .map_err(|e| StorageError::new(StorageErrorKind::Query, e.to_string()))?;
    sqlx::query(
        r#"
        UPDATE _sync_runs
        SET status = ?, finished_at = ?, counts_json = ?, fetches = ?, error = ?
        WHERE id = ?
        "#,
    )
    .bind(run.status.as_str())
    .bind(run.finished_at.as_ref().map(run_ts))
    .bind(counts_json)
    .bind(run.fetches as i64)
    .bind(&run.error)
    .bind(&run.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Keep the `keep` most recent finished runs of `site`.
pub async fn prune(pool: &SqlitePool, site: &str, keep: usize) -> Result<u64, StorageError> {
    let res = sqlx::query(
        r#"
        DELETE FROM _sync_runs
        WHERE site = ? AND status != 'running' AND id NOT IN (
            SELECT id FROM _sync_runs
            WHERE site = ? AND status != 'running'
            ORDER BY started_at DESC
            LIMIT ?
        )
        "#,
    )
    .bind(site)
    .bind(site)
    .bind(keep as i64)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Most recent runs, newest first, optionally for one site.
pub async fn recent_runs(
    pool: &SqlitePool,
    site: Option<&str>,
    limit: i64,
) -> Result<Vec<SyncRun>, StorageError> {
    let rows = match site {
        Some(site) => {
            sqlx::query(
                "SELECT * FROM _sync_runs WHERE site = ? ORDER BY started_at DESC LIMIT ?",
            )
            .bind(site)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query("SELECT * FROM _sync_runs ORDER BY started_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };

    let mut runs = Vec::with_capacity(rows.len());
    for row in &rows {
        let status: String = row.try_get("status")?;
        let started_at: String = row.try_get("started_at")?;
        let finished_at: Option<String> = row.try_get("finished_at")?;
        let counts_json: String = row.try_get("counts_json")?;
        let fetches: i64 = row.try_get("fetches")?;

        runs.push(SyncRun {
            id: row.try_get("id")?,
            site: row.try_get("site")?,
            status: status.parse().map_err(StorageError::decode)?,
            started_at: parse_timestamp(&started_at)
                .ok_or_else(|| StorageError::decode(format!("bad started_at '{}'", started_at)))?,
            finished_at: finished_at.as_deref().and_then(parse_timestamp),
            counts: serde_json::from_str(&counts_json)
                .map_err(|e| StorageError::decode(format!("run counts: {}", e)))?,
            fetches: fetches as u64,
            error: row.try_get("error")?,
        });
    }
    Ok(runs)
}

pub async fn load_checkpoint(
    pool: &SqlitePool,
    site: &str,
) -> Result<Option<ResumeState>, StorageError> {
    let json: Option<String> =
        sqlx::query_scalar("SELECT state_json FROM _checkpoints WHERE site = ?")
            .bind(site)
            .fetch_optional(pool)
            .await?;

    json.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| StorageError::decode(format!("checkpoint of '{}': {}", site, e)))
    })
    .transpose()
}

/// Persist the resume state of `site`; an empty state clears it.
pub async fn save_checkpoint(
    pool: &SqlitePool,
    site: &str,
    state: &ResumeState,
) -> Result<(), StorageError> {
    if state.is_empty() {
        sqlx::query("DELETE FROM _checkpoints WHERE site = ?")
            .bind(site)
            .execute(pool)
            .await?;
        return Ok(());
    }

    let json = serde_json::to_string(state)
        .map_err(|e| StorageError::new(StorageErrorKind::Query, e.to_string()))?;
    sqlx::query(
        r#"
        INSERT INTO _checkpoints (site, state_json, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(site) DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at
        "#,
    )
    .bind(site)
    .bind(json)
    .bind(run_ts(&Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Run the `runs` command: print recent run history.
pub async fn run_runs(config: &Config, site: Option<&str>, limit: i64) -> AnyResult<()> {
    let store = Store::open(config).await?;
    let runs = recent_runs(store.pool(), site, limit).await?;

    if runs.is_empty() {
        println!("No sync runs recorded.");
        store.close().await;
        return Ok(());
    }

    println!(
        "{:<16} {:<12} {:>6} {:>6} {:>8} {:>6} {:>8}   {}",
        "SITE", "STATUS", "NEW", "DUP", "UPDATED", "FAILED", "FETCHES", "STARTED"
    );
    println!("{}", "-".repeat(90));
    for run in &runs {
        let t = run.total();
        println!(
            "{:<16} {:<12} {:>6} {:>6} {:>8} {:>6} {:>8}   {}",
            run.site,
            run.status,
            t.new,
            t.duplicate,
            t.updated,
            t.failed,
            run.fetches,
            format_ts_relative(&run.started_at)
        );
        if let Some(err) = &run.error {
            println!("  error: {}", err);
        }
    }

    store.close().await;
    Ok(())
}

/// Format a timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: &DateTime<Utc>) -> String {
    let delta = (Utc::now() - *ts).num_seconds();

    if delta < 0 {
        return format_ts_short(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_short(ts)
    }
}

fn format_ts_short(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Cancelled,
            RunStatus::Failed,
            RunStatus::Interrupted,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn totals_sum_all_kinds() {
        let mut run = SyncRun::start("demo");
        run.counts_mut("listing").new = 1;
        run.counts_mut("bid").new = 2;
        run.counts_mut("bid").failed = 1;
        let total = run.total();
        assert_eq!(total.new, 3);
        assert_eq!(run.failures(), 1);
        assert_eq!(run.counts("lot"), KindCounts::default());
    }

    #[test]
    fn relative_times() {
        let now = Utc::now();
        assert_eq!(format_ts_relative(&now), "just now");
        assert_eq!(format_ts_relative(&(now - Duration::minutes(1))), "1 min ago");
        assert_eq!(format_ts_relative(&(now - Duration::hours(5))), "5 hours ago");
        assert_eq!(format_ts_relative(&(now - Duration::days(2))), "2 days ago");
    }

    #[test]
    fn run_timestamps_sort_as_text() {
        let a = Utc::now();
        let b = a + Duration::milliseconds(500);
        assert!(run_ts(&a) < run_ts(&b));
    }
}
