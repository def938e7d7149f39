//! Sync progress reporting.
//!
//! Reports observable progress during `sitear sync` so operators see which
//! site is being walked, how many targets are done and how many are queued.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use crate::runs::{KindCounts, RunStatus};

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Root targets resolved; the walk is about to begin.
    Started { site: String, roots: u64 },
    /// One more target processed. `queued` is the known remaining frontier.
    Visited { site: String, done: u64, queued: u64 },
    /// The run reached a terminal state.
    Finished {
        site: String,
        status: RunStatus,
        totals: KindCounts,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync engine.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync demo  1,234 done  56 queued".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Started { site, roots } => {
                format!("sync {}  starting  {} root targets\n", site, format_number(*roots))
            }
            SyncProgressEvent::Visited { site, done, queued } => {
                format!(
                    "sync {}  {} done  {} queued\n",
                    site,
                    format_number(*done),
                    format_number(*queued)
                )
            }
            SyncProgressEvent::Finished {
                site,
                status,
                totals,
            } => format!(
                "sync {}  {}  new {}  duplicate {}  updated {}  failed {}\n",
                site,
                status,
                format_number(totals.new),
                format_number(totals.duplicate),
                format_number(totals.updated),
                format_number(totals.failed)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Started { site, roots } => serde_json::json!({
                "event": "started",
                "site": site,
                "roots": roots
            }),
            SyncProgressEvent::Visited { site, done, queued } => serde_json::json!({
                "event": "progress",
                "site": site,
                "done": done,
                "queued": queued
            }),
            SyncProgressEvent::Finished {
                site,
                status,
                totals,
            } => serde_json::json!({
                "event": "finished",
                "site": site,
                "status": status,
                "totals": totals
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. Caller can pass it to the sync engine.
    pub fn reporter(&self) -> Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
