//! Incremental sync engine.
//!
//! A run walks a site's target graph breadth-first:
//!
//! ```text
//! root_targets ──▶ fetch_and_parse ──▶ decide ──▶ commit subtree ──▶ child targets
//!                  (bounded concurrency)  new / duplicate / updated      (queued)
//! ```
//!
//! Each fetched subtree (an entity and its inline children) is committed in
//! its own transaction. Child targets are queued only after their parent has
//! committed. An unchanged duplicate is not descended into unless its kind
//! always re-descends or a previous run left its subtree incomplete.
//!
//! A failed target only costs its own subtree: it is counted under the
//! target's kind, its ancestors stay incomplete (so the next run re-walks
//! them) and the run moves on. Cancellation is checked at target boundaries.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SyncOptions};
use crate::error::{IngestError, Result, SiteError, StorageError};
use crate::mapper::{self, EntityMapper};
use crate::migrate::SchemaRegistry;
use crate::models::{Entity, EntityId, EntityTree};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::runs::{self, RunStatus, SyncRun};
use crate::site::{FetchTarget, Parsed, ResumeState, SiteRegistry, SiteType};
use crate::store::{SchemaHandle, Store, Txn};

/// Observable state of a [`SyncEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Outcome of the new/duplicate/changed decision for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    New,
    Duplicate,
    Updated,
}

pub struct SyncEngine {
    store: Store,
    site: Arc<dyn SiteType>,
    handle: SchemaHandle,
    progress: Arc<dyn SyncProgressReporter>,
    active: Mutex<Option<CancellationToken>>,
    last: Mutex<Option<SyncRun>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the active-run slot however `start_run` exits.
struct ActiveGuard<'a>(&'a Mutex<Option<CancellationToken>>);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

struct ParentRef {
    kind: String,
    id: EntityId,
    node: usize,
}

struct Task {
    target: FetchTarget,
    parent: Option<ParentRef>,
}

impl Task {
    fn root(target: FetchTarget) -> Self {
        Self {
            target,
            parent: None,
        }
    }
}

/// Tracks entities whose child targets are still outstanding.
#[derive(Default)]
struct Tracker {
    nodes: Vec<Node>,
}

struct Node {
    kind: String,
    id: EntityId,
    parent: Option<usize>,
    pending: usize,
    failed: bool,
}

impl Tracker {
    fn open(&mut self, kind: &str, id: EntityId, parent: Option<usize>, pending: usize) -> usize {
        self.nodes.push(Node {
            kind: kind.to_string(),
            id,
            parent,
            pending,
            failed: false,
        });
        self.nodes.len() - 1
    }

    /// Record that one child target of `node` finished. Returns the
    /// entities whose whole subtree is now visited.
    fn child_done(&mut self, mut node: Option<usize>, mut ok: bool) -> Vec<(String, EntityId)> {
        let mut complete = Vec::new();
        while let Some(i) = node {
            let n = &mut self.nodes[i];
            n.pending = n.pending.saturating_sub(1);
            if !ok {
                n.failed = true;
            }
            if n.pending > 0 {
                break;
            }
            ok = !n.failed;
            if ok {
                complete.push((n.kind.clone(), n.id));
            }
            node = n.parent;
        }
        complete
    }
}

/// Mutable state of one walk.
struct Walk {
    queue: VecDeque<Task>,
    tracker: Tracker,
    seen_roots: HashSet<FetchTarget>,
    failed_roots: Vec<FetchTarget>,
    continuation: Option<String>,
    done: u64,
}

struct Committed {
    id: EntityId,
    decision: Decision,
    complete: bool,
    outcomes: Vec<(String, Decision)>,
}

impl SyncEngine {
    pub fn new(store: Store, site: Arc<dyn SiteType>, handle: SchemaHandle) -> Self {
        Self {
            store,
            site,
            handle,
            progress: Arc::new(NoProgress),
            active: Mutex::new(None),
            last: Mutex::new(None),
        }
    }

    /// Register the site's schema (migrating if needed) and build an engine.
    pub async fn for_site(store: Store, site: Arc<dyn SiteType>) -> Result<Self> {
        let handle = SchemaRegistry::new(store.clone())
            .register(site.as_ref())
            .await?;
        Ok(Self::new(store, site, handle))
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn handle(&self) -> &SchemaHandle {
        &self.handle
    }

    /// Read-only view over the entities this engine writes.
    pub fn mapper(&self) -> EntityMapper {
        EntityMapper::new(self.store.clone(), self.handle.clone())
    }

    pub fn state(&self) -> EngineState {
        if lock(&self.active).is_some() {
            return EngineState::Running;
        }
        match lock(&self.last).as_ref().map(|r| r.status) {
            None => EngineState::Idle,
            Some(RunStatus::Running) => EngineState::Running,
            Some(RunStatus::Completed) => EngineState::Completed,
            Some(RunStatus::Cancelled) => EngineState::Cancelled,
            Some(RunStatus::Failed) | Some(RunStatus::Interrupted) => EngineState::Failed,
        }
    }

    /// Summary of the most recent finished run, kept until the next start.
    pub fn last_run(&self) -> Option<SyncRun> {
        lock(&self.last).clone()
    }

    /// Request cooperative cancellation of the active run. Returns false
    /// when no run is active.
    pub fn cancel(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one update pass over the site.
    ///
    /// Fails with [`IngestError::RunAlreadyActive`] when a run is in
    /// progress, or with a storage error if the run cannot be recorded; the
    /// latter leaves the engine `Failed` with the error in [`last_run`].
    ///
    /// [`last_run`]: SyncEngine::last_run
    /// Per-target failures never fail the call; they are reported in the
    /// returned [`SyncRun`].
    pub async fn start_run(&self, opts: &SyncOptions) -> Result<SyncRun> {
        let token = {
            let mut active = lock(&self.active);
            if active.is_some() {
                return Err(IngestError::RunAlreadyActive(self.site.name().to_string()));
            }
            let token = CancellationToken::new();
            *active = Some(token.clone());
            token
        };
        let _guard = ActiveGuard(&self.active);
        *lock(&self.last) = None;

        let run = match self.execute(opts, &token).await {
            Ok(run) => run,
            Err(e) => {
                // The run never made it into `_sync_runs`; keep a summary anyway.
                let mut failed = SyncRun::start(self.site.name());
                failed.status = RunStatus::Failed;
                failed.finished_at = Some(Utc::now());
                failed.error = Some(e.to_string());
                *lock(&self.last) = Some(failed);
                return Err(e);
            }
        };
        *lock(&self.last) = Some(run.clone());
        Ok(run)
    }

    async fn execute(&self, opts: &SyncOptions, token: &CancellationToken) -> Result<SyncRun> {
        let site = self.site.name();
        let pool = self.store.pool();

        let stale = runs::mark_interrupted(pool, site).await?;
        if stale > 0 {
            warn!(site, runs = stale, "marked unfinished runs as interrupted");
        }

        let mut run = SyncRun::start(site);
        runs::record_start(pool, &run).await?;
        info!(site, run_id = %run.id, schema_version = self.handle.version, "sync run started");

        let resume = match self.walk(&mut run, opts, token).await {
            Ok(resume) => resume,
            Err(e) => {
                run.error = Some(e.to_string());
                None
            }
        };

        run.finished_at = Some(Utc::now());
        run.status = if token.is_cancelled() {
            RunStatus::Cancelled
        } else if run.error.is_some() || run.failures() > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        if let Err(e) = runs::record_finish(pool, &run).await {
            warn!(site, run_id = %run.id, error = %e, "failed to record run result");
        }
        if let Some(resume) = resume {
            if let Err(e) = runs::save_checkpoint(pool, site, &resume).await {
                warn!(site, error = %e, "failed to save checkpoint");
            }
        }
        match runs::prune(pool, site, opts.keep_runs).await {
            Ok(n) if n > 0 => debug!(site, pruned = n, "pruned run history"),
            Ok(_) => {}
            Err(e) => warn!(site, error = %e, "failed to prune run history"),
        }

        let totals = run.total();
        info!(
            site,
            run_id = %run.id,
            status = %run.status,
            new = totals.new,
            duplicate = totals.duplicate,
            updated = totals.updated,
            failed = totals.failed,
            fetches = run.fetches,
            "sync run finished"
        );
        self.progress.report(SyncProgressEvent::Finished {
            site: site.to_string(),
            status: run.status,
            totals,
        });
        Ok(run)
    }

    /// Walk the target graph. Returns the state to resume from, or `None`
    /// when the previous checkpoint should be kept as is.
    async fn walk(
        &self,
        run: &mut SyncRun,
        opts: &SyncOptions,
        token: &CancellationToken,
    ) -> Result<Option<ResumeState>> {
        let site = self.site.name();
        let previous = runs::load_checkpoint(self.store.pool(), site).await?;

        let roots = match self.site.root_targets(previous.as_ref()).await {
            Ok(roots) => roots,
            Err(e) => {
                warn!(site, error = %e, "could not resolve root targets");
                run.error = Some(e.to_string());
                return Ok(None);
            }
        };

        let mut walk = Walk {
            queue: VecDeque::new(),
            tracker: Tracker::default(),
            seen_roots: HashSet::new(),
            failed_roots: Vec::new(),
            continuation: previous.as_ref().and_then(|p| p.continuation.clone()),
            done: 0,
        };
        let carried = previous.iter().flat_map(|p| p.pending.iter().cloned());
        for target in roots.into_iter().chain(carried) {
            if walk.seen_roots.insert(target.clone()) {
                walk.queue.push_back(Task::root(target));
            }
        }

        self.progress.report(SyncProgressEvent::Started {
            site: site.to_string(),
            roots: walk.queue.len() as u64,
        });

        let policy = RetryPolicy {
            max_retries: opts.max_retries,
            backoff: Duration::from_millis(opts.retry_backoff_ms),
        };
        let width = opts.concurrency.max(1);

        while !walk.queue.is_empty() && !token.is_cancelled() {
            let batch: Vec<Task> = (0..width).filter_map(|_| walk.queue.pop_front()).collect();
            let handles: Vec<_> = batch
                .iter()
                .map(|task| {
                    tokio::spawn(fetch_with_retry(
                        self.site.clone(),
                        task.target.clone(),
                        policy,
                        token.clone(),
                    ))
                })
                .collect();

            let mut tasks = batch.into_iter();
            let mut handles = handles.into_iter();
            while let (Some(task), Some(handle)) = (tasks.next(), handles.next()) {
                let (result, attempts) = match handle.await {
                    Ok(r) => r,
                    Err(e) => (
                        Err(SiteError::parse(&task.target, format!("fetch task failed: {}", e))),
                        1,
                    ),
                };
                run.fetches += attempts;

                if token.is_cancelled() {
                    // Unprocessed tasks go back so their roots are saved for resume.
                    let rest: Vec<Task> = std::iter::once(task).chain(tasks.by_ref()).collect();
                    for h in handles.by_ref() {
                        h.abort();
                    }
                    for t in rest.into_iter().rev() {
                        walk.queue.push_front(t);
                    }
                    break;
                }

                self.process(&mut walk, run, task, result).await;
                walk.done += 1;
                self.progress.report(SyncProgressEvent::Visited {
                    site: site.to_string(),
                    done: walk.done,
                    queued: walk.queue.len() as u64,
                });
            }
        }

        if token.is_cancelled() {
            info!(site, run_id = %run.id, queued = walk.queue.len(), "sync run cancelled");
        }

        let mut pending = walk.failed_roots;
        pending.extend(
            walk.queue
                .into_iter()
                .filter(|t| t.parent.is_none())
                .map(|t| t.target),
        );
        Ok(Some(ResumeState {
            pending,
            continuation: walk.continuation,
        }))
    }

    /// Decide, commit and enqueue for one fetched target.
    async fn process(
        &self,
        walk: &mut Walk,
        run: &mut SyncRun,
        task: Task,
        result: std::result::Result<Parsed, SiteError>,
    ) {
        let parsed = match result {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fail(walk, run, &task, &e.to_string());
                return;
            }
        };
        if parsed.tree.entity.kind != task.target.kind {
            let msg = format!(
                "target of kind '{}' produced a '{}' entity",
                task.target.kind, parsed.tree.entity.kind
            );
            self.fail(walk, run, &task, &msg);
            return;
        }

        let parent = task.parent.as_ref().map(|p| (p.kind.as_str(), p.id));
        let has_targets = !parsed.targets.is_empty();
        let committed = match self.commit_subtree(&parsed.tree, parent, has_targets).await {
            Ok(c) => c,
            Err(e) => {
                self.fail(walk, run, &task, &e.to_string());
                return;
            }
        };

        for (kind, decision) in &committed.outcomes {
            let counts = run.counts_mut(kind);
            match decision {
                Decision::New => counts.new += 1,
                Decision::Duplicate => counts.duplicate += 1,
                Decision::Updated => counts.updated += 1,
            }
        }
        debug!(
            site = self.site.name(),
            fetch = %task.target,
            decision = ?committed.decision,
            children = parsed.targets.len(),
            "target committed"
        );

        if task.parent.is_none() {
            if let Some(marker) = parsed.continuation {
                if let Some(next) = self.site.continuation_target(&marker) {
                    if walk.seen_roots.insert(next.clone()) {
                        walk.queue.push_back(Task::root(next));
                    }
                }
                walk.continuation = Some(marker);
            }
        }

        let recurse = match committed.decision {
            Decision::New | Decision::Updated => true,
            Decision::Duplicate => {
                !committed.complete
                    || self
                        .handle
                        .schema
                        .get(&task.target.kind)
                        .map(|k| self.site.always_redescend(k))
                        .unwrap_or(false)
            }
        };

        let parent_node = task.parent.as_ref().map(|p| p.node);
        if recurse && has_targets {
            let node = walk.tracker.open(
                &task.target.kind,
                committed.id,
                parent_node,
                parsed.targets.len(),
            );
            for target in parsed.targets {
                walk.queue.push_back(Task {
                    target,
                    parent: Some(ParentRef {
                        kind: task.target.kind.clone(),
                        id: committed.id,
                        node,
                    }),
                });
            }
        } else {
            let completed = walk.tracker.child_done(parent_node, true);
            self.mark_complete(completed).await;
        }
    }

    fn fail(&self, walk: &mut Walk, run: &mut SyncRun, task: &Task, error: &str) {
        warn!(
            site = self.site.name(),
            run_id = %run.id,
            fetch = %task.target,
            error,
            "target failed; skipping its subtree"
        );
        run.counts_mut(&task.target.kind).failed += 1;
        if task.parent.is_none() {
            walk.failed_roots.push(task.target.clone());
        }
        walk.tracker
            .child_done(task.parent.as_ref().map(|p| p.node), false);
    }

    async fn mark_complete(&self, entities: Vec<(String, EntityId)>) {
        if entities.is_empty() {
            return;
        }
        if let Err(e) = self.try_mark_complete(&entities).await {
            warn!(site = self.site.name(), error = %e, "could not flag completed subtrees");
        }
    }

    async fn try_mark_complete(&self, entities: &[(String, EntityId)]) -> Result<(), StorageError> {
        let mut txn = self.store.begin().await?;
        for (kind, id) in entities {
            self.store
                .mark_complete(&self.handle, kind, *id, &mut txn)
                .await?;
        }
        txn.commit().await
    }

    /// Commit a fetched entity and its inline children in one transaction.
    async fn commit_subtree(
        &self,
        tree: &EntityTree,
        parent: Option<(&str, EntityId)>,
        has_targets: bool,
    ) -> Result<Committed> {
        let mut txn = self.store.begin().await?;
        let mut outcomes = Vec::new();

        let (id, decision, complete) = self
            .commit_entity(&mut txn, &tree.entity, parent, has_targets)
            .await?;
        outcomes.push((tree.entity.kind.clone(), decision));

        let mut inline: VecDeque<(&EntityTree, &str, EntityId)> = tree
            .children
            .iter()
            .map(|c| (c, tree.entity.kind.as_str(), id))
            .collect();
        while let Some((node, parent_kind, parent_id)) = inline.pop_front() {
            let (child_id, child_decision, _) = self
                .commit_entity(&mut txn, &node.entity, Some((parent_kind, parent_id)), false)
                .await?;
            outcomes.push((node.entity.kind.clone(), child_decision));
            inline.extend(
                node.children
                    .iter()
                    .map(|g| (g, node.entity.kind.as_str(), child_id)),
            );
        }

        txn.commit().await?;
        Ok(Committed {
            id,
            decision,
            complete,
            outcomes,
        })
    }

    /// Look up one candidate by dedup key and insert, update or skip it.
    /// Returns the entity id, the decision and its `_complete` flag.
    async fn commit_entity(
        &self,
        txn: &mut Txn,
        entity: &Entity,
        parent: Option<(&str, EntityId)>,
        has_targets: bool,
    ) -> Result<(EntityId, Decision, bool)> {
        let kind = self
            .handle
            .schema
            .get(&entity.kind)
            .ok_or_else(|| IngestError::UnknownKind(entity.kind.clone()))?;

        if let Some((parent_kind, _)) = parent {
            let owner = self
                .handle
                .schema
                .parent_of(&kind.name)
                .map(|(k, _)| k.name.as_str());
            if owner != Some(parent_kind) {
                return Err(IngestError::InvalidEntity(format!(
                    "'{}' is not a child kind of '{}'",
                    kind.name, parent_kind
                )));
            }
        }

        let mut candidate = entity.clone();
        candidate.id = None;
        candidate.parent = parent.map(|(_, id)| id);
        let candidate = mapper::normalize(kind, candidate)?;
        let key = self.site.dedup_key(kind, &candidate)?;

        let stored = self
            .store
            .lookup_row(&self.handle, &kind.name, &key, txn)
            .await?;

        let Some(stored) = stored else {
            let mut row = mapper::to_record_with_key(kind, &candidate, key)?;
            row.complete = !has_targets;
            let id = self.store.upsert(&self.handle, &row, txn).await?;
            return Ok((id, Decision::New, row.complete));
        };

        let id = stored
            .id
            .ok_or_else(|| StorageError::decode(format!("{} row without _id", kind.name)))?;
        let existing = mapper::from_record(&stored, kind);
        let moved = candidate.parent.is_some() && candidate.parent != existing.parent;

        if existing.fields == candidate.fields && !moved {
            if !stored.complete && !has_targets {
                self.store
                    .mark_complete(&self.handle, &kind.name, id, txn)
                    .await?;
                return Ok((id, Decision::Duplicate, true));
            }
            return Ok((id, Decision::Duplicate, stored.complete));
        }

        let mut row = mapper::to_record_with_key(kind, &candidate, key)?;
        row.id = Some(id);
        row.parent_id = candidate.parent.or(stored.parent_id);
        row.complete = !has_targets;
        self.store.upsert(&self.handle, &row, txn).await?;
        Ok((id, Decision::Updated, row.complete))
    }
}

/// Fetch one target, retrying transient failures with exponential backoff.
/// Returns the result and the number of attempts made.
async fn fetch_with_retry(
    site: Arc<dyn SiteType>,
    target: FetchTarget,
    policy: RetryPolicy,
    token: CancellationToken,
) -> (std::result::Result<Parsed, SiteError>, u64) {
    let mut attempt: u32 = 0;
    loop {
        let result = site.fetch_and_parse(&target).await;
        let attempts = u64::from(attempt) + 1;
        match result {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy
                    .backoff
                    .saturating_mul(1u32 << attempt.min(16));
                warn!(
                    site = site.name(),
                    fetch = %target,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "fetch failed; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return (Err(e), attempts),
                }
                attempt += 1;
            }
            other => return (other, attempts),
        }
    }
}

/// Run the `sync` command for one configured site. Ctrl-C cancels the run
/// at the next target boundary.
pub async fn run_sync(
    config: &Config,
    site: &str,
    opts: &SyncOptions,
    progress: Arc<dyn SyncProgressReporter>,
) -> anyhow::Result<()> {
    let registry = SiteRegistry::from_config(config)?;
    let site = registry.get(site)?;
    let store = Store::open(config).await?;

    let engine = match SyncEngine::for_site(store.clone(), site).await {
        Ok(engine) => engine.with_progress(progress),
        Err(e) => {
            store.close().await;
            return Err(e.into());
        }
    };

    let watcher = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling; finishing the current target...");
            engine.cancel();
        }
        std::future::pending::<()>().await
    };
    let result = tokio::select! {
        result = engine.start_run(opts) => result,
        _ = watcher => unreachable!("ctrl-c watcher never completes"),
    };
    store.close().await;
    let run = result?;

    println!(
        "{}: {} ({} fetches, run {})",
        run.site, run.status, run.fetches, run.id
    );
    for (kind, c) in &run.counts {
        println!(
            "  {:<20} new {:>6}  duplicate {:>6}  updated {:>6}  failed {:>6}",
            kind, c.new, c.duplicate, c.updated, c.failed
        );
    }
    if let Some(err) = &run.error {
        println!("  error: {}", err);
    }

    if run.status == RunStatus::Failed {
        anyhow::bail!(
            "sync of '{}' finished with {} failed target(s)",
            run.site,
            run.failures()
        );
    }
    Ok(())
}
