//! Sync engine behavior against an in-memory site type and a temp database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use site_archive::config::{Config, SyncOptions};
use site_archive::error::{IngestError, SiteError};
use site_archive::models::{DedupKey, Entity, EntityTree, Value};
use site_archive::runs::{self, RunStatus, SyncRun};
use site_archive::schema::{EntityKind, EntitySchema, Field, FieldType};
use site_archive::site::{FetchTarget, Parsed, ResumeState, SiteType};
use site_archive::store::Store;
use site_archive::sync::{EngineState, SyncEngine};

enum Page {
    Ok(Parsed),
    /// Transient failure, retried by the engine.
    Down,
    /// Content that cannot be parsed.
    Broken,
}

#[derive(Default)]
struct MemorySite {
    roots: Mutex<Vec<FetchTarget>>,
    pages: Mutex<HashMap<FetchTarget, Page>>,
    log: Mutex<Vec<FetchTarget>>,
    previous: Mutex<Vec<Option<ResumeState>>>,
    /// (started, release): the next fetch signals `started` and waits.
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    /// Declared schema, when it differs from `auction_schema()`.
    schema: Mutex<Option<EntitySchema>>,
}

impl MemorySite {
    fn new(roots: &[FetchTarget]) -> Arc<Self> {
        let site = Self::default();
        *site.roots.lock().unwrap() = roots.to_vec();
        Arc::new(site)
    }

    fn page(&self, target: FetchTarget, page: Page) {
        self.pages.lock().unwrap().insert(target, page);
    }

    fn fetched(&self) -> Vec<FetchTarget> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    fn declare(&self, schema: EntitySchema) {
        *self.schema.lock().unwrap() = Some(schema);
    }

    fn hold_next_fetch(&self) -> (Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((started.clone(), release.clone()));
        (started, release)
    }
}

#[async_trait]
impl SiteType for MemorySite {
    fn name(&self) -> &str {
        "auction"
    }

    fn schema(&self) -> EntitySchema {
        self.schema
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(auction_schema)
    }

    async fn root_targets(
        &self,
        previous: Option<&ResumeState>,
    ) -> Result<Vec<FetchTarget>, SiteError> {
        self.previous.lock().unwrap().push(previous.cloned());
        Ok(self.roots.lock().unwrap().clone())
    }

    async fn fetch_and_parse(&self, target: &FetchTarget) -> Result<Parsed, SiteError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((started, release)) = gate {
            started.notify_one();
            release.notified().await;
        }
        self.log.lock().unwrap().push(target.clone());

        let pages = self.pages.lock().unwrap();
        match pages.get(target) {
            Some(Page::Ok(parsed)) => Ok(parsed.clone()),
            Some(Page::Down) | None => Err(SiteError::fetch(target, "connection reset")),
            Some(Page::Broken) => Err(SiteError::parse(target, "missing title")),
        }
    }

    fn continuation_target(&self, marker: &str) -> Option<FetchTarget> {
        Some(FetchTarget::new("index", marker))
    }
}

fn auction_schema() -> EntitySchema {
    EntitySchema::new()
        .kind(
            EntityKind::new("index")
                .field(Field::integer("number").required())
                .dedup_key(["number"])
                .relation("listings", "listing")
                .redescend(),
        )
        .kind(
            EntityKind::new("listing")
                .field(Field::text("id").required())
                .field(Field::text("title"))
                .dedup_key(["id"])
                .relation("bids", "bid")
                .relation("lots", "lot"),
        )
        .kind(
            EntityKind::new("bid")
                .field(Field::text("listing_id").required())
                .field(Field::real("amount").required())
                .dedup_key(["listing_id", "amount"]),
        )
        .kind(
            EntityKind::new("lot")
                .field(Field::text("id").required())
                .field(Field::text("name"))
                .dedup_key(["id"]),
        )
}

fn target(kind: &str, locator: &str) -> FetchTarget {
    FetchTarget::new(kind, locator)
}

fn listing(id: &str, title: &str) -> Entity {
    Entity::new("listing").with("id", id).with("title", title)
}

fn bid(listing: &str, amount: f64) -> Entity {
    Entity::new("bid")
        .with("listing_id", listing)
        .with("amount", amount)
}

fn lot(id: &str) -> Parsed {
    Parsed::new(Entity::new("lot").with("id", id).with("name", format!("Lot {}", id)))
}

fn opts() -> SyncOptions {
    SyncOptions {
        concurrency: 2,
        max_retries: 0,
        retry_backoff_ms: 1,
        keep_runs: 20,
    }
}

async fn setup(site: &Arc<MemorySite>) -> (TempDir, Store, SyncEngine) {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path().join("archive.sqlite"));
    let store = Store::open(&config).await.unwrap();
    let engine = SyncEngine::for_site(store.clone(), site.clone() as Arc<dyn SiteType>)
        .await
        .unwrap();
    (tmp, store, engine)
}

/// Every stored row of the auction tables, all columns, in id order.
async fn dump(store: &Store) -> Vec<String> {
    let tables: [(&str, &[&str]); 4] = [
        ("auction__index", &["number"]),
        ("auction__listing", &["id", "title"]),
        ("auction__bid", &["listing_id", "amount"]),
        ("auction__lot", &["id", "name"]),
    ];
    let mut rows = Vec::new();
    for (table, fields) in tables {
        let cols = ["_id", "_parent_id", "_dedup_key", "_complete", "_updated_at"]
            .iter()
            .chain(fields.iter())
            .map(|c| format!("quote(\"{}\")", c))
            .collect::<Vec<_>>()
            .join(" || '|' || ");
        let sql = format!("SELECT '{}|' || {} FROM \"{}\" ORDER BY _id", table, cols, table);
        let mut found = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(store.pool())
            .await
            .unwrap();
        rows.append(&mut found);
    }
    rows
}

/// L1 with two inline bids and one lot fetched separately.
fn l1_page() -> Parsed {
    Parsed::new(
        EntityTree::leaf(listing("L1", "Oak desk"))
            .with_child(bid("L1", 10.0))
            .with_child(bid("L1", 12.5)),
    )
    .with_target(target("lot", "A"))
}

#[tokio::test]
async fn second_run_recognizes_unchanged_subtree() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    site.page(target("listing", "L1"), Page::Ok(l1_page()));
    site.page(target("lot", "A"), Page::Ok(lot("A")));
    let (_tmp, store, engine) = setup(&site).await;

    let first = engine.start_run(&opts()).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    let before = dump(&store).await;
    assert_eq!(first.counts("listing").new, 1);
    assert_eq!(first.counts("bid").new, 2);
    assert_eq!(first.counts("lot").new, 1);
    assert_eq!(first.fetches, 2);
    site.fetched();

    let second = engine.start_run(&opts()).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.total().new, 0);
    assert_eq!(second.total().duplicate, 3);
    assert_eq!(second.counts("lot").duplicate, 0);
    assert_eq!(site.fetched(), vec![target("listing", "L1")]);
    assert_eq!(second.fetches, 1);
    assert_eq!(dump(&store).await, before);

    let mapper = engine.mapper();
    assert_eq!(mapper.count("listing").await.unwrap(), 1);
    assert_eq!(mapper.count("bid").await.unwrap(), 2);
    assert_eq!(mapper.count("lot").await.unwrap(), 1);
}

#[tokio::test]
async fn inline_children_link_to_their_parent() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    site.page(target("listing", "L1"), Page::Ok(l1_page()));
    site.page(target("lot", "A"), Page::Ok(lot("A")));
    let (_tmp, _store, engine) = setup(&site).await;
    engine.start_run(&opts()).await.unwrap();

    let mapper = engine.mapper();
    let l1 = mapper
        .find("listing", &DedupKey::from("L1"))
        .await
        .unwrap()
        .unwrap();
    assert!(l1.parent.is_none());

    let bids = mapper.children(&l1, "bids").unwrap().collect_all().await.unwrap();
    let amounts: Vec<_> = bids.iter().map(|b| b.get("amount").cloned()).collect();
    assert_eq!(amounts, vec![Some(Value::Real(10.0)), Some(Value::Real(12.5))]);
    assert!(bids.iter().all(|b| b.parent == l1.id));

    let lots = mapper.children(&l1, "lots").unwrap().collect_all().await.unwrap();
    assert_eq!(lots.len(), 1);
    assert_eq!(mapper.count_children(&l1, "lots").await.unwrap(), 1);
}

#[tokio::test]
async fn changed_entity_is_updated_and_walked_again() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    site.page(target("listing", "L1"), Page::Ok(l1_page()));
    site.page(target("lot", "A"), Page::Ok(lot("A")));
    let (_tmp, _store, engine) = setup(&site).await;
    engine.start_run(&opts()).await.unwrap();
    site.fetched();

    let renamed = Parsed::new(
        EntityTree::leaf(listing("L1", "Oak writing desk"))
            .with_child(bid("L1", 10.0))
            .with_child(bid("L1", 12.5))
            .with_child(bid("L1", 15.0)),
    )
    .with_target(target("lot", "A"));
    site.page(target("listing", "L1"), Page::Ok(renamed));

    let run = engine.start_run(&opts()).await.unwrap();
    assert_eq!(run.counts("listing").updated, 1);
    assert_eq!(run.counts("bid").duplicate, 2);
    assert_eq!(run.counts("bid").new, 1);
    assert_eq!(run.counts("lot").duplicate, 1);
    assert_eq!(
        site.fetched(),
        vec![target("listing", "L1"), target("lot", "A")]
    );

    let mapper = engine.mapper();
    assert_eq!(mapper.count("listing").await.unwrap(), 1);
    let l1 = mapper
        .find("listing", &DedupKey::from("L1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(l1.get("title"), Some(&Value::from("Oak writing desk")));
}

#[tokio::test]
async fn failed_child_leaves_parent_incomplete_until_next_run() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    site.page(
        target("listing", "L1"),
        Page::Ok(
            Parsed::new(listing("L1", "Oak desk"))
                .with_target(target("lot", "A"))
                .with_target(target("lot", "B")),
        ),
    );
    site.page(target("lot", "A"), Page::Broken);
    site.page(target("lot", "B"), Page::Ok(lot("B")));
    let (_tmp, store, engine) = setup(&site).await;

    let first = engine.start_run(&opts()).await.unwrap();
    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(first.counts("lot").failed, 1);
    assert_eq!(first.counts("lot").new, 1);
    assert_eq!(first.counts("listing").new, 1);
    assert_eq!(engine.state(), EngineState::Failed);

    let row = store
        .find_row(engine.handle(), "listing", &DedupKey::from("L1"))
        .await
        .unwrap()
        .unwrap();
    assert!(!row.complete);

    site.page(target("lot", "A"), Page::Ok(lot("A")));
    site.fetched();
    let second = engine.start_run(&opts()).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.counts("listing").duplicate, 1);
    assert_eq!(second.counts("lot").new, 1);
    assert_eq!(second.counts("lot").duplicate, 1);
    assert_eq!(site.fetched().len(), 3);

    let row = store
        .find_row(engine.handle(), "listing", &DedupKey::from("L1"))
        .await
        .unwrap()
        .unwrap();
    assert!(row.complete);

    let third = engine.start_run(&opts()).await.unwrap();
    assert_eq!(third.fetches, 1);
}

#[tokio::test]
async fn failing_root_does_not_stop_the_others() {
    let site = MemorySite::new(&[target("listing", "L1"), target("listing", "L2")]);
    site.page(target("listing", "L1"), Page::Ok(Parsed::new(listing("L1", "Oak desk"))));
    site.page(target("listing", "L2"), Page::Down);
    let (_tmp, store, engine) = setup(&site).await;

    let run = engine
        .start_run(&SyncOptions {
            max_retries: 2,
            ..opts()
        })
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counts("listing").new, 1);
    assert_eq!(run.counts("listing").failed, 1);
    // One attempt for L1, three for L2.
    assert_eq!(run.fetches, 4);

    let checkpoint = runs::load_checkpoint(store.pool(), "auction")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.pending, vec![target("listing", "L2")]);

    // The pending root is retried even when the site no longer lists it.
    *site.roots.lock().unwrap() = vec![target("listing", "L1")];
    site.page(target("listing", "L2"), Page::Ok(Parsed::new(listing("L2", "Pine shelf"))));
    let run = engine.start_run(&opts()).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counts("listing").new, 1);
    assert!(runs::load_checkpoint(store.pool(), "auction")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn mismatched_entity_kind_is_a_target_failure() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    site.page(target("listing", "L1"), Page::Ok(lot("A")));
    let (_tmp, _store, engine) = setup(&site).await;

    let run = engine.start_run(&opts()).await.unwrap();
    assert_eq!(run.counts("listing").failed, 1);
    assert_eq!(engine.mapper().count("lot").await.unwrap(), 0);
}

#[tokio::test]
async fn invalid_inline_child_rolls_back_whole_subtree() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    // The second bid lacks its required amount.
    site.page(
        target("listing", "L1"),
        Page::Ok(Parsed::new(
            EntityTree::leaf(listing("L1", "Oak desk"))
                .with_child(bid("L1", 10.0))
                .with_child(Entity::new("bid").with("listing_id", "L1")),
        )),
    );
    let (_tmp, _store, engine) = setup(&site).await;

    let run = engine.start_run(&opts()).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counts("listing").failed, 1);
    let mapper = engine.mapper();
    assert_eq!(mapper.count("listing").await.unwrap(), 0);
    assert_eq!(mapper.count("bid").await.unwrap(), 0);
}

#[tokio::test]
async fn redescend_kind_walks_children_of_unchanged_pages() {
    let site = MemorySite::new(&[target("index", "1")]);
    site.page(
        target("index", "1"),
        Page::Ok(
            Parsed::new(Entity::new("index").with("number", 1i64))
                .with_target(target("listing", "L1"))
                .with_target(target("listing", "L2")),
        ),
    );
    site.page(
        target("listing", "L1"),
        Page::Ok(Parsed::new(listing("L1", "Oak desk")).with_target(target("lot", "A"))),
    );
    site.page(target("listing", "L2"), Page::Ok(Parsed::new(listing("L2", "Pine shelf"))));
    site.page(target("lot", "A"), Page::Ok(lot("A")));
    let (_tmp, _store, engine) = setup(&site).await;

    engine.start_run(&opts()).await.unwrap();
    site.fetched();

    // A new listing appears on the unchanged index page.
    site.page(
        target("index", "1"),
        Page::Ok(
            Parsed::new(Entity::new("index").with("number", 1i64))
                .with_target(target("listing", "L1"))
                .with_target(target("listing", "L2"))
                .with_target(target("listing", "L3")),
        ),
    );
    site.page(target("listing", "L3"), Page::Ok(Parsed::new(listing("L3", "Walnut chair"))));

    let run = engine.start_run(&opts()).await.unwrap();
    assert_eq!(run.counts("index").duplicate, 1);
    assert_eq!(run.counts("listing").duplicate, 2);
    assert_eq!(run.counts("listing").new, 1);
    let fetched = site.fetched();
    assert_eq!(fetched.len(), 4);
    assert!(!fetched.contains(&target("lot", "A")));

    let mapper = engine.mapper();
    let index = mapper.roots("index").unwrap().collect_all().await.unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(mapper.count_children(&index[0], "listings").await.unwrap(), 3);
}

#[tokio::test]
async fn continuation_pages_are_followed_and_saved() {
    let site = MemorySite::new(&[target("index", "1")]);
    site.page(
        target("index", "1"),
        Page::Ok(Parsed::new(Entity::new("index").with("number", 1i64)).with_continuation("2")),
    );
    site.page(
        target("index", "2"),
        Page::Ok(Parsed::new(Entity::new("index").with("number", 2i64))),
    );
    let (_tmp, store, engine) = setup(&site).await;

    let run = engine.start_run(&opts()).await.unwrap();
    assert_eq!(run.counts("index").new, 2);
    let checkpoint = runs::load_checkpoint(store.pool(), "auction")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.continuation.as_deref(), Some("2"));

    engine.start_run(&opts()).await.unwrap();
    let previous = site.previous.lock().unwrap().clone();
    assert_eq!(previous.len(), 2);
    assert!(previous[0].is_none());
    assert_eq!(
        previous[1].as_ref().and_then(|p| p.continuation.clone()),
        Some("2".to_string())
    );
}

#[tokio::test]
async fn concurrent_fetches_never_duplicate_keys() {
    let roots: Vec<FetchTarget> = (0..24).map(|i| target("listing", &format!("L{}", i % 12))).collect();
    let site = MemorySite::new(&roots);
    for i in 0..12 {
        let id = format!("L{}", i);
        site.page(
            target("listing", &id),
            Page::Ok(
                Parsed::new(EntityTree::leaf(listing(&id, "Item")).with_child(bid(&id, 1.0)))
                    .with_target(target("lot", "shared")),
            ),
        );
    }
    site.page(target("lot", "shared"), Page::Ok(lot("shared")));
    let (_tmp, _store, engine) = setup(&site).await;

    let run = engine
        .start_run(&SyncOptions {
            concurrency: 6,
            ..opts()
        })
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counts("listing").new, 12);
    let mapper = engine.mapper();
    assert_eq!(mapper.count("listing").await.unwrap(), 12);
    assert_eq!(mapper.count("bid").await.unwrap(), 12);
    assert_eq!(mapper.count("lot").await.unwrap(), 1);
}

#[tokio::test]
async fn second_start_while_running_is_rejected() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    site.page(target("listing", "L1"), Page::Ok(Parsed::new(listing("L1", "Oak desk"))));
    let (_tmp, _store, engine) = setup(&site).await;
    let engine = Arc::new(engine);
    let (started, release) = site.hold_next_fetch();

    assert_eq!(engine.state(), EngineState::Idle);
    let background = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start_run(&opts()).await })
    };
    started.notified().await;

    assert_eq!(engine.state(), EngineState::Running);
    let err = engine.start_run(&opts()).await.unwrap_err();
    assert!(matches!(err, IngestError::RunAlreadyActive(ref s) if s == "auction"));

    release.notify_one();
    let run = background.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(engine.state(), EngineState::Completed);
    assert_eq!(engine.last_run().map(|r| r.id), Some(run.id));
}

#[tokio::test]
async fn cancel_stops_at_target_boundary_and_resumes() {
    let roots = [target("listing", "L1"), target("listing", "L2"), target("listing", "L3")];
    let site = MemorySite::new(&roots);
    for (id, title) in [("L1", "Oak desk"), ("L2", "Pine shelf"), ("L3", "Walnut chair")] {
        site.page(target("listing", id), Page::Ok(Parsed::new(listing(id, title))));
    }
    let (_tmp, store, engine) = setup(&site).await;
    let engine = Arc::new(engine);
    assert!(!engine.cancel());

    let (started, release) = site.hold_next_fetch();
    let background = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .start_run(&SyncOptions {
                    concurrency: 1,
                    ..opts()
                })
                .await
        })
    };
    started.notified().await;
    assert!(engine.cancel());
    release.notify_one();

    let run = background.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(engine.state(), EngineState::Cancelled);
    assert_eq!(engine.mapper().count("listing").await.unwrap(), 0);

    let checkpoint = runs::load_checkpoint(store.pool(), "auction")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.pending, roots.to_vec());

    let run = engine.start_run(&opts()).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counts("listing").new, 3);
}

#[tokio::test]
async fn stale_running_rows_are_marked_interrupted() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    site.page(target("listing", "L1"), Page::Ok(Parsed::new(listing("L1", "Oak desk"))));
    let (_tmp, store, engine) = setup(&site).await;

    let stale = SyncRun::start("auction");
    runs::record_start(store.pool(), &stale).await.unwrap();

    let run = engine.start_run(&opts()).await.unwrap();
    let history = runs::recent_runs(store.pool(), Some("auction"), 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    let old = history.iter().find(|r| r.id == stale.id).unwrap();
    assert_eq!(old.status, RunStatus::Interrupted);
    let new = history.iter().find(|r| r.id == run.id).unwrap();
    assert_eq!(new.status, RunStatus::Completed);
    assert_eq!(new.counts("listing").new, 1);
}

#[tokio::test]
async fn run_history_is_pruned_to_keep_runs() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    site.page(target("listing", "L1"), Page::Ok(Parsed::new(listing("L1", "Oak desk"))));
    let (_tmp, store, engine) = setup(&site).await;

    for _ in 0..4 {
        engine
            .start_run(&SyncOptions {
                keep_runs: 2,
                ..opts()
            })
            .await
            .unwrap();
    }
    let history = runs::recent_runs(store.pool(), Some("auction"), 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}

fn with_amount(ty: FieldType) -> EntitySchema {
    let mut schema = auction_schema();
    let bid = schema.kinds.iter_mut().find(|k| k.name == "bid").unwrap();
    bid.fields[1] = Field::new("amount", ty).required();
    schema
}

fn int_bid(listing: &str, amount: i64) -> Entity {
    Entity::new("bid")
        .with("listing_id", listing)
        .with("amount", amount)
}

#[tokio::test]
async fn widening_a_key_field_keeps_reruns_duplicate() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    site.declare(with_amount(FieldType::Integer));
    site.page(
        target("listing", "L1"),
        Page::Ok(Parsed::new(
            EntityTree::leaf(listing("L1", "Oak desk"))
                .with_child(int_bid("L1", 10))
                .with_child(int_bid("L1", 12)),
        )),
    );
    let (_tmp, store, engine) = setup(&site).await;
    assert_eq!(engine.start_run(&opts()).await.unwrap().counts("bid").new, 2);

    site.declare(with_amount(FieldType::Real));
    let engine = SyncEngine::for_site(store.clone(), site.clone() as Arc<dyn SiteType>)
        .await
        .unwrap();
    assert_eq!(engine.handle().version, 2);
    let migrated = dump(&store).await;

    let run = engine.start_run(&opts()).await.unwrap();
    assert_eq!(run.counts("bid").duplicate, 2);
    assert_eq!(run.total().new, 0);
    assert_eq!(run.total().updated, 0);
    assert_eq!(dump(&store).await, migrated);

    // Real to text, with the source now reporting reals.
    site.declare(with_amount(FieldType::Text));
    site.page(
        target("listing", "L1"),
        Page::Ok(Parsed::new(
            EntityTree::leaf(listing("L1", "Oak desk"))
                .with_child(bid("L1", 10.0))
                .with_child(bid("L1", 12.0)),
        )),
    );
    let engine = SyncEngine::for_site(store.clone(), site.clone() as Arc<dyn SiteType>)
        .await
        .unwrap();
    assert_eq!(engine.handle().version, 3);
    let migrated = dump(&store).await;

    let run = engine.start_run(&opts()).await.unwrap();
    assert_eq!(run.counts("bid").duplicate, 2);
    assert_eq!(run.total().new, 0);
    assert_eq!(run.total().updated, 0);
    assert_eq!(dump(&store).await, migrated);

    let mapper = engine.mapper();
    assert_eq!(mapper.count("bid").await.unwrap(), 2);
    let amounts: Vec<_> = mapper
        .all("bid")
        .unwrap()
        .collect_all()
        .await
        .unwrap()
        .iter()
        .map(|b| b.get("amount").cloned())
        .collect();
    assert_eq!(
        amounts,
        vec![Some(Value::from("10")), Some(Value::from("12"))]
    );
}

#[tokio::test]
async fn blob_keys_keep_same_length_contents_apart() {
    let site = MemorySite::new(&[target("image", "a"), target("image", "b")]);
    site.declare(
        auction_schema().kind(
            EntityKind::new("image")
                .field(Field::blob("data").required())
                .dedup_key(["data"]),
        ),
    );
    for (locator, data) in [("a", vec![1u8, 2, 3, 4]), ("b", vec![9u8, 9, 9, 9])] {
        site.page(
            target("image", locator),
            Page::Ok(Parsed::new(Entity::new("image").with("data", data))),
        );
    }
    let (_tmp, _store, engine) = setup(&site).await;

    let first = engine.start_run(&opts()).await.unwrap();
    assert_eq!(first.counts("image").new, 2);
    assert_eq!(first.counts("image").updated, 0);
    assert_eq!(engine.mapper().count("image").await.unwrap(), 2);

    let second = engine.start_run(&opts()).await.unwrap();
    assert_eq!(second.counts("image").duplicate, 2);
    let stored = engine
        .mapper()
        .find("image", &DedupKey::from("09090909"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.get("data"), Some(&Value::Blob(vec![9, 9, 9, 9])));
}

#[tokio::test]
async fn unrecorded_run_leaves_a_failed_summary() {
    let site = MemorySite::new(&[target("listing", "L1")]);
    let (_tmp, store, engine) = setup(&site).await;
    store.close().await;

    assert!(engine.start_run(&opts()).await.is_err());
    assert_eq!(engine.state(), EngineState::Failed);
    let last = engine.last_run().unwrap();
    assert_eq!(last.status, RunStatus::Failed);
    assert!(last.error.is_some());
    assert!(last.finished_at.is_some());
}
