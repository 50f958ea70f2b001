use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use harvest_common::backoff::{BackoffPolicy, RetryError};
use harvest_common::checkpoint::{CheckpointError, CheckpointStore, PartitionCursor};
use harvest_common::health::{HealthHandle, HealthRegistry};
use harvest_common::records::SearchItem;
use harvest_common::testing::{MemoryItemStore, MemoryQueue};
use harvest_common::upstream::UpstreamError;
use harvest_crawler::crawl::{CrawlError, Crawler};
use harvest_crawler::search::PageSource;

type PageResult = Result<Vec<SearchItem>, UpstreamError>;

/// Answers scripted pages in order per (partition, page); unscripted pages are empty.
#[derive(Default)]
struct ScriptedSource {
    pages: Mutex<HashMap<(String, u32), VecDeque<PageResult>>>,
    requests: Mutex<Vec<(String, u32)>>,
}

impl ScriptedSource {
    fn page(self, partition: &str, page: u32, ids: &[&str]) -> Self {
        self.respond(partition, page, Ok(ids.iter().map(|id| SearchItem::new(id)).collect()))
    }

    fn failing(self, partition: &str, page: u32, times: usize) -> Self {
        let mut source = self;
        for _ in 0..times {
            source = source.respond(partition, page, Err(UpstreamError::transient("503")));
        }
        source
    }

    fn respond(self, partition: &str, page: u32, result: PageResult) -> Self {
        self.pages
            .lock()
            .unwrap()
            .entry((partition.to_owned(), page))
            .or_default()
            .push_back(result);
        self
    }

    fn requests(&self) -> Vec<(String, u32)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_page(&self, partition_key: &str, page: u32) -> PageResult {
        self.requests
            .lock()
            .unwrap()
            .push((partition_key.to_owned(), page));

        let mut pages = self.pages.lock().unwrap();
        let key = (partition_key.to_owned(), page);
        match pages.get_mut(&key) {
            // The last scripted answer repeats.
            Some(answers) if answers.len() > 1 => answers.pop_front().unwrap(),
            Some(answers) => answers.front().cloned().unwrap(),
            None => Ok(Vec::new()),
        }
    }
}

/// Keeps every saved snapshot.
#[derive(Default)]
struct RecordingCheckpoints {
    current: Mutex<Option<PartitionCursor>>,
    saves: Mutex<Vec<PartitionCursor>>,
}

impl RecordingCheckpoints {
    fn saves(&self) -> Vec<PartitionCursor> {
        self.saves.lock().unwrap().clone()
    }

    fn current(&self) -> Option<PartitionCursor> {
        self.current.lock().unwrap().clone()
    }

    fn restore(&self, cursor: PartitionCursor) {
        *self.current.lock().unwrap() = Some(cursor);
    }
}

#[async_trait]
impl CheckpointStore for RecordingCheckpoints {
    async fn load(&self) -> Result<Option<PartitionCursor>, CheckpointError> {
        Ok(self.current())
    }

    async fn save(&self, cursor: &PartitionCursor) -> Result<(), CheckpointError> {
        self.restore(cursor.clone());
        self.saves.lock().unwrap().push(cursor.clone());
        Ok(())
    }

    async fn reset(&self) -> Result<(), CheckpointError> {
        *self.current.lock().unwrap() = None;
        Ok(())
    }
}

struct Harness {
    store: MemoryItemStore,
    queue: MemoryQueue,
    checkpoints: RecordingCheckpoints,
    liveness: HealthHandle,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: MemoryItemStore::default(),
            queue: MemoryQueue::new("profile_requests"),
            checkpoints: RecordingCheckpoints::default(),
            liveness: HealthRegistry::new("liveness").register("crawler", Duration::from_secs(60)),
        }
    }

    fn crawler<'a>(&'a self, source: &'a ScriptedSource, partitions: &[&str]) -> Crawler<'a> {
        let policy = BackoffPolicy::build(Duration::from_millis(100))
            .maximum_jitter(Duration::ZERO)
            .max_attempts(2)
            .provide();

        Crawler::new(
            partitions.iter().map(|p| p.to_string()).collect(),
            source,
            &self.store,
            &self.queue,
            &self.checkpoints,
            policy.clone(),
            policy,
            &self.liveness,
        )
    }

    fn published_ids(&self) -> Vec<String> {
        self.queue
            .published()
            .iter()
            .filter_map(|p| p["source_id"].as_str().map(str::to_owned))
            .collect()
    }
}

#[tokio::test(start_paused = true)]
async fn test_partition_completes_on_empty_page_and_next_starts_at_zero() {
    let harness = Harness::new();
    let source = ScriptedSource::default().page("A", 0, &["1", "2"]);

    let summary = harness
        .crawler(&source, &["A", "B"])
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.emitted, 2);
    assert!(!summary.interrupted);
    assert_eq!(
        harness.queue.published(),
        vec![json!({"source_id": "1"}), json!({"source_id": "2"})]
    );
    assert_eq!(
        source.requests(),
        vec![("A".to_owned(), 0), ("A".to_owned(), 1), ("B".to_owned(), 0)]
    );

    let saves = harness.checkpoints.saves();
    let a_done = saves
        .iter()
        .find(|c| c.is_completed("A") && !c.is_completed("B"))
        .unwrap();
    assert_eq!(a_done.partition_key, "A");
    assert_eq!(a_done.page_index, 1);
    assert!(a_done.has_emitted("1") && a_done.has_emitted("2"));

    let last = harness.checkpoints.current().unwrap();
    assert_eq!(last.partition_key, "B");
    assert_eq!(last.page_index, 0);
    assert!(last.is_completed("B"));

    let stored = harness.store.get("1").unwrap();
    assert_eq!(stored.partition_key, "A");
    assert!(stored.enqueued);
}

#[tokio::test(start_paused = true)]
async fn test_checkpointed_page_indices_never_decrease_within_a_partition() {
    let harness = Harness::new();
    let source = ScriptedSource::default()
        .page("A", 0, &["1", "2"])
        .page("A", 1, &["3"])
        .page("A", 2, &["4", "5"])
        .page("B", 0, &["6"]);

    harness
        .crawler(&source, &["A", "B"])
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let mut last_page: HashMap<String, u32> = HashMap::new();
    for cursor in harness.checkpoints.saves() {
        let previous = last_page.insert(cursor.partition_key.clone(), cursor.page_index);
        if let Some(previous) = previous {
            assert!(cursor.page_index >= previous, "page went back in {cursor:?}");
        }
    }
    assert_eq!(last_page.get("A"), Some(&3));
    assert_eq!(harness.published_ids(), vec!["1", "2", "3", "4", "5", "6"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_page_halts_at_the_failing_page() {
    let harness = Harness::new();
    let source = ScriptedSource::default()
        .page("A", 0, &["1"])
        .failing("A", 1, 1);

    let error = harness
        .crawler(&source, &["A", "B"])
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    match error {
        CrawlError::Fetch {
            partition,
            page,
            error: RetryError::Exhausted { attempts, .. },
        } => {
            assert_eq!(partition, "A");
            assert_eq!(page, 1);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let cursor = harness.checkpoints.current().unwrap();
    assert_eq!(cursor.partition_key, "A");
    assert_eq!(cursor.page_index, 1);
    assert!(cursor.completed_partitions.is_empty());
    assert!(!source.requests().iter().any(|(p, _)| p == "B"));

    // A restart retries the same page.
    let recovered = ScriptedSource::default().page("A", 1, &["2"]);
    harness
        .crawler(&recovered, &["A", "B"])
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(recovered.requests().first(), Some(&("A".to_owned(), 1)));
    assert_eq!(harness.published_ids(), vec!["1", "2"]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_does_not_re_emit_items() {
    let harness = Harness::new();
    let source = ScriptedSource::default()
        .page("A", 0, &["1", "2"])
        .failing("A", 1, 1);
    assert!(harness
        .crawler(&source, &["A"])
        .run(&CancellationToken::new())
        .await
        .is_err());
    assert_eq!(harness.published_ids(), vec!["1", "2"]);

    // Even from a stale cursor, the stored enqueue marks keep 1 and 2 from going out again.
    harness.checkpoints.restore(PartitionCursor::start("A"));
    let replay = ScriptedSource::default()
        .page("A", 0, &["1", "2", "3"])
        .page("A", 1, &["2", "4"]);
    let summary = harness
        .crawler(&replay, &["A"])
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.emitted, 2);
    assert_eq!(harness.published_ids(), vec!["1", "2", "3", "4"]);
}

#[tokio::test(start_paused = true)]
async fn test_item_recorded_but_not_published_is_emitted_after_restart() {
    let harness = Harness::new();
    let source = ScriptedSource::default().page("A", 0, &["1", "2"]);
    harness.queue.fail_next_publishes(2);

    let error = harness
        .crawler(&source, &["A"])
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        CrawlError::Publish { ref source_id, page: 0, .. } if source_id == "1"
    ));
    let stored = harness.store.get("1").unwrap();
    assert!(!stored.enqueued);
    assert_eq!(harness.checkpoints.current().unwrap().page_index, 0);

    harness
        .crawler(&source, &["A"])
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(harness.published_ids(), vec!["1", "2"]);
    assert!(harness.store.get("1").unwrap().enqueued);
}

#[tokio::test(start_paused = true)]
async fn test_completed_partitions_are_skipped_on_resume() {
    let harness = Harness::new();
    let mut cursor = PartitionCursor::start("A");
    cursor.complete_partition();
    harness.checkpoints.restore(cursor);

    let source = ScriptedSource::default()
        .page("A", 0, &["1"])
        .page("B", 0, &["2"]);
    harness
        .crawler(&source, &["A", "B"])
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert!(!source.requests().iter().any(|(p, _)| p == "A"));
    assert_eq!(harness.published_ids(), vec!["2"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_crawl_stops_before_the_next_page() {
    let harness = Harness::new();
    let source = ScriptedSource::default().page("A", 0, &["1"]);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let summary = harness
        .crawler(&source, &["A"])
        .run(&shutdown)
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert!(source.requests().is_empty());
    assert!(harness.queue.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_halts_without_publishing() {
    let harness = Harness::new();
    harness.store.set_failing(true);
    let source = ScriptedSource::default().page("A", 0, &["1"]);

    let error = harness
        .crawler(&source, &["A"])
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(error, CrawlError::Store { page: 0, .. }));
    assert!(harness.queue.published().is_empty());
    assert_eq!(harness.checkpoints.current().unwrap().page_index, 0);
}
