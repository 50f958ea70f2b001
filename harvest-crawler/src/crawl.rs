//! The crawl stage: partitions in order, pages in order, a checkpoint after every page.
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use harvest_common::backoff::{retry_with_backoff, BackoffPolicy, RetryError};
use harvest_common::checkpoint::{CheckpointError, CheckpointStore, PartitionCursor};
use harvest_common::dedup::DedupGuard;
use harvest_common::health::HealthHandle;
use harvest_common::queue::{publish_with_backoff, Publisher, QueueError};
use harvest_common::records::{EnrichmentRequest, SearchItem};
use harvest_common::storage::{ItemStore, StoreError};

use crate::search::PageSource;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("partition {partition} halted at page {page}: {error}")]
    Fetch {
        partition: String,
        page: u32,
        error: RetryError,
    },
    #[error("partition {partition} halted at page {page}: {error}")]
    Store {
        partition: String,
        page: u32,
        error: StoreError,
    },
    #[error("partition {partition} halted at page {page}, could not publish {source_id}: {error}")]
    Publish {
        partition: String,
        page: u32,
        source_id: String,
        error: QueueError,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub pages: usize,
    pub emitted: usize,
    /// The crawl was stopped by the shutdown token before every partition completed.
    pub interrupted: bool,
}

pub struct Crawler<'a> {
    partitions: Vec<String>,
    source: &'a dyn PageSource,
    store: &'a dyn ItemStore,
    queue: &'a dyn Publisher,
    checkpoints: &'a dyn CheckpointStore,
    search_policy: BackoffPolicy,
    publish_policy: BackoffPolicy,
    liveness: &'a HealthHandle,
}

impl<'a> Crawler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partitions: Vec<String>,
        source: &'a dyn PageSource,
        store: &'a dyn ItemStore,
        queue: &'a dyn Publisher,
        checkpoints: &'a dyn CheckpointStore,
        search_policy: BackoffPolicy,
        publish_policy: BackoffPolicy,
        liveness: &'a HealthHandle,
    ) -> Self {
        Self {
            partitions,
            source,
            store,
            queue,
            checkpoints,
            search_policy,
            publish_policy,
            liveness,
        }
    }

    async fn load_cursor(&self) -> Result<PartitionCursor, CrawlError> {
        match self.checkpoints.load().await? {
            Some(cursor) => {
                info!(
                    partition = %cursor.partition_key,
                    page = cursor.page_index,
                    emitted = cursor.emitted_ids.len(),
                    completed = cursor.completed_partitions.len(),
                    "resuming crawl from checkpoint"
                );
                Ok(cursor)
            }
            None => {
                let first = self.partitions.first().map(String::as_str).unwrap_or_default();
                Ok(PartitionCursor::start(first))
            }
        }
    }

    /// Crawl every partition not yet completed, resuming from the stored checkpoint.
    ///
    /// `shutdown` is observed between pages. A page that cannot be fetched, recorded or
    /// published halts the crawl with the checkpoint still pointing at that page.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<CrawlSummary, CrawlError> {
        let mut cursor = self.load_cursor().await?;
        let mut summary = CrawlSummary::default();

        for partition in &self.partitions {
            if cursor.is_completed(partition) {
                continue;
            }
            cursor.enter_partition(partition);
            info!(partition = %partition, page = cursor.page_index, "crawling partition");

            loop {
                if shutdown.is_cancelled() {
                    info!(partition = %partition, page = cursor.page_index, "crawl interrupted");
                    summary.interrupted = true;
                    return Ok(summary);
                }
                self.liveness.report_healthy();

                let page = cursor.page_index;
                let items = match retry_with_backoff(&self.search_policy, "search", || {
                    self.source.fetch_page(partition, page)
                })
                .await
                {
                    Ok(items) => items,
                    Err(error) => {
                        self.checkpoints.save(&cursor).await?;
                        error!(partition = %partition, page, "search failed: {}", error);
                        return Err(CrawlError::Fetch {
                            partition: partition.clone(),
                            page,
                            error,
                        });
                    }
                };
                summary.pages += 1;
                metrics::counter!("harvest_pages_fetched_total").increment(1);

                if items.is_empty() {
                    cursor.complete_partition();
                    self.checkpoints.save(&cursor).await?;
                    info!(partition = %partition, page, "partition complete");
                    break;
                }

                let emitted = self.emit_page(&mut cursor, items).await;
                match emitted {
                    Ok(count) => {
                        summary.emitted += count;
                        info!(partition = %partition, page, emitted = count, "page processed");
                    }
                    Err(e) => {
                        // Whatever was published before the failure is in the cursor already.
                        self.checkpoints.save(&cursor).await?;
                        error!(partition = %partition, page, "{}", e);
                        return Err(e);
                    }
                }

                cursor.advance_page();
                self.checkpoints.save(&cursor).await?;
            }
        }

        Ok(summary)
    }

    /// Record and publish the unseen items of one page, in page order.
    async fn emit_page(
        &self,
        cursor: &mut PartitionCursor,
        items: Vec<SearchItem>,
    ) -> Result<usize, CrawlError> {
        let partition = cursor.partition_key.clone();
        let page = cursor.page_index;
        let store_error = |error| CrawlError::Store {
            partition: partition.clone(),
            page,
            error,
        };

        let found = items.len();
        let unseen = DedupGuard::new(self.store)
            .filter_unseen(cursor, items)
            .await
            .map_err(store_error)?;
        if unseen.len() < found {
            metrics::counter!("harvest_items_duplicate_total")
                .increment((found - unseen.len()) as u64);
        }
        if unseen.is_empty() {
            return Ok(0);
        }

        // Durable first: an item recorded but never published is picked up again on restart.
        self.store
            .record_items(&partition, &unseen)
            .await
            .map_err(store_error)?;

        let mut published = Vec::with_capacity(unseen.len());
        let mut failure = None;
        for item in &unseen {
            let request = EnrichmentRequest::new(&item.id);
            match publish_with_backoff(self.queue, &request, &self.publish_policy).await {
                Ok(()) => published.push(item.id.clone()),
                Err(error) => {
                    warn!(partition = %partition, page, source_id = %item.id, "publish failed");
                    failure = Some(CrawlError::Publish {
                        partition: partition.clone(),
                        page,
                        source_id: item.id.clone(),
                        error,
                    });
                    break;
                }
            }
        }

        let marked = self.store.mark_enqueued(&published).await;
        for id in &published {
            cursor.mark_emitted(id);
        }
        metrics::counter!("harvest_items_emitted_total").increment(published.len() as u64);

        if let Some(failure) = failure {
            return Err(failure);
        }
        marked.map_err(store_error)?;

        Ok(published.len())
    }
}
