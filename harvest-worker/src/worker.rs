//! The dispatch loop of an enrichment stage worker.
use std::time;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use harvest_common::backoff::BackoffPolicy;
use harvest_common::buffer::{BatchBuffer, BatchSink, FlushError};
use harvest_common::health::{ComponentStatus, HealthHandle};
use harvest_common::queue::{publish_with_backoff, Consumer, Delivery, Publisher};
use harvest_common::records::{EnrichmentRequest, Enriched};
use harvest_common::shutdown::{final_flush, DrainMonitor, StopReason};

use crate::error::WorkerError;
use crate::lookup::{enrich, Lookup};

/// Knobs shared by every worker of a stage.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    /// Wait between polls of an empty queue.
    pub poll_interval: time::Duration,
    pub lookup_policy: BackoffPolicy,
    /// Used for the forced flush on exit and to pace redelivery after a failed flush.
    pub flush_policy: BackoffPolicy,
    pub forward_policy: BackoffPolicy,
    pub drain: DrainMonitor,
}

/// What became of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Handled,
    Rejected,
    /// Not acknowledged because the buffer could not be flushed. The queue delivers it again.
    Withheld,
}

/// Takes one message at a time from `consumer`, enriches it through `lookup` and buffers the
/// result for `sink`. Flushed populated records are forwarded to `forward_to`, if set.
pub struct StageWorker<'a, C, L, S>
where
    C: Consumer,
    L: Lookup,
    S: BatchSink<Enriched<L::Output>> + ?Sized,
{
    name: String,
    consumer: &'a C,
    lookup: &'a L,
    sink: &'a S,
    forward_to: Option<&'a dyn Publisher>,
    settings: WorkerSettings,
    liveness: HealthHandle,
}

impl<'a, C, L, S> StageWorker<'a, C, L, S>
where
    C: Consumer,
    L: Lookup,
    S: BatchSink<Enriched<L::Output>> + ?Sized,
{
    pub fn new(
        name: &str,
        consumer: &'a C,
        lookup: &'a L,
        sink: &'a S,
        forward_to: Option<&'a dyn Publisher>,
        settings: WorkerSettings,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            consumer,
            lookup,
            sink,
            forward_to,
            settings,
            liveness,
        }
    }

    /// Process messages until `shutdown` is cancelled or the source queue drains, then force
    /// the buffer out. A drain observed by this worker cancels `shutdown` for the whole stage.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<StopReason, WorkerError> {
        let mut buffer = BatchBuffer::new(self.settings.batch_size);
        let reason = self.dispatch(&mut buffer, shutdown).await;

        match final_flush(&mut buffer, self.sink, &self.settings.flush_policy).await {
            Ok(flushed) => self.forward(&flushed).await,
            Err(error) => {
                self.liveness.report_status(ComponentStatus::Unhealthy);
                return Err(WorkerError::FinalFlush {
                    worker: self.name.clone(),
                    unsaved: buffer.len(),
                    error,
                });
            }
        }

        self.liveness.report_status(ComponentStatus::Finished);
        info!(worker = %self.name, reason = ?reason, "worker stopped");
        Ok(reason)
    }

    async fn dispatch(
        &self,
        buffer: &mut BatchBuffer<Enriched<L::Output>>,
        shutdown: &CancellationToken,
    ) -> StopReason {
        let mut withheld: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return StopReason::Cancelled;
            }

            let delivery = match self.consumer.receive(&self.name).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    self.liveness.report_healthy();
                    self.pause(self.settings.poll_interval, shutdown).await;
                    continue;
                }
                Err(e) => {
                    // Fails the liveness check until the queue answers again.
                    self.liveness.report_status(ComponentStatus::Unhealthy);
                    warn!(
                        worker = %self.name,
                        queue = self.consumer.name(),
                        "receive failed: {}", e
                    );
                    metrics::counter!("harvest_queue_receive_errors_total").increment(1);
                    self.pause(self.settings.poll_interval, shutdown).await;
                    continue;
                }
            };
            self.liveness.report_healthy();

            match self.handle(delivery, buffer).await {
                Disposition::Withheld => {
                    let delay = self.settings.flush_policy.base_interval(withheld);
                    withheld = withheld.saturating_add(1);
                    self.pause(delay, shutdown).await;
                    continue;
                }
                Disposition::Handled | Disposition::Rejected => withheld = 0,
            }

            match self.settings.drain.is_drained(self.consumer).await {
                Ok(true) => {
                    info!(
                        worker = %self.name,
                        queue = self.consumer.name(),
                        "source queue drained, stopping stage"
                    );
                    shutdown.cancel();
                    return StopReason::Drained;
                }
                Ok(false) => {}
                Err(e) => warn!(worker = %self.name, "drain check failed: {}", e),
            }
        }
    }

    /// Enrich one delivery and buffer the result. The delivery is acknowledged only once its
    /// record is buffered and any flush it triggered succeeded.
    async fn handle(
        &self,
        delivery: C::Message,
        buffer: &mut BatchBuffer<Enriched<L::Output>>,
    ) -> Disposition {
        let Some(request) = EnrichmentRequest::decode(delivery.payload()) else {
            warn!(
                worker = %self.name,
                message_id = delivery.id(),
                "rejecting message without a source id"
            );
            metrics::counter!("harvest_messages_rejected_total").increment(1);
            if let Err(e) = delivery.reject("payload carries no source id").await {
                warn!(worker = %self.name, "reject failed: {}", e);
            }
            return Disposition::Rejected;
        };

        // Only full after an earlier flush failed. No lookup is spent while storage is down.
        if buffer.is_full() && self.flush(buffer).await.is_err() {
            return Disposition::Withheld;
        }

        let record = enrich(self.lookup, &self.settings.lookup_policy, &request).await;
        if buffer.try_push(record).is_err() {
            return Disposition::Withheld;
        }
        if buffer.is_full() && self.flush(buffer).await.is_err() {
            return Disposition::Withheld;
        }

        let message_id = delivery.id();
        if let Err(e) = delivery.ack().await {
            // The record is buffered already; the redelivery replaces it.
            warn!(worker = %self.name, message_id, "ack failed: {}", e);
        }
        Disposition::Handled
    }

    async fn flush(
        &self,
        buffer: &mut BatchBuffer<Enriched<L::Output>>,
    ) -> Result<(), FlushError> {
        match buffer.flush(self.sink, false).await {
            Ok(written) => {
                info!(worker = %self.name, records = written.len(), "flushed batch");
                self.forward(&written).await;
                Ok(())
            }
            Err(e) => {
                error!(
                    worker = %self.name,
                    buffered = buffer.len(),
                    "flush failed, withholding acknowledgement: {}", e
                );
                Err(e)
            }
        }
    }

    /// Publish the next stage's requests for stored, populated records.
    async fn forward(&self, records: &[Enriched<L::Output>]) {
        let Some(publisher) = self.forward_to else {
            return;
        };

        for request in records
            .iter()
            .filter_map(Enriched::populated)
            .filter_map(|record| self.lookup.forward(record))
        {
            if let Err(e) =
                publish_with_backoff(publisher, &request, &self.settings.forward_policy).await
            {
                error!(
                    worker = %self.name,
                    source_id = %request.source_id,
                    "could not forward to the next stage: {}", e
                );
                metrics::counter!("harvest_forward_failures_total").increment(1);
            }
        }
    }

    async fn pause(&self, delay: time::Duration, shutdown: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {}
        }
    }
}

/// Run every worker of a stage until all of them stopped. Fails if any worker lost records.
pub async fn run_workers<C, L, S>(
    workers: &[StageWorker<'_, C, L, S>],
    shutdown: &CancellationToken,
) -> Result<StopReason, WorkerError>
where
    C: Consumer,
    L: Lookup,
    S: BatchSink<Enriched<L::Output>> + ?Sized,
{
    let results = join_all(workers.iter().map(|worker| worker.run(shutdown))).await;

    let mut reason = StopReason::Cancelled;
    let mut failure = None;
    for result in results {
        match result {
            Ok(StopReason::Drained) => reason = StopReason::Drained,
            Ok(StopReason::Cancelled) => {}
            Err(e) => {
                error!("{}", e);
                failure.get_or_insert(e);
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(reason),
    }
}
