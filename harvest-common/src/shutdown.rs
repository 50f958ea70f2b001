//! # Shutdown
//!
//! The two ways a stage stops: its source queue drains, or the process is asked to terminate.
//! Both end in the same forced flush of the worker's buffer.
use std::time;

use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::buffer::{BatchBuffer, BatchSink, FlushError, Keyed};
use crate::queue::{Consumer, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The source queue was observed empty.
    Drained,
    /// The shared token was cancelled, by a signal or by another worker.
    Cancelled,
}

pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

/// Cancel `token` when a termination signal arrives. Returns once either happens.
pub fn spawn_signal_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown_signal() => {
                info!("shutdown requested, finishing in-flight work");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

/// Decides when a consumer's source queue counts as drained.
#[derive(Debug, Clone)]
pub struct DrainMonitor {
    enabled: bool,
    /// Wait before confirming an empty queue. Zero checks once.
    quiescence: time::Duration,
}

impl DrainMonitor {
    pub fn new(enabled: bool, quiescence: time::Duration) -> Self {
        Self {
            enabled,
            quiescence,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, time::Duration::ZERO)
    }

    /// True only if `consumer` has exactly zero undelivered messages, and still has none after
    /// the quiescence delay. A message published in between keeps the stage running.
    pub async fn is_drained<C: Consumer + ?Sized>(&self, consumer: &C) -> Result<bool, QueueError> {
        if !self.enabled || consumer.pending().await? != 0 {
            return Ok(false);
        }

        if self.quiescence.is_zero() {
            return Ok(true);
        }

        tokio::time::sleep(self.quiescence).await;
        let drained = consumer.pending().await? == 0;
        if !drained {
            info!(queue = consumer.name(), "queue refilled during quiescence, continuing");
        }
        Ok(drained)
    }
}

/// Forced flush run before a worker exits, retried under `policy`.
///
/// A no-op for an empty buffer. When every attempt fails the unsaved keys are logged and the
/// error returned, so the process can exit non-zero.
pub async fn final_flush<T, S>(
    buffer: &mut BatchBuffer<T>,
    sink: &S,
    policy: &BackoffPolicy,
) -> Result<Vec<T>, FlushError>
where
    T: Keyed,
    S: BatchSink<T> + ?Sized,
{
    let mut attempt = 0;
    loop {
        match buffer.flush(sink, true).await {
            Ok(written) => return Ok(written),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    error!(
                        attempts = attempt,
                        unsaved = ?buffer.keys(),
                        "final flush failed: {}", e
                    );
                    return Err(e);
                }
                let delay = policy.base_interval(attempt - 1);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "final flush failed: {}", e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
