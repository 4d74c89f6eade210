//! Shared write queue between producers and database workers.
//!
//! Producers hold cheap [`WriteQueue`] clones and enqueue without blocking.
//! Workers share one [`JobReceiver`]; each job is handed to exactly one of
//! them. The queue is unbounded: backpressure is reported, never enforced.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

use super::batch::Batch;
use crate::model::Entity;
use crate::observability::metrics::record_queue_depth;

/// Error returned when submitting to a queue whose workers are gone.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("write queue is closed")]
    Closed,
}

/// Message delivered to a worker.
#[derive(Debug)]
pub enum QueueMessage {
    /// Row set to upsert
    Job(Job),
    /// Stop after finishing everything enqueued before this message
    Shutdown,
}

/// A queued row set plus its depth accounting.
///
/// Dropping the job marks it complete, however the worker exits.
#[derive(Debug)]
pub struct Job {
    batch: Batch,
    _guard: DepthGuard,
}

impl Job {
    pub fn batch(&self) -> &Batch {
        &self.batch
    }
}

#[derive(Debug)]
struct DepthGuard {
    stats: Arc<QueueStats>,
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        let depth = self.stats.depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        record_queue_depth(depth, self.stats.max_depth.load(Ordering::Acquire));
    }
}

#[derive(Debug, Default)]
struct QueueStats {
    depth: AtomicUsize,
    max_depth: AtomicUsize,
}

/// Producer handle for the write queue.
#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    stats: Arc<QueueStats>,
}

impl WriteQueue {
    /// Enqueue a row set. Never blocks and never drops.
    pub fn submit(&self, batch: Batch) -> Result<(), QueueError> {
        if batch.is_empty() {
            return Ok(());
        }

        let depth = self.stats.depth.fetch_add(1, Ordering::AcqRel) + 1;
        let max_depth = self.stats.max_depth.fetch_max(depth, Ordering::AcqRel).max(depth);
        let job = Job {
            batch,
            _guard: DepthGuard {
                stats: Arc::clone(&self.stats),
            },
        };
        record_queue_depth(depth, max_depth);

        // On failure the returned message drops its guard, undoing the increment.
        self.tx
            .send(QueueMessage::Job(job))
            .map_err(|_| QueueError::Closed)
    }

    /// Enqueue typed records as one row set.
    pub fn submit_entities<T, I>(&self, entities: I) -> Result<(), QueueError>
    where
        T: Entity,
        I: IntoIterator<Item = T>,
    {
        self.submit(Batch::from_entities(entities))
    }

    /// Jobs submitted and not yet completed (queued or in progress).
    pub fn depth(&self) -> usize {
        self.stats.depth.load(Ordering::Acquire)
    }

    /// Highest depth seen since the queue was created.
    pub fn max_depth(&self) -> usize {
        self.stats.max_depth.load(Ordering::Acquire)
    }

    /// Enqueue one stop message per worker behind all pending jobs.
    pub fn shutdown(&self, workers: usize) {
        for _ in 0..workers {
            if self.tx.send(QueueMessage::Shutdown).is_err() {
                break;
            }
        }
    }
}

/// Consumer side shared by every worker.
#[derive(Debug, Clone)]
pub struct JobReceiver {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueueMessage>>>,
    stats: Arc<QueueStats>,
}

impl JobReceiver {
    /// Jobs submitted and not yet completed.
    pub fn depth(&self) -> usize {
        self.stats.depth.load(Ordering::Acquire)
    }

    /// Block the calling thread until a message is available.
    ///
    /// Returns `None` once every producer handle is dropped and the queue
    /// is drained. Must not be called from inside an async runtime.
    pub fn recv_blocking(&self) -> Option<QueueMessage> {
        let mut rx = match self.rx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rx.blocking_recv()
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&self) -> Option<QueueMessage> {
        let mut rx = match self.rx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rx.try_recv().ok()
    }
}

/// Create a write queue and the receiver its workers share.
pub fn write_queue() -> (WriteQueue, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(QueueStats::default());
    (
        WriteQueue {
            tx,
            stats: Arc::clone(&stats),
        },
        JobReceiver {
            rx: Arc::new(Mutex::new(rx)),
            stats,
        },
    )
}
