//! Lifecycle and error tracing events.
//!
//! Pools report structured events to an [`EventSink`]. The sink is an
//! opaque collaborator: it is not required to be reliable or ordered, and
//! it must never block the dispatch path for long. The default sink
//! forwards everything to the `log` facade.

use log::{debug, error, info, trace, warn};

/// A structured lifecycle or error event emitted by a pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A pool finished construction and spawned its permanent workers.
    Started {
        /// Pool name.
        pool: String,
        /// Configured minimum worker count.
        min_threads: usize,
        /// Configured maximum worker count.
        max_threads: usize,
    },
    /// Cancellation was requested.
    Cancelled {
        /// Pool name.
        pool: String,
        /// Workers still live at the time of cancellation.
        live_workers: usize,
    },
    /// A worker thread entered its dispatch loop.
    WorkerStarted {
        /// Worker name.
        worker: String,
    },
    /// A worker thread left its dispatch loop and unregistered.
    WorkerExited {
        /// Worker name.
        worker: String,
    },
    /// A dedicated-queue pool routed a submission to a worker.
    WorkerSelected {
        /// Worker name.
        worker: String,
        /// Items outstanding on that worker at selection time.
        outstanding: usize,
    },
    /// A dedicated-queue pool failed to hand an item to a worker
    /// (the worker was exiting); the submission is retried elsewhere.
    AssignmentFailed {
        /// Worker name.
        worker: String,
        /// Items outstanding on that worker at failure time.
        outstanding: usize,
    },
    /// The worker population crossed the advisory high-watermark.
    SizeWarning {
        /// Pool name.
        pool: String,
        /// Current worker count.
        current: usize,
        /// Configured maximum.
        max_threads: usize,
    },
    /// A work item escaped with a panic. The worker survives.
    WorkItemFailed {
        /// Rendered panic message.
        message: String,
    },
    /// An internal pool error (spawn failure, registry inconsistency).
    Failure {
        /// Rendered error message.
        message: String,
    },
}

/// Consumer of pool events.
pub trait EventSink: Send + Sync {
    /// Receives one event. Called from producer and worker threads.
    fn event(&self, event: PoolEvent);
}

/// Default sink: forwards events to the `log` facade.
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Started {
                pool,
                min_threads,
                max_threads,
            } => info!("{pool}: started, {min_threads}..{max_threads} workers"),
            PoolEvent::Cancelled { pool, live_workers } => {
                info!("{pool}: cancelled with {live_workers} live workers")
            }
            PoolEvent::WorkerStarted { worker } => debug!("{worker}: started"),
            PoolEvent::WorkerExited { worker } => debug!("{worker}: exited"),
            PoolEvent::WorkerSelected {
                worker,
                outstanding,
            } => trace!("{worker}: selected ({outstanding} outstanding)"),
            PoolEvent::AssignmentFailed {
                worker,
                outstanding,
            } => debug!("{worker}: assignment failed ({outstanding} outstanding)"),
            PoolEvent::SizeWarning {
                pool,
                current,
                max_threads,
            } => warn!("{pool}: {current} workers, nearing the limit of {max_threads}"),
            PoolEvent::WorkItemFailed { message } => {
                error!("work item panicked: {message}")
            }
            PoolEvent::Failure { message } => error!("pool failure: {message}"),
        }
    }
}
