//! Dispatcher pools: the shared contract and the per-variant strategies.
//!
//! All three pools accept work from arbitrary producer threads and run it
//! on a bounded population of long-lived workers. They differ only in how
//! submissions reach a worker:
//!
//! - [`GlobalQueuePool`]: one global FIFO, competing consumers.
//! - [`DedicatedQueuePool`]: a private queue per worker, with a
//!   cross-worker assignment policy.
//! - [`WorkStealingPool`]: per-worker deques with a global overflow queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::cancel::{CancelSource, CancelToken};
use crate::config::PoolConfig;
use crate::context;
use crate::events::{EventSink, LogSink, PoolEvent};
use crate::task::{Job, UserData, WorkItem, WorkItemPanic};
use crate::Result;

mod dedicated;
mod global_queue;
mod work_stealing;

pub use self::dedicated::{AssignmentPolicy, DedicatedQueuePool};
pub use self::global_queue::GlobalQueuePool;
pub use self::work_stealing::WorkStealingPool;

/// The public contract shared by every dispatcher variant.
///
/// Panic subscribers and event sinks are invoked on worker threads; they
/// must not block for long.
pub trait DispatchPool: Clone + Send + Sync + 'static {
    /// Builds a pool, linking its internal cancellation to `cancel`, and
    /// immediately spawns `config.min_threads` permanent workers.
    ///
    /// # Errors
    ///
    /// Configuration validation failures, or a spawn failure while
    /// creating the permanent workers.
    fn new(config: PoolConfig, cancel: CancelToken) -> Result<Self>
    where
        Self: Sized;

    /// Builds a pool with default configuration and a detached
    /// cancellation source.
    fn with_defaults() -> Result<Self>
    where
        Self: Sized,
    {
        Self::new(PoolConfig::default(), CancelSource::new().token())
    }

    /// Submits a job with an optional opaque payload.
    ///
    /// Returns `false`, with no side effect, once the pool is cancelled.
    /// On `true` the job is queued exactly once and will run unless the
    /// pool is cancelled before a worker reaches it.
    fn submit<F>(&self, job: F, user_data: Option<UserData>) -> bool
    where
        F: FnOnce(&CancelToken, Option<&UserData>) + Send + 'static;

    /// Number of live workers. Eventually consistent.
    fn total_threads(&self) -> usize;

    /// The pool's unique name.
    fn name(&self) -> &str;

    /// Registers a handler for work items that escape with a panic.
    /// Handlers run on the worker thread that observed the panic.
    fn on_work_item_panic(&self, handler: impl Fn(&WorkItemPanic) + Send + Sync + 'static);

    /// Requests cancellation and runs cancellation registrations before
    /// returning. Idempotent. Workers are signalled, not joined: running
    /// items finish, idle workers exit at their next check.
    fn dispose(&self);
}

type PanicHandler = Arc<dyn Fn(&WorkItemPanic) + Send + Sync>;

/// State common to every variant: identity, configuration, cancellation,
/// event reporting, the panic channel, and the growth throttle.
pub(crate) struct PoolCore {
    name: String,
    config: PoolConfig,
    cancel: CancelSource,
    sink: Arc<dyn EventSink>,
    panic_handlers: RwLock<Vec<PanicHandler>>,
    growth: Mutex<GrowthGate>,
    disposed: AtomicBool,
    size_warned: AtomicBool,
}

struct GrowthGate {
    last_birth: Instant,
}

impl PoolCore {
    pub(crate) fn new(
        config: PoolConfig,
        caller: &CancelToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<PoolCore> {
        config.validate()?;
        Ok(PoolCore {
            name: format!("workpool-{}", Uuid::new_v4()),
            config,
            cancel: CancelSource::linked_to(caller),
            sink,
            panic_handlers: RwLock::new(Vec::new()),
            growth: Mutex::new(GrowthGate {
                last_birth: Instant::now(),
            }),
            disposed: AtomicBool::new(false),
            size_warned: AtomicBool::new(false),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn token(&self) -> CancelToken {
        self.cancel.token()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        self.sink.event(event);
    }

    /// Builds a work item bound to this pool's token, snapshotting the
    /// producer's ambient context when configured to.
    pub(crate) fn make_item(&self, job: Job, user_data: Option<UserData>) -> WorkItem {
        let captured = if self.config.capture_caller_context {
            context::current()
        } else {
            None
        };
        WorkItem::new(job, user_data, self.token(), captured)
    }

    pub(crate) fn subscribe_panic(&self, handler: PanicHandler) {
        self.panic_handlers.write().unwrap().push(handler);
    }

    /// Routes an escaped work item to the sink and every subscriber.
    /// Runs on the worker thread. The subscriber list is snapshotted
    /// first, so no lock is held while user callbacks run, and a
    /// subscriber that itself panics is contained.
    pub(crate) fn report_panic(&self, report: WorkItemPanic) {
        self.emit(PoolEvent::WorkItemFailed {
            message: report.message.clone(),
        });
        let handlers = self.panic_handlers.read().unwrap().clone();
        for handler in handlers {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(&report)
            }));
            if outcome.is_err() {
                self.emit(PoolEvent::Failure {
                    message: "work item panic subscriber panicked".to_owned(),
                });
            }
        }
    }

    pub(crate) fn report_failure(&self, message: String) {
        self.emit(PoolEvent::Failure { message });
    }

    /// Claims permission for one worker birth under the spacing throttle.
    /// The decision and the timestamp update share one lock; readers
    /// elsewhere tolerate staleness.
    pub(crate) fn claim_birth(&self) -> bool {
        let mut gate = self.growth.lock().unwrap();
        if gate.last_birth.elapsed() < self.config.new_thread_spacing {
            return false;
        }
        gate.last_birth = Instant::now();
        true
    }

    /// Emits the advisory high-watermark warning the first time the
    /// population reaches it.
    pub(crate) fn note_population(&self, current: usize) {
        if current >= self.config.size_warning_threshold()
            && !self.size_warned.swap(true, Ordering::Relaxed)
        {
            self.emit(PoolEvent::SizeWarning {
                pool: self.name.clone(),
                current,
                max_threads: self.config.max_threads,
            });
        }
    }

    /// First call cancels and reports; later calls are no-ops.
    pub(crate) fn dispose(&self, live_workers: usize) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.emit(PoolEvent::Cancelled {
            pool: self.name.clone(),
            live_workers,
        });
    }
}

/// Generates a unique worker name.
pub(crate) fn worker_name() -> String {
    format!("worker-{}", Uuid::new_v4())
}

pub(crate) fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(LogSink)
}

/// Tracks a worker's idle time against the configured timeout.
pub(crate) struct IdleClock {
    last_processed: Instant,
}

impl IdleClock {
    pub(crate) fn start() -> Self {
        IdleClock {
            last_processed: Instant::now(),
        }
    }

    pub(crate) fn mark_processed(&mut self) {
        self.last_processed = Instant::now();
    }

    /// Whether the idle timeout has elapsed. Always `false` when
    /// shrinkage is disabled.
    pub(crate) fn expired(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(limit) => self.last_processed.elapsed() > limit,
            None => false,
        }
    }
}
