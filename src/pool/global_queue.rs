//! Single-global-queue dispatcher: all workers compete on one FIFO.
//!
//! The only variant with a pool-wide FIFO guarantee: items run in
//! submission order modulo the number of concurrent consumers.

use std::sync::Arc;
use std::thread;

use crate::cancel::CancelToken;
use crate::config::PoolConfig;
use crate::events::{EventSink, PoolEvent};
use crate::queue::JobQueue;
use crate::registry::WorkerRegistry;
use crate::task::{UserData, WorkItem, WorkItemPanic};
use crate::{PoolError, Result};

use super::{default_sink, worker_name, DispatchPool, IdleClock, PoolCore};

struct Shared {
    core: PoolCore,
    queue: JobQueue<WorkItem>,
    registry: WorkerRegistry<WorkerInfo>,
}

/// Registry record for a live worker. V1 workers coordinate entirely
/// through the shared queue, so presence (and the resulting count) is the
/// whole handle.
struct WorkerInfo;

/// V1: one global FIFO with competing consumers.
pub struct GlobalQueuePool {
    shared: Arc<Shared>,
    _disposer: Arc<Disposer>,
}

impl Clone for GlobalQueuePool {
    fn clone(&self) -> Self {
        GlobalQueuePool {
            shared: self.shared.clone(),
            _disposer: self._disposer.clone(),
        }
    }
}

/// Disposes the pool when the last producer-side handle drops. Workers
/// hold only `Shared`, so they never keep the pool alive.
struct Disposer(Arc<Shared>);

impl Drop for Disposer {
    fn drop(&mut self) {
        self.0.core.dispose(self.0.registry.len());
    }
}

impl GlobalQueuePool {
    /// Builds the pool with a custom event sink.
    pub fn with_sink(
        config: PoolConfig,
        cancel: CancelToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let core = PoolCore::new(config, &cancel, sink)?;
        let shared = Arc::new(Shared {
            core,
            queue: JobQueue::new(),
            registry: WorkerRegistry::new(),
        });

        // Wake idle consumers the moment cancellation lands, from either
        // the caller's source or dispose.
        let waker = Arc::downgrade(&shared);
        shared.core.token().on_cancel(move || {
            if let Some(shared) = waker.upgrade() {
                shared.queue.close();
            }
        });

        for _ in 0..shared.core.config().min_threads {
            if let Err(e) = spawn_worker(&shared, true) {
                shared.core.dispose(shared.registry.len());
                return Err(PoolError::Spawn(e));
            }
        }

        shared.core.emit(PoolEvent::Started {
            pool: shared.core.name().to_owned(),
            min_threads: shared.core.config().min_threads,
            max_threads: shared.core.config().max_threads,
        });

        let disposer = Arc::new(Disposer(shared.clone()));
        Ok(GlobalQueuePool {
            shared,
            _disposer: disposer,
        })
    }

    /// Spawns one extra worker if the spacing throttle, the population
    /// cap, and the backlog all allow it.
    fn try_grow(&self) {
        let shared = &self.shared;
        let total = shared.registry.len();
        if shared.queue.len() <= total || total >= shared.core.config().max_threads {
            return;
        }
        if !shared.core.claim_birth() {
            return;
        }
        if let Err(e) = spawn_worker(shared, false) {
            shared
                .core
                .report_failure(format!("growth spawn failed: {e}"));
        }
    }
}

impl DispatchPool for GlobalQueuePool {
    fn new(config: PoolConfig, cancel: CancelToken) -> Result<Self> {
        Self::with_sink(config, cancel, default_sink())
    }

    fn submit<F>(&self, job: F, user_data: Option<UserData>) -> bool
    where
        F: FnOnce(&CancelToken, Option<&UserData>) + Send + 'static,
    {
        if self.shared.core.is_cancelled() {
            return false;
        }
        let item = self.shared.core.make_item(Box::new(job), user_data);
        self.shared.queue.enqueue(item);
        self.try_grow();
        true
    }

    fn total_threads(&self) -> usize {
        self.shared.registry.len()
    }

    fn name(&self) -> &str {
        self.shared.core.name()
    }

    fn on_work_item_panic(&self, handler: impl Fn(&WorkItemPanic) + Send + Sync + 'static) {
        self.shared.core.subscribe_panic(Arc::new(handler));
    }

    fn dispose(&self) {
        self.shared.core.dispose(self.shared.registry.len());
    }
}

/// Registers and starts one worker. Registration happens on the calling
/// thread, atomically against the cap, so the population invariant is
/// visible before the thread runs and concurrent births cannot overshoot.
fn spawn_worker(shared: &Arc<Shared>, permanent: bool) -> std::io::Result<()> {
    let name = worker_name();
    let cap = shared.core.config().max_threads;
    if !shared.registry.insert_capped(name.clone(), WorkerInfo, cap) {
        return Ok(());
    }

    let thread_shared = shared.clone();
    let thread_name = name.clone();
    let spawned = thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_worker(thread_shared, thread_name, permanent));

    match spawned {
        Ok(_) => {
            shared.core.note_population(shared.registry.len());
            Ok(())
        }
        Err(e) => {
            shared.registry.remove(&name);
            Err(e)
        }
    }
}

fn run_worker(shared: Arc<Shared>, name: String, permanent: bool) {
    shared.core.emit(PoolEvent::WorkerStarted {
        worker: name.clone(),
    });

    let token = shared.core.token();
    let mut idle = IdleClock::start();
    let config = shared.core.config().clone();

    loop {
        if token.is_cancelled() {
            shared.registry.remove(&name);
            break;
        }

        if !permanent && idle.expired(config.idle_timeout) {
            if shared
                .registry
                .try_retire(&name, config.min_threads)
                .is_some()
            {
                break;
            }
            // At the floor: stay, and restart the idle interval.
            idle.mark_processed();
        }

        match shared.queue.try_dequeue() {
            Some(item) => {
                if let Some(report) = item.execute() {
                    shared.core.report_panic(report);
                }
                idle.mark_processed();
            }
            None => shared.queue.wait_arrival(config.queue_arrival_wait),
        }
    }

    shared.core.emit(PoolEvent::WorkerExited { worker: name });
}
