//! Work-stealing dispatcher: per-worker deques with a global overflow.
//!
//! Work submitted from inside a worker lands on that worker's own deque
//! (LIFO for the owner, FIFO for thieves); work from outside lands on the
//! global queue. An idle worker drains its own deque first, then the
//! global queue, then sweeps its peers.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;

use crate::cancel::CancelToken;
use crate::config::PoolConfig;
use crate::deque::{steal_deque, DequeOwner, DequeStealer};
use crate::events::{EventSink, PoolEvent};
use crate::queue::JobQueue;
use crate::registry::WorkerRegistry;
use crate::task::{UserData, WorkItem, WorkItemPanic};
use crate::{PoolError, Result};

use super::{default_sink, worker_name, DispatchPool, IdleClock, PoolCore};

/// Bounded wait for a steal victim's foreign lock.
const STEAL_WAIT: Duration = Duration::from_millis(100);

/// Sleep between fruitless search passes once spinning is exhausted.
/// Bounds both CPU burn and cancellation latency.
const IDLE_PASS_SLEEP: Duration = Duration::from_millis(1);

thread_local! {
    static CURRENT_WORKER: RefCell<Option<CurrentWorker>> = const { RefCell::new(None) };
}

/// Marks the running thread as a worker of one specific pool. Submissions
/// from this thread into that pool shortcut onto the worker's own deque.
struct CurrentWorker {
    pool: String,
    deque: DequeOwner<WorkItem>,
}

/// Registry record for a live worker: which stealer slot it occupies.
struct WorkerInfo {
    slot: usize,
}

struct Shared {
    core: PoolCore,
    global: JobQueue<WorkItem>,
    /// Stealer per worker slot; `None` where no worker lives. Guarded by
    /// a coarse lock contended only at worker birth and death.
    slots: std::sync::RwLock<Vec<Option<DequeStealer<WorkItem>>>>,
    registry: WorkerRegistry<WorkerInfo>,
}

/// V3: work-stealing deques backed by a global overflow queue.
pub struct WorkStealingPool {
    shared: Arc<Shared>,
    _disposer: Arc<Disposer>,
}

impl Clone for WorkStealingPool {
    fn clone(&self) -> Self {
        WorkStealingPool {
            shared: self.shared.clone(),
            _disposer: self._disposer.clone(),
        }
    }
}

struct Disposer(Arc<Shared>);

impl Drop for Disposer {
    fn drop(&mut self) {
        self.0.core.dispose(self.0.registry.len());
    }
}

impl WorkStealingPool {
    /// Builds the pool with a custom event sink.
    pub fn with_sink(
        config: PoolConfig,
        cancel: CancelToken,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let core = PoolCore::new(config, &cancel, sink)?;
        let shared = Arc::new(Shared {
            core,
            global: JobQueue::new(),
            slots: std::sync::RwLock::new(Vec::new()),
            registry: WorkerRegistry::new(),
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
        Ok(WorkStealingPool {
            shared,
            _disposer: disposer,
        })
    }

    /// Spawns one extra worker if the spacing throttle, the cap, and the
    /// pool-wide backlog all allow it.
    fn try_grow(&self) {
        let shared = &self.shared;
        if shared.registry.len() >= shared.core.config().max_threads {
            return;
        }
        let queued: usize = {
            let slots = shared.slots.read().unwrap();
            slots
                .iter()
                .flatten()
                .map(DequeStealer::len)
                .sum::<usize>()
        } + shared.global.len();
        if queued <= shared.core.config().max_threads {
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

impl DispatchPool for WorkStealingPool {
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
        let mut slot = Some(self.shared.core.make_item(Box::new(job), user_data));

        // A worker submitting into its own pool pushes locally.
        let local_len = CURRENT_WORKER.with(|cell| {
            let current = cell.borrow();
            match current.as_ref() {
                Some(worker) if worker.pool == self.shared.core.name() => {
                    worker.deque.push(slot.take().unwrap());
                    Some(worker.deque.len())
                }
                _ => None,
            }
        });

        match local_len {
            Some(len) => {
                if len > self.shared.core.config().min_threads {
                    self.try_grow();
                }
            }
            None => {
                self.shared.global.enqueue(slot.take().unwrap());
                if self.shared.global.len() > self.shared.core.config().min_threads {
                    self.try_grow();
                }
            }
        }
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

/// Creates the worker's deque, claims a slot for its stealer (reusing a
/// vacated entry when one exists), registers the worker, and starts the
/// thread with the owner half. Registration is atomic against the
/// population cap, so concurrent births cannot overshoot.
fn spawn_worker(shared: &Arc<Shared>, permanent: bool) -> std::io::Result<()> {
    let name = worker_name();
    let (owner, stealer) = steal_deque::<WorkItem>();

    let slot = {
        let mut slots = shared.slots.write().unwrap();
        match slots.iter().position(Option::is_none) {
            Some(free) => {
                slots[free] = Some(stealer);
                free
            }
            None => {
                slots.push(Some(stealer));
                slots.len() - 1
            }
        }
    };

    let cap = shared.core.config().max_threads;
    if !shared
        .registry
        .insert_capped(name.clone(), WorkerInfo { slot }, cap)
    {
        shared.slots.write().unwrap()[slot] = None;
        return Ok(());
    }

    let thread_shared = shared.clone();
    let thread_name = name.clone();
    let spawned = thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_worker(thread_shared, thread_name, slot, owner, permanent));

    match spawned {
        Ok(_) => {
            shared.core.note_population(shared.registry.len());
            Ok(())
        }
        Err(e) => {
            shared.registry.remove(&name);
            shared.slots.write().unwrap()[slot] = None;
            Err(e)
        }
    }
}

fn run_worker(
    shared: Arc<Shared>,
    name: String,
    slot: usize,
    owner: DequeOwner<WorkItem>,
    permanent: bool,
) {
    shared.core.emit(PoolEvent::WorkerStarted {
        worker: name.clone(),
    });
    CURRENT_WORKER.with(|cell| {
        *cell.borrow_mut() = Some(CurrentWorker {
            pool: shared.core.name().to_owned(),
            deque: owner,
        });
    });

    let token = shared.core.token();
    let mut idle = IdleClock::start();
    let config = shared.core.config().clone();
    let mut backoff = Backoff::new();

    let removed = loop {
        if token.is_cancelled() {
            break shared.registry.remove(&name);
        }

        if !permanent && idle.expired(config.idle_timeout) {
            if let Some(info) = shared.registry.try_retire(&name, config.min_threads) {
                break Some(info);
            }
            idle.mark_processed();
        }

        match next_item(&shared, slot) {
            Some(item) => {
                if let Some(report) = item.execute() {
                    shared.core.report_panic(report);
                }
                idle.mark_processed();
                backoff = Backoff::new();
            }
            None => {
                // Fruitless full pass: back off, then loop to re-check
                // the exit conditions.
                if backoff.is_completed() {
                    thread::sleep(IDLE_PASS_SLEEP);
                } else {
                    backoff.snooze();
                }
            }
        }
    };

    if let Some(info) = removed {
        shared.slots.write().unwrap()[info.slot] = None;
    }
    CURRENT_WORKER.with(|cell| *cell.borrow_mut() = None);
    shared.core.emit(PoolEvent::WorkerExited { worker: name });
}

/// One search pass: own deque, then the global queue, then the peers.
fn next_item(shared: &Shared, own_slot: usize) -> Option<WorkItem> {
    let local = CURRENT_WORKER.with(|cell| {
        cell.borrow().as_ref().and_then(|worker| worker.deque.pop())
    });
    if local.is_some() {
        return local;
    }

    if let Some(item) = shared.global.try_dequeue() {
        return Some(item);
    }

    let victims: Vec<DequeStealer<WorkItem>> = {
        let slots = shared.slots.read().unwrap();
        slots
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != own_slot)
            .filter_map(|(_, entry)| entry.clone())
            .collect()
    };
    for victim in victims {
        if let Some(item) = victim.steal(STEAL_WAIT) {
            return Some(item);
        }
    }
    None
}
