//! Dedicated-queue dispatcher: one private queue per worker.
//!
//! Producers pick a target worker (round-robin or min-load) and hand the
//! item to that worker's bounded queue. FIFO holds per
//! (producer, chosen worker) pair; there is no pool-wide order.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use rand::prelude::*;

use crate::cancel::CancelToken;
use crate::config::PoolConfig;
use crate::events::{EventSink, PoolEvent};
use crate::registry::WorkerRegistry;
use crate::task::{UserData, WorkItem, WorkItemPanic};
use crate::{PoolError, Result};

use super::{default_sink, worker_name, DispatchPool, IdleClock, PoolCore};

/// Capacity of each worker's private queue.
const PRIVATE_QUEUE_CAPACITY: usize = 1024;

/// Backlog a selected worker may carry before a submission considers
/// spawning another worker. Deliberately above zero: a single in-flight
/// item on the target is not yet congestion.
const SPAWN_BACKLOG_THRESHOLD: usize = 1;

const READY: u8 = 0;
const RUNNING: u8 = 1;
const EXITING: u8 = 2;

/// How submissions choose a target worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentPolicy {
    /// Rotate through live workers in registration order.
    RoundRobin,
    /// Scan live workers and pick uniformly among those with the fewest
    /// outstanding items.
    MinLoad,
}

/// Producer-side view of one worker.
#[derive(Clone)]
struct WorkerLink {
    tx: Sender<WorkItem>,
    outstanding: Arc<AtomicUsize>,
    status: Arc<AtomicU8>,
}

struct Shared {
    core: PoolCore,
    registry: WorkerRegistry<WorkerLink>,
    policy: AssignmentPolicy,
    rr_cursor: AtomicUsize,
}

/// V2: per-worker private queues with a cross-worker assignment policy.
pub struct DedicatedQueuePool {
    shared: Arc<Shared>,
    _disposer: Arc<Disposer>,
}

impl Clone for DedicatedQueuePool {
    fn clone(&self) -> Self {
        DedicatedQueuePool {
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

impl DedicatedQueuePool {
    /// Builds the pool with an explicit assignment policy and event sink.
    pub fn with_policy(
        config: PoolConfig,
        cancel: CancelToken,
        policy: AssignmentPolicy,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let core = PoolCore::new(config, &cancel, sink)?;
        let shared = Arc::new(Shared {
            core,
            registry: WorkerRegistry::new(),
            policy,
            rr_cursor: AtomicUsize::new(0),
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
        Ok(DedicatedQueuePool {
            shared,
            _disposer: disposer,
        })
    }
}

impl DispatchPool for DedicatedQueuePool {
    fn new(config: PoolConfig, cancel: CancelToken) -> Result<Self> {
        Self::with_policy(config, cancel, AssignmentPolicy::RoundRobin, default_sink())
    }

    fn submit<F>(&self, job: F, user_data: Option<UserData>) -> bool
    where
        F: FnOnce(&CancelToken, Option<&UserData>) + Send + 'static,
    {
        if self.shared.core.is_cancelled() {
            return false;
        }
        let item = self.shared.core.make_item(Box::new(job), user_data);
        route(&self.shared, item)
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

/// Picks a target worker under the configured policy. `None` only when
/// the registry is empty (teardown).
fn select(shared: &Shared) -> Option<(String, WorkerLink)> {
    match shared.policy {
        AssignmentPolicy::RoundRobin => {
            let index = shared.rr_cursor.fetch_add(1, Ordering::Relaxed);
            let name = shared.registry.nth_name(index)?;
            let link = shared.registry.with_handle(&name, Clone::clone)?;
            Some((name, link))
        }
        AssignmentPolicy::MinLoad => shared.registry.scan(|map| {
            let mut best = usize::MAX;
            let mut candidates: Vec<(&String, &WorkerLink)> = Vec::new();
            for (name, link) in map {
                if link.status.load(Ordering::Acquire) == EXITING {
                    continue;
                }
                let load = link.outstanding.load(Ordering::Acquire);
                if load < best {
                    best = load;
                    candidates.clear();
                }
                if load == best {
                    candidates.push((name, link));
                }
            }
            candidates
                .choose(&mut thread_rng())
                .map(|(name, link)| ((*name).clone(), (*link).clone()))
        }),
    }
}

/// Delivers one admitted item to some worker, spawning capacity on the
/// way when the target is backlogged. Returns `false` only if the pool
/// is cancelled before delivery; the item is then discarded.
fn route(shared: &Arc<Shared>, mut item: WorkItem) -> bool {
    loop {
        if shared.core.is_cancelled() {
            return false;
        }

        let Some((name, link)) = select(shared) else {
            thread::yield_now();
            continue;
        };
        if link.status.load(Ordering::Acquire) == EXITING {
            continue;
        }

        let outstanding = link.outstanding.load(Ordering::Acquire);
        if outstanding > SPAWN_BACKLOG_THRESHOLD
            && shared.registry.len() < shared.core.config().max_threads
            && try_grow(shared)
        {
            // New capacity is live; give the submission a fresh pick.
            continue;
        }

        shared.core.emit(PoolEvent::WorkerSelected {
            worker: name.clone(),
            outstanding,
        });

        // Count before handing over so the worker's decrement can never
        // observe a missing increment.
        link.outstanding.fetch_add(1, Ordering::AcqRel);
        match link
            .tx
            .send_timeout(item, shared.core.config().queue_arrival_wait)
        {
            Ok(()) => return true,
            Err(e) => {
                link.outstanding.fetch_sub(1, Ordering::AcqRel);
                shared.core.emit(PoolEvent::AssignmentFailed {
                    worker: name,
                    outstanding: link.outstanding.load(Ordering::Acquire),
                });
                item = e.into_inner();
            }
        }
    }
}

fn try_grow(shared: &Arc<Shared>) -> bool {
    if shared.registry.len() >= shared.core.config().max_threads {
        return false;
    }
    if !shared.core.claim_birth() {
        return false;
    }
    match spawn_worker(shared, false) {
        Ok(spawned) => spawned,
        Err(e) => {
            shared
                .core
                .report_failure(format!("growth spawn failed: {e}"));
            false
        }
    }
}

/// Registers and starts one worker. Registration is atomic against the
/// population cap; `Ok(false)` means the cap was already reached.
fn spawn_worker(shared: &Arc<Shared>, permanent: bool) -> std::io::Result<bool> {
    let name = worker_name();
    let (tx, rx) = bounded(PRIVATE_QUEUE_CAPACITY);
    let outstanding = Arc::new(AtomicUsize::new(0));
    let status = Arc::new(AtomicU8::new(READY));

    let inserted = shared.registry.insert_capped(
        name.clone(),
        WorkerLink {
            tx,
            outstanding: outstanding.clone(),
            status: status.clone(),
        },
        shared.core.config().max_threads,
    );
    if !inserted {
        return Ok(false);
    }

    let thread_shared = shared.clone();
    let thread_name = name.clone();
    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        run_worker(
            thread_shared,
            thread_name,
            rx,
            outstanding,
            status,
            permanent,
        )
    });

    match spawned {
        Ok(_) => {
            shared.core.note_population(shared.registry.len());
            Ok(true)
        }
        Err(e) => {
            shared.registry.remove(&name);
            Err(e)
        }
    }
}

fn run_worker(
    shared: Arc<Shared>,
    name: String,
    rx: Receiver<WorkItem>,
    outstanding: Arc<AtomicUsize>,
    status: Arc<AtomicU8>,
    permanent: bool,
) {
    shared.core.emit(PoolEvent::WorkerStarted {
        worker: name.clone(),
    });

    let token = shared.core.token();
    let mut idle = IdleClock::start();
    let config = shared.core.config().clone();

    loop {
        if token.is_cancelled() {
            status.store(EXITING, Ordering::Release);
            shared.registry.remove(&name);
            break;
        }

        if !permanent && idle.expired(config.idle_timeout) {
            if let Some(retired) = shared.registry.try_retire(&name, config.min_threads) {
                status.store(EXITING, Ordering::Release);
                // Dropping the registry's sender starts the disconnect;
                // producers holding a transient clone may still land an
                // item, so drain until the channel is provably closed and
                // re-route anything that slipped in.
                drop(retired);
                loop {
                    match rx.try_recv() {
                        Ok(leftover) => {
                            outstanding.fetch_sub(1, Ordering::AcqRel);
                            route(&shared, leftover);
                        }
                        Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => thread::yield_now(),
                    }
                }
                break;
            }
            idle.mark_processed();
        }

        match rx.recv_timeout(config.queue_arrival_wait) {
            Ok(item) => {
                let _ = status.compare_exchange(READY, RUNNING, Ordering::AcqRel, Ordering::Relaxed);
                if let Some(report) = item.execute() {
                    shared.core.report_panic(report);
                }
                outstanding.fetch_sub(1, Ordering::AcqRel);
                idle.mark_processed();
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                status.store(EXITING, Ordering::Release);
                shared.registry.remove(&name);
                break;
            }
        }
    }

    shared.core.emit(PoolEvent::WorkerExited { worker: name });
}
