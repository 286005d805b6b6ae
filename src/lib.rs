#![deny(missing_docs)]

//! A compute thread pool family.
//!
//! Producers submit short, CPU-bound jobs from any thread; a bounded
//! population of long-lived workers executes them. Three dispatchers
//! share one contract (the [`DispatchPool`] trait) and differ only in
//! routing:
//!
//! - [`GlobalQueuePool`] — one global FIFO, competing consumers.
//! - [`DedicatedQueuePool`] — a private queue per worker, assignment by
//!   round-robin or minimum load.
//! - [`WorkStealingPool`] — per-worker deques plus a global overflow
//!   queue, with head-side stealing between workers.
//!
//! Pools grow lazily up to `max_threads` (throttled by a minimum
//! inter-birth spacing), shrink back to `min_threads` after an idle
//! timeout, and stop cooperatively through linked cancellation tokens.
//!
//! # Examples
//!
//! ```
//! use workpool::{CancelSource, DispatchPool, GlobalQueuePool, PoolConfig};
//!
//! let cancel = CancelSource::new();
//! let pool = GlobalQueuePool::new(PoolConfig::new(), cancel.token()).unwrap();
//!
//! let accepted = pool.submit(|_token, _data| println!("hello from a worker"), None);
//! assert!(accepted);
//!
//! cancel.cancel();
//! assert!(!pool.submit(|_, _| {}, None));
//! ```

mod cancel;
mod config;
pub mod context;
mod deque;
mod error;
mod events;
mod pool;
mod queue;
mod registry;
mod task;

pub use cancel::{CancelSource, CancelToken};
pub use config::{PoolConfig, MAX_PLATFORM_THREADS};
pub use context::CallerContext;
pub use error::{PoolError, Result};
pub use events::{EventSink, LogSink, PoolEvent};
pub use pool::{
    AssignmentPolicy, DedicatedQueuePool, DispatchPool, GlobalQueuePool, WorkStealingPool,
};
pub use task::{UserData, WorkItemPanic};
