use std::time::Duration;

use crate::{PoolError, Result};

/// Hard ceiling on the worker population, independent of configuration.
///
/// Matches the order of magnitude an OS will realistically schedule before
/// thread stacks exhaust the address space.
pub const MAX_PLATFORM_THREADS: usize = 8192;

/// Default idle timeout after which a surplus worker exits.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default minimum interval between two successive worker births.
pub const DEFAULT_THREAD_SPACING: Duration = Duration::from_secs(5);

/// Default bounded wait on the global queue before an idle worker
/// re-examines its exit conditions.
pub const DEFAULT_ARRIVAL_WAIT: Duration = Duration::from_millis(100);

/// Validated parameters for a dispatcher pool.
///
/// A config is immutable once a pool is constructed from it. Construct with
/// [`PoolConfig::new`] and adjust via the `with_*` setters:
///
/// ```
/// use std::time::Duration;
/// use workpool::PoolConfig;
///
/// let config = PoolConfig::new()
///     .with_min_threads(2)
///     .with_max_threads(8)
///     .with_idle_timeout(Some(Duration::from_secs(30)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of permanent workers spawned at construction. These never
    /// exit on idle.
    pub min_threads: usize,
    /// Upper bound on the worker population.
    pub max_threads: usize,
    /// Idle interval after which a non-permanent worker exits.
    /// `None` disables shrinkage entirely.
    pub idle_timeout: Option<Duration>,
    /// Minimum wall-clock interval between two worker births.
    pub new_thread_spacing: Duration,
    /// Bounded wait an idle worker performs on an empty queue before
    /// re-checking its exit conditions.
    pub queue_arrival_wait: Duration,
    /// Capture the submitter's ambient context at submission time and
    /// restore it around execution.
    pub capture_caller_context: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfig {
    /// Creates a config with platform defaults: one permanent worker,
    /// growable up to the logical CPU count.
    pub fn new() -> Self {
        PoolConfig {
            min_threads: 1,
            max_threads: num_cpus::get().min(MAX_PLATFORM_THREADS),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            new_thread_spacing: DEFAULT_THREAD_SPACING,
            queue_arrival_wait: DEFAULT_ARRIVAL_WAIT,
            capture_caller_context: false,
        }
    }

    /// Sets the number of permanent workers.
    pub fn with_min_threads(mut self, min: usize) -> Self {
        self.min_threads = min;
        self
    }

    /// Sets the population ceiling.
    pub fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = max;
        self
    }

    /// Sets the idle timeout; `None` disables shrinkage.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the minimum interval between worker births.
    pub fn with_thread_spacing(mut self, spacing: Duration) -> Self {
        self.new_thread_spacing = spacing;
        self
    }

    /// Sets the bounded wait for idle workers polling an empty queue.
    pub fn with_arrival_wait(mut self, wait: Duration) -> Self {
        self.queue_arrival_wait = wait;
        self
    }

    /// Enables or disables ambient caller-context capture.
    pub fn with_context_capture(mut self, capture: bool) -> Self {
        self.capture_caller_context = capture;
        self
    }

    /// High-watermark at which the pool emits a size warning: 95% of
    /// `max_threads`, rounded up.
    pub fn size_warning_threshold(&self) -> usize {
        (self.max_threads * 95).div_ceil(100)
    }

    /// Checks the bounds against each other and the platform ceiling.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if either bound is zero; `OutOfRange` if
    /// `min_threads` exceeds `max_threads` or `max_threads` exceeds
    /// [`MAX_PLATFORM_THREADS`].
    pub fn validate(&self) -> Result<()> {
        if self.min_threads < 1 {
            return Err(PoolError::InvalidArgument(
                "min_threads must be at least 1".to_owned(),
            ));
        }
        if self.max_threads < 1 {
            return Err(PoolError::InvalidArgument(
                "max_threads must be at least 1".to_owned(),
            ));
        }
        if self.min_threads > self.max_threads {
            return Err(PoolError::OutOfRange(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if self.max_threads > MAX_PLATFORM_THREADS {
            return Err(PoolError::OutOfRange(format!(
                "max_threads ({}) exceeds the platform ceiling ({})",
                self.max_threads, MAX_PLATFORM_THREADS
            )));
        }
        Ok(())
    }
}
