//! Cross-variant behavioral tests: lifecycle, sizing, cancellation, and
//! the panic channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use workpool::{
    AssignmentPolicy, CancelSource, DedicatedQueuePool, DispatchPool, GlobalQueuePool, LogSink,
    PoolConfig, UserData, WorkStealingPool,
};

/// Config with short waits so idle/shrink behavior is observable quickly.
fn fast_config(min: usize, max: usize) -> PoolConfig {
    PoolConfig::new()
        .with_min_threads(min)
        .with_max_threads(max)
        .with_idle_timeout(Some(Duration::from_millis(50)))
        .with_thread_spacing(Duration::ZERO)
        .with_arrival_wait(Duration::from_millis(10))
}

fn build<P: DispatchPool>(config: PoolConfig) -> (P, CancelSource) {
    let _ = env_logger::builder().is_test(true).try_init();
    let cancel = CancelSource::new();
    let pool = P::new(config, cancel.token()).expect("pool construction");
    (pool, cancel)
}

/// Polls `cond` until it holds or the deadline passes.
fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn names_are_unique<P: DispatchPool>() {
    let (a, _ca) = build::<P>(fast_config(1, 2));
    let (b, _cb) = build::<P>(fast_config(1, 2));
    assert_ne!(a.name(), b.name());
    a.dispose();
    b.dispose();
}

fn cancelled_pool_rejects<P: DispatchPool>() {
    let (pool, cancel) = build::<P>(fast_config(1, 2));
    cancel.cancel();
    assert!(!pool.submit(|_, _| {}, None));
    // Stable: every later call refuses too.
    assert!(!pool.submit(|_, _| {}, None));
}

fn holds_the_minimum_floor<P: DispatchPool>() {
    let config = fast_config(10, 100).with_idle_timeout(Some(Duration::from_millis(10)));
    let (pool, _cancel) = build::<P>(config);
    assert_eq!(pool.total_threads(), 10);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(pool.total_threads(), 10);
    pool.dispose();
}

fn never_exceeds_the_maximum<P: DispatchPool>() {
    let config = fast_config(1, 2).with_idle_timeout(Some(Duration::from_secs(5)));
    let (pool, _cancel) = build::<P>(config);
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let done = done.clone();
        assert!(pool.submit(
            move |_, _| {
                thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            },
            None,
        ));
        assert!(pool.total_threads() <= 2);
    }

    assert!(wait_until(Duration::from_secs(10), || done
        .load(Ordering::SeqCst)
        == 10));
    assert!(pool.total_threads() <= 2);
    pool.dispose();
}

fn shrinks_back_to_the_floor<P: DispatchPool>() {
    let (pool, _cancel) = build::<P>(fast_config(1, 3));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..10_000 {
        let done = done.clone();
        pool.submit(
            move |_, _| {
                done.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        assert!(pool.total_threads() <= 3);
    }

    assert!(wait_until(Duration::from_secs(10), || done
        .load(Ordering::SeqCst)
        == 10_000));
    assert!(
        wait_until(Duration::from_secs(5), || pool.total_threads() == 1),
        "population should shrink to the floor after quiescence"
    );
    pool.dispose();
}

fn panic_reaches_the_subscriber<P: DispatchPool>() {
    let (pool, _cancel) = build::<P>(fast_config(1, 2));
    let hits = Arc::new(AtomicUsize::new(0));
    let payload_ok = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    let payload_ok2 = payload_ok.clone();
    pool.on_work_item_panic(move |report| {
        hits2.fetch_add(1, Ordering::SeqCst);
        if report.message == "deliberate failure"
            && report
                .user_data
                .as_ref()
                .and_then(|d| d.downcast_ref::<i32>())
                == Some(&123)
        {
            payload_ok2.fetch_add(1, Ordering::SeqCst);
        }
    });

    let data: UserData = Arc::new(123i32);
    assert!(pool.submit(|_, _| panic!("deliberate failure"), Some(data)));

    assert!(wait_until(Duration::from_secs(2), || hits
        .load(Ordering::SeqCst)
        >= 1));
    // No second delivery.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(payload_ok.load(Ordering::SeqCst), 1);

    // The worker survived the panic.
    let alive = Arc::new(AtomicUsize::new(0));
    let alive2 = alive.clone();
    assert!(pool.submit(
        move |_, _| {
            alive2.fetch_add(1, Ordering::SeqCst);
        },
        None,
    ));
    assert!(wait_until(Duration::from_secs(2), || alive
        .load(Ordering::SeqCst)
        == 1));
    pool.dispose();
}

fn dispose_is_idempotent<P: DispatchPool>() {
    let (pool, _cancel) = build::<P>(fast_config(1, 2));
    pool.dispose();
    pool.dispose();
    assert!(!pool.submit(|_, _| {}, None));
}

macro_rules! variant_suite {
    ($variant:ident, $pool:ty) => {
        mod $variant {
            use super::*;

            #[test]
            fn names_are_unique() {
                super::names_are_unique::<$pool>();
            }

            #[test]
            fn cancelled_pool_rejects() {
                super::cancelled_pool_rejects::<$pool>();
            }

            #[test]
            fn holds_the_minimum_floor() {
                super::holds_the_minimum_floor::<$pool>();
            }

            #[test]
            fn never_exceeds_the_maximum() {
                super::never_exceeds_the_maximum::<$pool>();
            }

            #[test]
            fn shrinks_back_to_the_floor() {
                super::shrinks_back_to_the_floor::<$pool>();
            }

            #[test]
            fn panic_reaches_the_subscriber() {
                super::panic_reaches_the_subscriber::<$pool>();
            }

            #[test]
            fn dispose_is_idempotent() {
                super::dispose_is_idempotent::<$pool>();
            }
        }
    };
}

variant_suite!(global_queue, GlobalQueuePool);
variant_suite!(dedicated, DedicatedQueuePool);
variant_suite!(work_stealing, WorkStealingPool);

#[test]
fn global_queue_preserves_fifo_with_one_worker() {
    let config = fast_config(1, 1);
    let (pool, _cancel) = build::<GlobalQueuePool>(config);
    let observed = Arc::new(Mutex::new(Vec::new()));

    for index in 0..1000usize {
        let observed = observed.clone();
        assert!(pool.submit(
            move |_, _| {
                observed.lock().unwrap().push(index);
            },
            None,
        ));
    }

    assert!(wait_until(Duration::from_secs(10), || observed
        .lock()
        .unwrap()
        .len()
        == 1000));
    let observed = observed.lock().unwrap();
    assert!(
        observed.windows(2).all(|w| w[0] < w[1]),
        "a single consumer must observe submission order"
    );
    pool.dispose();
}

#[test]
fn work_stealing_runs_long_item_through_cancellation() {
    let (pool, _cancel) = build::<WorkStealingPool>(fast_config(1, 2));
    let finished = Arc::new(AtomicUsize::new(0));

    let finished2 = finished.clone();
    assert!(pool.submit(
        move |_, _| {
            thread::sleep(Duration::from_secs(2));
            finished2.fetch_add(1, Ordering::SeqCst);
        },
        None,
    ));
    // Let a worker pick it up.
    thread::sleep(Duration::from_millis(100));

    pool.dispose();
    assert_eq!(pool.total_threads(), 1);
    thread::sleep(Duration::from_millis(500));
    assert_eq!(pool.total_threads(), 1, "the running item is not interrupted");

    assert!(wait_until(Duration::from_secs(5), || finished
        .load(Ordering::SeqCst)
        == 1));
    assert!(wait_until(Duration::from_secs(5), || pool.total_threads() == 0));
}

#[test]
fn work_stealing_accepts_nested_submissions() {
    let (pool, _cancel) = build::<WorkStealingPool>(fast_config(2, 4));
    let done = Arc::new(AtomicUsize::new(0));

    let outer_pool = pool.clone();
    let outer_done = done.clone();
    assert!(pool.submit(
        move |_, _| {
            for _ in 0..100 {
                let done = outer_done.clone();
                // Submitting from a worker lands on its own deque.
                outer_pool.submit(
                    move |_, _| {
                        done.fetch_add(1, Ordering::SeqCst);
                    },
                    None,
                );
            }
        },
        None,
    ));

    assert!(wait_until(Duration::from_secs(10), || done
        .load(Ordering::SeqCst)
        == 100));
    pool.dispose();
}

#[test]
fn dedicated_min_load_policy_dispatches_everywhere() {
    let cancel = CancelSource::new();
    let pool = DedicatedQueuePool::with_policy(
        fast_config(4, 4),
        cancel.token(),
        AssignmentPolicy::MinLoad,
        Arc::new(LogSink),
    )
    .expect("pool construction");

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let done = done.clone();
        assert!(pool.submit(
            move |_, _| {
                done.fetch_add(1, Ordering::SeqCst);
            },
            None,
        ));
    }
    assert!(wait_until(Duration::from_secs(10), || done
        .load(Ordering::SeqCst)
        == 200));
    pool.dispose();
}

#[test]
fn caller_context_travels_with_the_item() {
    let config = fast_config(1, 2).with_context_capture(true);
    let (pool, _cancel) = build::<GlobalQueuePool>(config);

    workpool::context::set_current(Some(
        workpool::CallerContext::new().with("request", "r-99"),
    ));

    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    assert!(pool.submit(
        move |_, _| {
            let value = workpool::context::current()
                .and_then(|ctx| ctx.get("request").map(str::to_owned));
            *seen2.lock().unwrap() = value;
        },
        None,
    ));

    assert!(wait_until(Duration::from_secs(2), || seen
        .lock()
        .unwrap()
        .is_some()));
    assert_eq!(seen.lock().unwrap().as_deref(), Some("r-99"));
    workpool::context::set_current(None);
    pool.dispose();
}

#[test]
fn work_item_observes_pool_cancellation() {
    let (pool, cancel) = build::<GlobalQueuePool>(fast_config(1, 1));
    let saw_cancel = Arc::new(AtomicUsize::new(0));

    let saw = saw_cancel.clone();
    assert!(pool.submit(
        move |token, _| {
            while !token.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            saw.fetch_add(1, Ordering::SeqCst);
        },
        None,
    ));

    thread::sleep(Duration::from_millis(50));
    cancel.cancel();
    assert!(wait_until(Duration::from_secs(2), || saw_cancel
        .load(Ordering::SeqCst)
        == 1));
}
