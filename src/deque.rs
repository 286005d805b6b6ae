//! Per-worker work-stealing deque.
//!
//! A bounded, growable double-ended queue over a power-of-two ring. The
//! owning worker pushes and pops at the tail without locking; foreign
//! workers steal at the head under the foreign lock. Only growth, steals,
//! and the contended tail race serialize on that lock.
//!
//! The two halves are separate handles: the owner half is unique and moves
//! into its worker thread, the stealer half is clonable and lives in the
//! pool's shared slot array.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Initial ring capacity. Must be a power of two.
const INITIAL_CAPACITY: usize = 32;

type Slot<T> = UnsafeCell<MaybeUninit<T>>;

struct Ring<T> {
    /// Replaced only by the owner, and only under `foreign`.
    buffer: UnsafeCell<Box<[Slot<T>]>>,
    /// `capacity - 1`. Written by the owner under `foreign`; plain reads
    /// by the owner are always consistent with its own writes.
    mask: AtomicUsize,
    /// Monotonic head index; stealers advance it under `foreign`.
    head: AtomicI64,
    /// Monotonic tail index; only the owner writes it.
    tail: AtomicI64,
    /// Serializes steals, growth, and the contended last-element race.
    foreign: Mutex<()>,
}

// The index protocol guarantees a slot is read or written by exactly one
// thread at a time; values only ever move across the queue, so `T: Send`
// is the full requirement.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

fn alloc_slots<T>(capacity: usize) -> Box<[Slot<T>]> {
    (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect()
}

impl<T> Ring<T> {
    fn new() -> Self {
        Ring {
            buffer: UnsafeCell::new(alloc_slots(INITIAL_CAPACITY)),
            mask: AtomicUsize::new(INITIAL_CAPACITY - 1),
            head: AtomicI64::new(0),
            tail: AtomicI64::new(0),
            foreign: Mutex::new(()),
        }
    }

    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (tail - head).max(0) as usize
    }

    /// Tries the foreign lock until the deadline. `None` on timeout.
    fn lock_foreign_bounded(&self, wait: Duration) -> Option<MutexGuard<'_, ()>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Ok(guard) = self.foreign.try_lock() {
                return Some(guard);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }

    /// Reads the slot at `index` out of the ring.
    ///
    /// Safety: the caller must hold exclusive claim to `index` under the
    /// head/tail protocol.
    unsafe fn take(&self, index: i64) -> T {
        let mask = self.mask.load(Ordering::Relaxed);
        let buffer = &*self.buffer.get();
        (*buffer[(index as usize) & mask].get()).assume_init_read()
    }

    /// Writes `value` into the slot at `index`.
    ///
    /// Safety: owner-only, and `index` must be an unoccupied slot.
    unsafe fn put(&self, index: i64, value: T) {
        let mask = self.mask.load(Ordering::Relaxed);
        let buffer = &*self.buffer.get();
        (*buffer[(index as usize) & mask].get()).write(value);
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mask = *self.mask.get_mut();
        let buffer = self.buffer.get_mut();
        for index in head..tail {
            unsafe {
                (*buffer[(index as usize) & mask].get()).assume_init_drop();
            }
        }
    }
}

/// Creates a connected owner/stealer pair.
pub(crate) fn steal_deque<T: Send>() -> (DequeOwner<T>, DequeStealer<T>) {
    let ring = Arc::new(Ring::new());
    (
        DequeOwner { ring: ring.clone() },
        DequeStealer { ring },
    )
}

/// Owner half: tail-side push and pop. Exactly one per worker; not
/// clonable, so the owner-exclusivity of the protocol holds by
/// construction.
pub(crate) struct DequeOwner<T> {
    ring: Arc<Ring<T>>,
}

impl<T: Send> DequeOwner<T> {
    /// Appends at the tail. Lock-free while the ring has room; grows the
    /// ring under the foreign lock otherwise.
    pub(crate) fn push(&self, value: T) {
        let ring = &self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);
        let mask = ring.mask.load(Ordering::Relaxed) as i64;

        if tail < head + mask {
            unsafe { ring.put(tail, value) };
            ring.tail.store(tail + 1, Ordering::Release);
            return;
        }

        self.push_slow(value);
    }

    /// Full ring: double the capacity and re-index. Stealers are excluded
    /// for the duration, so indices can be rebased to zero.
    fn push_slow(&self, value: T) {
        let ring = &self.ring;
        let _guard = ring.foreign.lock().unwrap();

        let head = ring.head.load(Ordering::Acquire);
        let tail = ring.tail.load(Ordering::Relaxed);
        let count = (tail - head) as usize;
        let old_mask = ring.mask.load(Ordering::Relaxed);

        let capacity = (old_mask + 1) * 2;
        let new_slots = alloc_slots::<T>(capacity);
        unsafe {
            let old = &*ring.buffer.get();
            for offset in 0..count {
                let from = ((head + offset as i64) as usize) & old_mask;
                let item = (*old[from].get()).assume_init_read();
                (*new_slots[offset].get()).write(item);
            }
            *ring.buffer.get() = new_slots;
        }
        ring.mask.store(capacity - 1, Ordering::Relaxed);
        ring.head.store(0, Ordering::Release);
        ring.tail.store(count as i64, Ordering::Release);

        unsafe { ring.put(count as i64, value) };
        ring.tail.store(count as i64 + 1, Ordering::Release);
    }

    /// Removes the most recently pushed item, if any.
    pub(crate) fn pop(&self) -> Option<T> {
        let ring = &self.ring;
        let mut tail = ring.tail.load(Ordering::Relaxed);
        if ring.head.load(Ordering::Acquire) >= tail {
            return None;
        }

        // Publish the decremented tail before re-reading head; the full
        // fence of the exchange is what makes the claim visible to a
        // stealer mid-protocol.
        tail -= 1;
        ring.tail.swap(tail, Ordering::SeqCst);

        if ring.head.load(Ordering::SeqCst) <= tail {
            return Some(unsafe { ring.take(tail) });
        }

        // A stealer may have claimed the same slot. Settle under the lock.
        let _guard = ring.foreign.lock().unwrap();
        if ring.head.load(Ordering::Relaxed) <= tail {
            Some(unsafe { ring.take(tail) })
        } else {
            ring.tail.store(tail + 1, Ordering::Release);
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ring.len()
    }
}

/// Stealer half: head-side removal under the foreign lock. Clonable.
pub(crate) struct DequeStealer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Clone for DequeStealer<T> {
    fn clone(&self) -> Self {
        DequeStealer {
            ring: self.ring.clone(),
        }
    }
}

impl<T: Send> DequeStealer<T> {
    /// Removes the oldest item, waiting at most `wait` for the foreign
    /// lock. `None` if the deque is empty or the lock stayed contended.
    pub(crate) fn steal(&self, wait: Duration) -> Option<T> {
        let ring = &self.ring;
        let _guard = ring.lock_foreign_bounded(wait)?;

        let head = ring.head.load(Ordering::Relaxed);
        ring.head.swap(head + 1, Ordering::SeqCst);

        if head < ring.tail.load(Ordering::SeqCst) {
            Some(unsafe { ring.take(head) })
        } else {
            ring.head.store(head, Ordering::Release);
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    const STEAL_WAIT: Duration = Duration::from_millis(100);

    #[test]
    fn owner_sees_lifo_order() {
        let (owner, _stealer) = steal_deque();
        owner.push(1);
        owner.push(2);
        owner.push(3);
        assert_eq!(owner.pop(), Some(3));
        assert_eq!(owner.pop(), Some(2));
        assert_eq!(owner.pop(), Some(1));
        assert_eq!(owner.pop(), None);
    }

    #[test]
    fn stealer_sees_fifo_order() {
        let (owner, stealer) = steal_deque();
        owner.push(1);
        owner.push(2);
        owner.push(3);
        assert_eq!(stealer.steal(STEAL_WAIT), Some(1));
        assert_eq!(stealer.steal(STEAL_WAIT), Some(2));
        assert_eq!(stealer.steal(STEAL_WAIT), Some(3));
        assert_eq!(stealer.steal(STEAL_WAIT), None);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let (owner, stealer) = steal_deque();
        for i in 0..1000 {
            owner.push(i);
        }
        assert_eq!(owner.len(), 1000);
        assert_eq!(stealer.steal(STEAL_WAIT), Some(0));
        assert_eq!(owner.pop(), Some(999));
        assert_eq!(owner.len(), 998);
    }

    #[test]
    fn growth_preserves_every_element() {
        let (owner, _stealer) = steal_deque();
        for i in 0..100 {
            owner.push(i);
        }
        let mut drained = Vec::new();
        while let Some(v) = owner.pop() {
            drained.push(v);
        }
        drained.reverse();
        assert_eq!(drained, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn len_counts_tail_minus_head() {
        let (owner, stealer) = steal_deque();
        for i in 0..10 {
            owner.push(i);
        }
        stealer.steal(STEAL_WAIT);
        owner.pop();
        assert_eq!(owner.len(), 8);
        assert_eq!(stealer.len(), 8);
    }

    #[test]
    fn concurrent_steal_and_pop_take_each_item_once() {
        let (owner, stealer) = steal_deque();
        let total = 10_000usize;
        let done = Arc::new(AtomicUsize::new(0));

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let stealer = stealer.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    loop {
                        match stealer.steal(STEAL_WAIT) {
                            Some(v) => got.push(v),
                            None => {
                                if done.load(Ordering::Acquire) == 1 && stealer.len() == 0 {
                                    break;
                                }
                                thread::yield_now();
                            }
                        }
                    }
                    got
                })
            })
            .collect();

        let mut owned = Vec::new();
        for i in 0..total {
            owner.push(i);
            if i % 3 == 0 {
                if let Some(v) = owner.pop() {
                    owned.push(v);
                }
            }
        }
        while let Some(v) = owner.pop() {
            owned.push(v);
        }
        done.store(1, Ordering::Release);

        let mut seen: HashSet<usize> = owned.into_iter().collect();
        for thief in thieves {
            for v in thief.join().unwrap() {
                assert!(seen.insert(v), "item {v} taken twice");
            }
        }
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn drops_undrained_items() {
        let counter = Arc::new(AtomicUsize::new(0));
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (owner, stealer) = steal_deque();
        for _ in 0..50 {
            owner.push(Counted(counter.clone()));
        }
        drop(owner.pop());
        drop(stealer.steal(STEAL_WAIT));
        drop(owner);
        drop(stealer);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
