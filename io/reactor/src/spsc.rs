//! A bounded, wait-free single-producer/single-consumer ring queue.
//!
//! The queue is a ring of slots with two indexes: the producer writes at the
//! tail, the consumer reads at the head. Only the producer mutates the tail;
//! only the consumer mutates the head. Both sides are wait-free.
//!
//! Memory ordering: the producer's slot write happens before its release
//! store of the tail, which synchronizes with the consumer's acquire load of
//! the tail in [`Queue::front`]/[`Queue::pop`]. Symmetrically, the
//! consumer's slot read happens before its release store of the head, which
//! keeps the producer from reusing a slot too early.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Bounded SPSC ring queue.
///
/// One dedicated producer thread may call [`try_push`](Queue::try_push);
/// one dedicated consumer thread may call [`front`](Queue::front) and
/// [`pop`](Queue::pop). The head and tail indexes live on separate cache
/// lines to prevent false sharing.
pub struct Queue<T> {
    /// Consumer index. Written only by the consumer.
    head: CachePadded<AtomicUsize>,
    /// Producer index. Written only by the producer.
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: the SPSC discipline (exactly one producer thread, exactly one
// consumer thread) makes every slot accessed by at most one thread at a
// time, with head/tail acquire/release ordering the handoff.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Create a queue with room for `capacity` elements.
    ///
    /// One slot is kept empty to distinguish full from empty, so the ring
    /// allocates `capacity + 1` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        let slots = (0..capacity + 1)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots,
        }
    }

    /// Maximum number of elements the queue can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    fn next(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slots.len() { 0 } else { next }
    }

    /// Producer side: enqueue `value`, or hand it back when the ring is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = self.next(tail);
        if next == self.head.load(Ordering::Acquire) {
            return Err(value);
        }
        // SAFETY: the slot at `tail` is not visible to the consumer until
        // the release store below, and no other producer exists.
        unsafe {
            (*self.slots[tail].get()).write(value);
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side: peek at the oldest element without removing it.
    pub fn front(&self) -> Option<&T> {
        let head = self.head.load(Ordering::Relaxed);
        if self.tail.load(Ordering::Acquire) == head {
            return None;
        }
        // SAFETY: the acquire load of tail ordered the producer's slot
        // write before this read, and only the consumer touches `head`.
        Some(unsafe { (*self.slots[head].get()).assume_init_ref() })
    }

    /// Consumer side: dequeue the oldest element.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if self.tail.load(Ordering::Acquire) == head {
            return None;
        }
        // SAFETY: as in `front`; the value is moved out exactly once and
        // the release store below lets the producer reuse the slot.
        let value = unsafe { (*self.slots[head].get()).assume_init_read() };
        self.head.store(self.next(head), Ordering::Release);
        Some(value)
    }

    /// Whether the queue currently holds no elements.
    ///
    /// Racy by nature; useful for "anything pending?" checks.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
