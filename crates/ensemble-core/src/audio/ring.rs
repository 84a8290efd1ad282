//! Wait-free SPSC ring buffer for audio frames
//!
//! One of these sits on each leg of the audio path: network receive thread
//! pushing into the mixer (ingress) and the mixer pushing back out toward
//! the network (egress). Both operations are wait-free: a full ring drops
//! the new frame, an empty ring returns nothing, and neither side ever
//! blocks or reorders.
//!
//! # Why not a mutex?
//!
//! The mix thread runs every ~2.7ms with a hard deadline. A queue guarded
//! by a mutex would let a preempted network thread stall the mix cycle and
//! turn one late frame into an audible dropout. With a single producer and
//! a single consumer, two atomic indices are all the synchronization the
//! queue needs.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Default capacity in frames: 64 frames is ~170ms of audio at 48kHz/128
/// samples, comfortably more than any jitter the transport produces.
pub const DEFAULT_RING_CAPACITY: usize = 64;

/// Bounded wait-free single-producer/single-consumer ring buffer.
///
/// Elements are `Copy` and moved through the ring by value. Capacity is
/// fixed at construction; one slot is kept empty to distinguish a full
/// ring from an empty one.
///
/// Exactly one thread may call [`try_push`](SpscRing::try_push) at a time
/// and exactly one (possibly different) thread may call
/// [`try_pop`](SpscRing::try_pop). The rooms uphold this structurally: the
/// transport receive thread is the sole ingress producer, the mix thread
/// the sole ingress consumer, and the roles flip on the egress side.
pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot to pop; written only by the consumer.
    head: CachePadded<AtomicUsize>,
    /// Next slot to push; written only by the producer.
    tail: CachePadded<AtomicUsize>,
}

// Safety: the producer writes a slot before publishing it with a release
// store of `tail`; the consumer acquires `tail` before reading the slot and
// releases `head` after. With one producer and one consumer no slot is ever
// accessed from two threads at once.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    /// Create a ring holding up to `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let slots = (0..capacity + 1)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Capacity in elements.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    fn advance(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slots.len() {
            0
        } else {
            next
        }
    }

    /// Non-blocking push. Returns `false` if the ring is full (the frame
    /// is dropped by the caller).
    #[inline]
    pub fn try_push(&self, value: &T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = self.advance(tail);
        if next == self.head.load(Ordering::Acquire) {
            return false; // full
        }
        unsafe {
            (*self.slots[tail].get()).write(*value);
        }
        self.tail.store(next, Ordering::Release);
        true
    }

    /// Non-blocking pop of the oldest element. Returns `false` if the ring
    /// is empty, leaving `out` untouched.
    #[inline]
    pub fn try_pop(&self, out: &mut T) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return false; // empty
        }
        *out = unsafe { (*self.slots[head].get()).assume_init() };
        self.head.store(self.advance(head), Ordering::Release);
        true
    }

    /// Approximate number of queued elements (not exact under concurrent
    /// use; fine for diagnostics).
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.slots.len() - head) % self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
