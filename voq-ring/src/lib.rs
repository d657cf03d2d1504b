//! A contiguous, fixed capacity circular queue of owned handles
//!
//! It is lock-free on both ends. Producers claim a run of slots by moving the `head` index
//! and then publish every slot individually; the single consumer walks the published slots
//! and hands them back by moving the `tail` index.
//!
//! Two flavours exist, picked at creation time:
//!     SpSc - one producer, one consumer
//!     MpSc - many producers (compare-and-swap on the head index), one consumer
//!
//! Every ring has exactly one consuming thread. Burst operations never block: a full ring
//! accepts fewer items (possibly none) and an empty ring yields nothing. What to do with
//! the items that did not fit is the caller's decision.

use std::{
    cell::UnsafeCell,
    fmt,
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam::utils::CachePadded;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("ring capacity {} is not a power of two", _0)]
    NotPowerOfTwo(usize),
    #[error("ring capacity must be non zero")]
    ZeroCapacity,
}

/// Producer discipline of a ring
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingType {
    SpSc,
    MpSc,
}

struct Slot<T> {
    // position + 1 of the element published in this slot
    seq: AtomicUsize,
    val: UnsafeCell<MaybeUninit<T>>,
}

#[repr(align(64))]
pub struct Ring<T> {
    rtype: RingType,
    mask: usize,
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    // guards that keep a misbehaving second producer (SpSc) or consumer from racing
    enq_busy: AtomicBool,
    deq_busy: AtomicBool,
}

unsafe impl<T: Send> Sync for Ring<T> {}
unsafe impl<T: Send> Send for Ring<T> {}

impl<T> Ring<T> {
    /// Create a new Ring holding up to `capacity` handles
    pub fn new(capacity: usize, rtype: RingType) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }
        if !capacity.is_power_of_two() {
            return Err(RingError::NotPowerOfTwo(capacity));
        }
        let slots = (0..capacity)
            .map(|_| Slot {
                seq: AtomicUsize::new(0),
                val: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            rtype,
            mask: capacity - 1,
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            enq_busy: AtomicBool::new(false),
            deq_busy: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    pub fn rtype(&self) -> RingType {
        self.rtype
    }

    /// Number of handles currently held, claimed but unpublished slots included
    #[inline]
    pub fn count(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.capacity())
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.capacity() - self.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() == self.capacity()
    }

    /// Push as many items from the front of `items` as fit
    ///
    /// The pushed items are removed from `items`; the rest stay with the caller.
    /// Returns the number pushed, 0 on a full ring.
    pub fn enqueue_burst(&self, items: &mut Vec<T>) -> usize {
        if items.is_empty() {
            return 0;
        }
        match self.rtype {
            RingType::SpSc => {
                if self.enq_busy.swap(true, Ordering::Acquire) {
                    return 0;
                }
                let n = self.enqueue_sp(items);
                self.enq_busy.store(false, Ordering::Release);
                n
            }
            RingType::MpSc => self.enqueue_mp(items),
        }
    }

    fn enqueue_sp(&self, items: &mut Vec<T>) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let free = self.capacity() - head.wrapping_sub(tail);
        let n = free.min(items.len());
        if n == 0 {
            return 0;
        }
        self.head.store(head.wrapping_add(n), Ordering::Relaxed);
        self.publish(head, items, n);
        n
    }

    fn enqueue_mp(&self, items: &mut Vec<T>) -> usize {
        let cap = self.capacity();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            let used = head.wrapping_sub(tail);
            if used > cap {
                // stale head, another producer moved on
                std::hint::spin_loop();
                continue;
            }
            let n = (cap - used).min(items.len());
            if n == 0 {
                return 0;
            }
            if self
                .head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(n),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.publish(head, items, n);
                return n;
            }
        }
    }

    #[inline]
    fn publish(&self, start: usize, items: &mut Vec<T>, n: usize) {
        for (i, item) in items.drain(..n).enumerate() {
            let pos = start.wrapping_add(i);
            let slot = &self.slots[pos & self.mask];
            unsafe {
                (*slot.val.get()).as_mut_ptr().write(item);
            }
            slot.seq.store(pos.wrapping_add(1), Ordering::Release);
        }
    }

    /// Pop up to `max` published handles, appending them to `out`
    ///
    /// Returns the number popped, 0 on an empty ring.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        if max == 0 || self.deq_busy.swap(true, Ordering::Acquire) {
            return 0;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        let mut n = 0;
        while n < max {
            let pos = tail.wrapping_add(n);
            let slot = &self.slots[pos & self.mask];
            if slot.seq.load(Ordering::Acquire) != pos.wrapping_add(1) {
                break;
            }
            out.push(unsafe { (*slot.val.get()).as_ptr().read() });
            n += 1;
        }
        if n > 0 {
            self.tail.store(tail.wrapping_add(n), Ordering::Release);
        }
        self.deq_busy.store(false, Ordering::Release);
        n
    }

    /// Push a single handle, giving it back if the ring is full
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut one = vec![item];
        match self.enqueue_burst(&mut one) {
            1 => Ok(()),
            _ => Err(one.remove(0)),
        }
    }

    /// Pop a single handle
    pub fn dequeue(&self) -> Option<T> {
        let mut one = Vec::with_capacity(1);
        self.dequeue_burst(&mut one, 1);
        one.pop()
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("type", &self.rtype)
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .finish()
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut rest = Vec::with_capacity(self.capacity());
        while self.dequeue_burst(&mut rest, self.capacity()) > 0 {}
    }
}
