//! Bounded lock-free MPMC queue over a fixed node arena.
//!
//! All nodes live in one boxed slice and are addressed by `u32` index. Two
//! intrusive singly-linked lists are threaded through the arena:
//!
//! - the **main** list holds queued items (head/tail, one dummy node at the
//!   head as in the Michael-Scott queue),
//! - the **free** list holds spare capacity (a Treiber stack).
//!
//! Every link word packs `(tag << 32) | index` into a single `AtomicU64`. The
//! tag is bumped on each store, so a compare-and-swap issued from a stale
//! snapshot fails even if the same index has been recycled in the meantime.

use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Index sentinel meaning "no node".
pub const NIL: u32 = u32::MAX;

/// Largest capacity a queue can be created with (the arena needs one extra
/// dummy node and `NIL` must stay unused).
pub const MAX_CAPACITY: usize = (NIL - 1) as usize;

/// An arena index paired with a generation tag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Tagged(u64);

impl Tagged {
    const fn new(index: u32, tag: u32) -> Self {
        Tagged(((tag as u64) << 32) | index as u64)
    }

    const fn index(self) -> u32 {
        self.0 as u32
    }

    const fn tag(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The successor word of `self` pointing at `index`.
    const fn with_index(self, index: u32) -> Self {
        Tagged::new(index, self.tag().wrapping_add(1))
    }
}

struct TaggedAtomic(AtomicU64);

impl TaggedAtomic {
    const fn new(value: Tagged) -> Self {
        TaggedAtomic(AtomicU64::new(value.0))
    }

    fn load(&self) -> Tagged {
        Tagged(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: Tagged) {
        self.0.store(value.0, Ordering::Release);
    }

    fn compare_exchange(&self, current: Tagged, new: Tagged) -> bool {
        self.0
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct Node<T> {
    next: TaggedAtomic,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// A fixed-capacity multi-producer/multi-consumer FIFO queue.
///
/// Payloads are `Copy`: a dequeuer reads the payload before it wins the race
/// for the node, and a losing reader simply discards its copy.
///
/// Exceeding the configured capacity is a programming error and panics.
pub struct LockFreeQueue<T> {
    head: CachePadded<TaggedAtomic>,
    tail: CachePadded<TaggedAtomic>,
    free_head: CachePadded<TaggedAtomic>,
    size: CachePadded<AtomicUsize>,
    capacity: usize,
    nodes: Box<[Node<T>]>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T: Copy> LockFreeQueue<T> {
    /// Creates a queue able to hold `capacity` items at once.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or larger than [`MAX_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= MAX_CAPACITY,
            "LockFreeQueue capacity must be in 1..={MAX_CAPACITY}, got {capacity}"
        );

        // Node 0 is the initial dummy, nodes 1..=capacity form the free list.
        let nodes: Box<[Node<T>]> = (0..=capacity)
            .map(|i| {
                let next = if i == 0 || i == capacity {
                    NIL
                } else {
                    i as u32 + 1
                };
                Node {
                    next: TaggedAtomic::new(Tagged::new(next, 0)),
                    data: UnsafeCell::new(MaybeUninit::uninit()),
                }
            })
            .collect();

        LockFreeQueue {
            head: CachePadded::new(TaggedAtomic::new(Tagged::new(0, 0))),
            tail: CachePadded::new(TaggedAtomic::new(Tagged::new(0, 0))),
            free_head: CachePadded::new(TaggedAtomic::new(Tagged::new(1, 0))),
            size: CachePadded::new(AtomicUsize::new(0)),
            capacity,
            nodes,
        }
    }

    /// Appends `item` to the tail of the queue.
    ///
    /// # Panics
    ///
    /// Panics if the queue already holds `capacity` items. The queue is left
    /// unchanged.
    pub fn enqueue(&self, item: T) {
        assert!(
            self.try_reserve(1),
            "LockFreeQueue capacity exceeded ({} + 1 > {})",
            self.len(),
            self.capacity
        );
        self.enqueue_reserved(item);
    }

    /// Claims room for `count` more items, all or nothing.
    ///
    /// On success the caller must follow up with exactly `count` calls to
    /// [`LockFreeQueue::enqueue_reserved`]. On failure nothing is claimed.
    pub fn try_reserve(&self, count: usize) -> bool {
        let mut size = self.size.load(Ordering::Acquire);
        loop {
            if count > self.capacity - size {
                return false;
            }
            match self.size.compare_exchange_weak(
                size,
                size + count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => size = actual,
            }
        }
    }

    /// Appends `item` into room claimed earlier with
    /// [`LockFreeQueue::try_reserve`].
    pub fn enqueue_reserved(&self, item: T) {
        let Some(index) = self.alloc_node() else {
            panic!("LockFreeQueue free list exhausted below capacity");
        };

        let node = self.node(index);
        // SAFETY: the node was just popped from the free list, no other thread
        // can reach it until it is linked below.
        unsafe {
            (*node.data.get()).write(item);
        }
        let link = node.next.load();
        node.next.store(link.with_index(NIL));

        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load();
            let tail_node = self.node(tail.index());
            let next = tail_node.next.load();

            if tail != self.tail.load() {
                continue;
            }

            if next.index() == NIL {
                if tail_node.next.compare_exchange(next, next.with_index(index)) {
                    // Linked. Swinging the tail may lose against a helper.
                    self.tail.compare_exchange(tail, tail.with_index(index));
                    return;
                }
            } else {
                // Tail is lagging behind a linked node: help it forward.
                self.tail.compare_exchange(tail, tail.with_index(next.index()));
            }
            backoff.spin();
        }
    }

    /// Pops the head of the queue, or returns `None` if it is empty.
    pub fn dequeue(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load();
            let tail = self.tail.load();
            let next = self.node(head.index()).next.load();

            if head != self.head.load() {
                backoff.spin();
                continue;
            }

            if head.index() == tail.index() {
                if next.index() == NIL {
                    return None;
                }
                self.tail.compare_exchange(tail, tail.with_index(next.index()));
            } else if next.index() != NIL {
                // Copy the payload out before the CAS: once the head moves on,
                // another consumer may recycle `next` at any time. The copy is
                // only trusted if the CAS below proves nothing changed.
                let value = unsafe {
                    std::ptr::read_volatile(self.node(next.index()).data.get())
                };
                if self.head.compare_exchange(head, head.with_index(next.index())) {
                    self.free_node(head.index());
                    self.size.fetch_sub(1, Ordering::AcqRel);
                    // SAFETY: `next` was linked by an enqueuer that wrote its
                    // payload before publishing the link.
                    return Some(unsafe { value.assume_init() });
                }
            }
            backoff.spin();
        }
    }

    fn alloc_node(&self) -> Option<u32> {
        let backoff = Backoff::new();
        loop {
            let head = self.free_head.load();
            if head.index() == NIL {
                return None;
            }
            let next = self.node(head.index()).next.load();
            if self.free_head.compare_exchange(head, head.with_index(next.index())) {
                return Some(head.index());
            }
            backoff.spin();
        }
    }

    fn free_node(&self, index: u32) {
        let node = self.node(index);
        let backoff = Backoff::new();
        loop {
            let head = self.free_head.load();
            let link = node.next.load();
            node.next.store(link.with_index(head.index()));
            if self.free_head.compare_exchange(head, head.with_index(index)) {
                return;
            }
            backoff.spin();
        }
    }

    #[inline]
    fn node(&self, index: u32) -> &Node<T> {
        &self.nodes[index as usize]
    }
}

impl<T> LockFreeQueue<T> {
    /// Number of queued items. Racy by nature, exact once producers and
    /// consumers are quiescent.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for LockFreeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
