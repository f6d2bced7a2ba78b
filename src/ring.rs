//! Fixed-capacity single-producer/single-consumer ring.
//!
//! Slots are allocated once and reused. Appending is two-phase: the producer
//! reserves the tail slot, fills it in place, then commits to make it
//! visible. Consuming is two-phase as well: the consumer peeks the head
//! slot (and may mutate it in place), then advances past it.
//!
//! ```text
//!            head (consumer)          tail (producer)
//!              │                        │
//!   ┌────┬────┬▼───┬────┬────┬────┬────▼┬────┐
//!   │    │    │ c  │ c  │ c  │ c  │ r   │    │
//!   └────┴────┴────┴────┴────┴────┴─────┴────┘
//!              committed, visible    reserved, private
//! ```
//!
//! Ownership of the two halves enforces the single producer and single
//! consumer: neither [`Producer`] nor [`Consumer`] is `Clone`.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Returned when the producer has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

/// Keeps head and tail on separate cache lines.
#[repr(align(64))]
struct CachePadded<T>(T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

struct Shared<T> {
    slots: Box<[UnsafeCell<T>]>,
    mask: usize,
    /// Next slot the consumer will read. Written only by the consumer.
    head: CachePadded<AtomicUsize>,
    /// Next slot the producer will fill. Written only by the producer.
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: a slot is only ever accessed by one side at a time. Slots in
// [head, tail) belong to the consumer, all others to the producer, and the
// hand-off happens through release stores paired with acquire loads.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// # Safety
    /// The caller must own the slot at `pos` under the head/tail protocol.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn slot_mut(&self, pos: usize) -> &mut T {
        &mut *self.slots[pos & self.mask].get()
    }
}

/// Create a ring with at least `capacity` slots, each initialized with
/// `T::default()`.
///
/// The capacity is rounded up to a power of two (minimum 1).
pub fn ring<T: Default>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = capacity.max(1).next_power_of_two();
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(T::default()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(Shared {
        slots,
        mask: capacity - 1,
        head: CachePadded(AtomicUsize::new(0)),
        tail: CachePadded(AtomicUsize::new(0)),
    });

    (
        Producer {
            shared: Arc::clone(&shared),
            tail: 0,
            reserved: false,
        },
        Consumer { shared, head: 0 },
    )
}

/// Appending half of a ring.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    /// Local copy of the tail; the producer is its only writer.
    tail: usize,
    reserved: bool,
}

impl<T> Producer<T> {
    /// Reserve the tail slot for filling.
    ///
    /// The slot keeps whatever it held last time around, so callers can
    /// overwrite it in place. It stays invisible to the consumer until
    /// [`commit`](Self::commit). Reserving again before committing hands
    /// back the same slot.
    pub fn reserve(&mut self) -> Result<&mut T, RingFull> {
        let head = self.shared.head.load(Ordering::Acquire);
        if self.tail.wrapping_sub(head) >= self.shared.capacity() {
            return Err(RingFull);
        }
        self.reserved = true;
        // SAFETY: the tail slot is outside [head, tail) so the consumer
        // cannot touch it, and the returned borrow is tied to `&mut self`.
        Ok(unsafe { self.shared.slot_mut(self.tail) })
    }

    /// Publish the reserved slot to the consumer.
    ///
    /// Does nothing if no slot is reserved.
    pub fn commit(&mut self) {
        if !self.reserved {
            return;
        }
        self.reserved = false;
        self.tail = self.tail.wrapping_add(1);
        self.shared.tail.store(self.tail, Ordering::Release);
    }

    /// Number of committed slots not yet consumed.
    pub fn len(&self) -> usize {
        self.tail
            .wrapping_sub(self.shared.head.load(Ordering::Acquire))
    }

    /// Whether every committed slot has been consumed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Consuming half of a ring.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    /// Local copy of the head; the consumer is its only writer.
    head: usize,
}

impl<T> Consumer<T> {
    /// The oldest committed slot, if any.
    ///
    /// The slot may be mutated in place; it is handed back to the producer
    /// only on [`advance`](Self::advance).
    pub fn peek(&mut self) -> Option<&mut T> {
        let tail = self.shared.tail.load(Ordering::Acquire);
        if self.head == tail {
            return None;
        }
        // SAFETY: head is in [head, tail), which the producer never touches
        // until the head store below releases it.
        Some(unsafe { self.shared.slot_mut(self.head) })
    }

    /// Release the head slot back to the producer.
    ///
    /// Does nothing if the ring is empty.
    pub fn advance(&mut self) {
        if self.head == self.shared.tail.load(Ordering::Acquire) {
            return;
        }
        self.head = self.head.wrapping_add(1);
        self.shared.head.store(self.head, Ordering::Release);
    }

    /// Number of committed slots waiting to be consumed.
    pub fn len(&self) -> usize {
        self.shared
            .tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head)
    }

    /// Whether there is nothing to consume.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("len", &self.len()).finish()
    }
}
