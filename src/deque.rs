//! Bounded work-stealing deque.
//!
//! One deque belongs to each worker. The owner pushes and pops at the back
//! (LIFO), any other thread steals from the front (FIFO). This is the
//! fixed-capacity Chase-Lev deque: the only synchronisation the owner needs
//! is a compare-and-swap on `front` when it takes the last remaining item,
//! which is the one case where it can race a thief for the same slot.
//!
//! Items are stored as `u64` bit patterns in atomic slots, so a thief that
//! reads a slot the owner is concurrently rewriting only ever sees a stale
//! value, which its failed CAS then discards.

use crossbeam::deque::Steal;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering, fence};

/// A value that can live in a deque slot.
pub trait DequeItem: Copy {
    fn into_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

impl DequeItem for u64 {
    fn into_bits(self) -> u64 {
        self
    }

    fn from_bits(bits: u64) -> Self {
        bits
    }
}

/// Fixed-capacity ring buffer with an owner end and a thief end.
///
/// `front` and `back` only ever grow; the slot index is the cursor masked by
/// `capacity - 1`.
pub struct WorkStealingDeque<T: DequeItem> {
    front: CachePadded<AtomicIsize>,
    back: CachePadded<AtomicIsize>,
    slots: Box<[AtomicU64]>,
    mask: usize,
    _item: std::marker::PhantomData<T>,
}

impl<T: DequeItem> WorkStealingDeque<T> {
    /// Creates an empty deque.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "deque capacity {capacity} is not a power of two"
        );
        let slots = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            front: CachePadded::new(AtomicIsize::new(0)),
            back: CachePadded::new(AtomicIsize::new(0)),
            slots,
            mask: capacity - 1,
            _item: std::marker::PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate number of queued items. Exact only for the owner when no
    /// steal is in flight.
    pub fn len(&self) -> usize {
        let back = self.back.load(Ordering::Relaxed);
        let front = self.front.load(Ordering::Relaxed);
        (back - front).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, index: isize) -> &AtomicU64 {
        &self.slots[index as usize & self.mask]
    }

    /// Pushes an item at the back. Owner only.
    ///
    /// # Panics
    ///
    /// Panics when the deque already holds `capacity` items.
    pub fn push(&self, item: T) {
        let back = self.back.load(Ordering::Relaxed);
        let front = self.front.load(Ordering::Acquire);
        assert!(
            ((back - front) as usize) < self.capacity(),
            "work-stealing deque overflow ({} slots)",
            self.capacity()
        );

        self.slot(back).store(item.into_bits(), Ordering::Relaxed);
        // Publishes the slot write to thieves that acquire `back`.
        self.back.store(back + 1, Ordering::Release);
    }

    /// Pops the most recently pushed item. Owner only.
    pub fn pop(&self) -> Option<T> {
        let back = self.back.load(Ordering::Relaxed) - 1;
        self.back.store(back, Ordering::Relaxed);
        // The store to `back` must be visible before we read `front`, or a
        // thief and the owner could both take the last item.
        fence(Ordering::SeqCst);
        let front = self.front.load(Ordering::Relaxed);

        if front > back {
            // Empty: undo the reservation.
            self.back.store(back + 1, Ordering::Relaxed);
            return None;
        }

        let bits = self.slot(back).load(Ordering::Relaxed);
        if front == back {
            // Last item: claim it through `front`, the same way a thief would.
            let won = self
                .front
                .compare_exchange(front, front + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.back.store(back + 1, Ordering::Relaxed);
            return won.then(|| T::from_bits(bits));
        }

        Some(T::from_bits(bits))
    }

    /// Takes the oldest item. Callable from any thread.
    ///
    /// Returns [`Steal::Retry`] when another thread claimed the item first.
    pub fn steal(&self) -> Steal<T> {
        let front = self.front.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let back = self.back.load(Ordering::Acquire);

        if front >= back {
            return Steal::Empty;
        }

        let bits = self.slot(front).load(Ordering::Relaxed);
        match self.front.compare_exchange(
            front,
            front + 1,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => Steal::Success(T::from_bits(bits)),
            Err(_) => Steal::Retry,
        }
    }
}
