//! Pre-sized entity storage with lock-free allocation and generation swapping.
//!
//! An [`Arena`] hands out index ranges by bumping an atomic counter. Lanes that
//! allocate during a pass only receive indices; the pass collects the new
//! entities and writes them into the reserved slots once it has exclusive
//! access again. [`Generations`] pairs two arenas and implements the garbage
//! collector: live entities are copied from current into next, then the two
//! swap roles.

use rayon::prelude::*;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Storable entity kinds.
pub trait ArenaEntity: Default + Clone + Send + Sync {
    /// Dead entities are dropped by the next compaction.
    fn is_alive(&self) -> bool;
}

/// Fixed-capacity store for one entity kind.
#[derive(Debug)]
pub struct Arena<T> {
    items: Vec<T>,
    count: AtomicUsize,
    overflow: AtomicBool,
}

impl<T: ArenaEntity> Arena<T> {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: std::iter::repeat_with(T::default).take(capacity).collect(),
            count: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Reserve `n` consecutive slots. Returns `None` and raises the overflow flag
    /// when the range would not fit; the counter is left untouched in that case.
    pub fn allocate(&self, n: usize) -> Option<Range<usize>> {
        let capacity = self.items.len();
        match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_add(n).filter(|end| *end <= capacity)
            }) {
            Ok(start) => Some(start..start + n),
            Err(_) => {
                self.overflow.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Write an entity into a slot previously reserved by [`Arena::allocate`].
    pub fn put(&mut self, index: usize, value: T) -> bool {
        if index >= self.count() {
            return false;
        }
        self.items[index] = value;
        true
    }

    /// Allocate one slot and fill it.
    pub fn push(&mut self, value: T) -> Option<usize> {
        let index = self.allocate(1)?.start;
        self.items[index] = value;
        Some(index)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(index)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.items[..self.count()]
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let count = *self.count.get_mut();
        &mut self.items[..count]
    }

    /// Reallocate with a larger backing store and copy the occupied prefix.
    pub fn grow(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity() {
            return;
        }
        let mut items = Vec::with_capacity(new_capacity);
        items.extend(self.as_slice().iter().cloned());
        items.resize_with(new_capacity, T::default);
        self.items = items;
    }

    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Read and reset the overflow flag.
    pub fn take_overflow(&mut self) -> bool {
        std::mem::take(self.overflow.get_mut())
    }

    /// Drop every entity; capacity is kept.
    pub fn clear(&mut self) {
        self.as_mut_slice()
            .par_iter_mut()
            .for_each(|slot| *slot = T::default());
        *self.count.get_mut() = 0;
    }

    /// Overwrite the store with `values` (must fit).
    fn fill_from(&mut self, values: Vec<T>) {
        let len = values.len();
        debug_assert!(len <= self.capacity());
        self.items[..len]
            .par_iter_mut()
            .zip(values.into_par_iter())
            .for_each(|(slot, value)| *slot = value);
        *self.count.get_mut() = len;
    }
}

/// Old-index to new-index table produced by a compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Remap {
    table: Vec<u32>,
    live: usize,
}

impl Remap {
    const DROPPED: u32 = u32::MAX;

    /// New index of `old`, or `None` when the entity was dropped.
    #[must_use]
    pub fn get(&self, old: u32) -> Option<u32> {
        match self.table.get(old as usize) {
            Some(&Self::DROPPED) | None => None,
            Some(&index) => Some(index),
        }
    }

    /// Number of survivors.
    #[must_use]
    pub const fn live(&self) -> usize {
        self.live
    }

    /// Number of entities examined.
    #[must_use]
    pub fn examined(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn dropped(&self) -> usize {
        self.examined() - self.live
    }
}

/// Current/next arena pair for one entity kind.
#[derive(Debug)]
pub struct Generations<T> {
    buffers: [Arena<T>; 2],
    current: usize,
    swaps: u64,
}

impl<T: ArenaEntity> Generations<T> {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffers: [Arena::with_capacity(capacity), Arena::with_capacity(capacity)],
            current: 0,
            swaps: 0,
        }
    }

    #[must_use]
    pub fn current(&self) -> &Arena<T> {
        &self.buffers[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Arena<T> {
        &mut self.buffers[self.current]
    }

    /// Index of the buffer acting as current (0 or 1).
    #[must_use]
    pub const fn current_slot(&self) -> usize {
        self.current
    }

    #[must_use]
    pub const fn swaps(&self) -> u64 {
        self.swaps
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.current().capacity()
    }

    pub fn swap(&mut self) {
        self.current ^= 1;
        self.swaps += 1;
    }

    /// Grow both buffers to `new_capacity`.
    pub fn grow(&mut self, new_capacity: usize) {
        for buffer in &mut self.buffers {
            buffer.grow(new_capacity);
        }
    }

    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.buffers.iter().any(Arena::overflowed)
    }

    pub fn take_overflow(&mut self) -> bool {
        let [a, b] = &mut self.buffers;
        let first = a.take_overflow();
        let second = b.take_overflow();
        first || second
    }

    pub fn clear(&mut self) {
        for buffer in &mut self.buffers {
            buffer.clear();
        }
    }

    /// Copy live entities into next and swap.
    pub fn compact(&mut self) -> Remap {
        self.compact_with(|_| true)
    }

    /// Copy entities that are alive and satisfy `keep` into next, preserving
    /// order, then swap. The returned table maps old indices to new ones.
    pub fn compact_with(&mut self, keep: impl Fn(&T) -> bool + Sync) -> Remap {
        let source = self.current().as_slice();
        let flags: Vec<bool> = source
            .par_iter()
            .map(|entity| entity.is_alive() && keep(entity))
            .collect();

        let mut table = Vec::with_capacity(flags.len());
        let mut live = 0u32;
        for &kept in &flags {
            if kept {
                table.push(live);
                live += 1;
            } else {
                table.push(Remap::DROPPED);
            }
        }

        let survivors: Vec<T> = source
            .par_iter()
            .zip(flags.par_iter())
            .filter(|(_, kept)| **kept)
            .map(|(entity, _)| entity.clone())
            .collect();

        let next = self.current ^ 1;
        self.buffers[next].fill_from(survivors);
        self.swap();
        Remap {
            table,
            live: live as usize,
        }
    }
}
