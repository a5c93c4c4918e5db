//! Fixed-capacity open-addressed map with one spin lock per slot.
//!
//! Probing locks exactly one slot at a time and releases it before moving on,
//! so two lanes can never wait on each other. Entries are never removed
//! individually, which lets lookups stop at the first free slot.

use crate::sync::{LockPolicy, LockTimeout, SpinLock};
use std::cell::UnsafeCell;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Failures reported by [`ConcurrentHashMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// Every slot is occupied by another key. Tables must be sized for the peak key count.
    #[error("concurrent map full (capacity {capacity})")]
    CapacityExhausted { capacity: usize },
    #[error("key not present")]
    NotFound,
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),
}

struct Slot<K, V> {
    lock: SpinLock,
    entry: UnsafeCell<Option<(K, V)>>,
}

// SAFETY: `entry` is only read or written while `lock` is held (or through `&mut self`).
unsafe impl<K: Send, V: Send> Sync for Slot<K, V> {}

/// Concurrent `K -> V` table shared by the lanes of a pass.
pub struct ConcurrentHashMap<K, V, S = BuildHasherDefault<DefaultHasher>> {
    slots: Box<[Slot<K, V>]>,
    hasher: S,
    policy: LockPolicy,
    occupied: AtomicUsize,
}

impl<K, V> ConcurrentHashMap<K, V>
where
    K: Hash + Eq + Copy,
    V: Copy,
{
    #[must_use]
    pub fn with_capacity(capacity: usize, policy: LockPolicy) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    lock: SpinLock::new(),
                    entry: UnsafeCell::new(None),
                })
                .collect(),
            hasher: BuildHasherDefault::default(),
            policy,
            occupied: AtomicUsize::new(0),
        }
    }
}

impl<K, V, S> ConcurrentHashMap<K, V, S>
where
    K: Hash + Eq + Copy,
    V: Copy,
    S: BuildHasher,
{
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert `key` or overwrite its value.
    pub fn insert_or_assign(&self, key: K, value: V) -> Result<(), MapError> {
        let capacity = self.capacity();
        for slot in self.probe(&key) {
            let _guard = slot.lock.lock(&self.policy)?;
            // SAFETY: the slot lock is held for the lifetime of this borrow.
            let entry = unsafe { &mut *slot.entry.get() };
            if let Some((existing, current)) = entry.as_mut() {
                if *existing == key {
                    *current = value;
                    return Ok(());
                }
                continue;
            }
            *entry = Some((key, value));
            self.occupied.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        Err(MapError::CapacityExhausted { capacity })
    }

    /// Value stored for `key`.
    pub fn at(&self, key: K) -> Result<V, MapError> {
        for slot in self.probe(&key) {
            let _guard = slot.lock.lock(&self.policy)?;
            // SAFETY: the slot lock is held for the lifetime of this borrow.
            let entry = unsafe { &*slot.entry.get() };
            match entry {
                Some((existing, value)) if *existing == key => return Ok(*value),
                Some(_) => {}
                None => return Err(MapError::NotFound),
            }
        }
        Err(MapError::NotFound)
    }

    /// Whether `key` is present. A stalled slot is reported, never read as a miss.
    pub fn contains(&self, key: K) -> Result<bool, MapError> {
        match self.at(key) {
            Ok(_) => Ok(true),
            Err(MapError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot.entry.get_mut() = None;
            slot.lock.reset();
        }
        *self.occupied.get_mut() = 0;
    }

    fn probe(&self, key: &K) -> impl Iterator<Item = &Slot<K, V>> {
        let capacity = self.slots.len();
        let start = if capacity == 0 {
            0
        } else {
            (self.hasher.hash_one(key) % capacity as u64) as usize
        };
        (0..capacity).map(move |offset| &self.slots[(start + offset) % capacity])
    }
}

impl<K, V, S> fmt::Debug for ConcurrentHashMap<K, V, S>
where
    K: Hash + Eq + Copy,
    V: Copy,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentHashMap")
            .field("capacity", &self.slots.len())
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
