//! Lane-level synchronisation: bounded spin locks and an atomic `f32`.

use serde::{Deserialize, Serialize};
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use thiserror::Error;

/// Retry ceiling for [`SpinLock::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// Busy-wait attempts before yielding.
    pub spin_attempts: u32,
    /// Attempts that yield the worker thread before giving up.
    pub yield_attempts: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            spin_attempts: 64,
            yield_attempts: 1_024,
        }
    }
}

impl LockPolicy {
    /// Total number of acquisition attempts.
    #[must_use]
    pub const fn ceiling(&self) -> u32 {
        self.spin_attempts.saturating_add(self.yield_attempts)
    }
}

/// Raised when a lock stays contended past the policy ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("lock not acquired after {attempts} attempts")]
pub struct LockTimeout {
    pub attempts: u32,
}

/// Test-and-set lock embedded in entities and map slots.
#[derive(Debug, Default)]
pub struct SpinLock {
    flag: AtomicBool,
}

impl SpinLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Single acquisition attempt; never waits.
    pub fn try_lock(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin, then yield, until acquired or the policy ceiling is reached.
    pub fn lock(&self, policy: &LockPolicy) -> Result<SpinGuard<'_>, LockTimeout> {
        let attempts = policy.ceiling().max(1);
        for attempt in 0..attempts {
            if self.try_lock() {
                return Ok(SpinGuard { lock: self });
            }
            if attempt < policy.spin_attempts {
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
        Err(LockTimeout { attempts })
    }

    /// Guard for an acquisition that never waits.
    pub fn try_guard(&self) -> Option<SpinGuard<'_>> {
        self.try_lock().then_some(SpinGuard { lock: self })
    }

    pub fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Release without synchronisation; used by phase-boundary reset passes.
    pub fn reset(&mut self) {
        *self.flag.get_mut() = false;
    }
}

/// Releases the lock on drop.
#[derive(Debug)]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Both locks of an entity pair, acquired in id order.
#[derive(Debug)]
pub struct PairGuard<'a> {
    first: SpinGuard<'a>,
    second: SpinGuard<'a>,
}

impl PairGuard<'_> {
    /// Consume the guard but leave both locks set until the next reset pass.
    pub fn keep_locked(self) {
        let PairGuard { first, second } = self;
        std::mem::forget(first);
        std::mem::forget(second);
    }
}

/// Try to take both locks without waiting. The lower id is always locked first;
/// a failure on the second lock releases the first.
pub fn try_lock_pair<'a>(
    a: (u64, &'a SpinLock),
    b: (u64, &'a SpinLock),
) -> Option<PairGuard<'a>> {
    let (low, high) = if a.0 <= b.0 { (a.1, b.1) } else { (b.1, a.1) };
    if std::ptr::eq(low, high) {
        return None;
    }
    let first = low.try_guard()?;
    let second = high.try_guard()?;
    Some(PairGuard { first, second })
}

/// `f32` stored as bits in an `AtomicU32`; accumulation uses a CAS loop.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    #[must_use]
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[must_use]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Exclusive write, no atomic traffic.
    pub fn set(&mut self, value: f32) {
        *self.0.get_mut() = value.to_bits();
    }

    /// Add `delta` and return the previous value.
    pub fn fetch_add(&self, delta: f32) -> f32 {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f32::from_bits(bits) + delta).to_bits())
            })
            .unwrap_or_else(|bits| bits);
        f32::from_bits(previous)
    }

    /// Add `delta` only if the result stays at or below `limit`.
    pub fn try_add_within(&self, delta: f32, limit: f32) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let sum = f32::from_bits(bits) + delta;
                (sum <= limit).then_some(sum.to_bits())
            })
            .is_ok()
    }
}

impl Clone for AtomicF32 {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpinLock::new();
        {
            let _guard = lock.lock(&LockPolicy::default()).expect("uncontended");
            assert!(lock.is_locked());
            assert!(!lock.try_lock());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn contended_lock_times_out_at_the_ceiling() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        let policy = LockPolicy {
            spin_attempts: 3,
            yield_attempts: 2,
        };
        let err = lock.lock(&policy).expect_err("held lock must time out");
        assert_eq!(err.attempts, 5);
    }

    #[test]
    fn pair_lock_backs_out_when_second_is_held() {
        let a = SpinLock::new();
        let b = SpinLock::new();
        assert!(b.try_lock());
        assert!(try_lock_pair((1, &a), (2, &b)).is_none());
        assert!(!a.is_locked(), "first lock must be released on failure");
        b.unlock();

        let pair = try_lock_pair((2, &b), (1, &a)).expect("both free");
        assert!(a.is_locked() && b.is_locked());
        pair.keep_locked();
        assert!(a.is_locked() && b.is_locked());
    }

    #[test]
    fn pair_lock_rejects_the_same_lock_twice() {
        let a = SpinLock::new();
        assert!(try_lock_pair((1, &a), (1, &a)).is_none());
        assert!(!a.is_locked());
    }

    #[test]
    fn atomic_f32_accumulates_across_lanes() {
        let total = AtomicF32::new(0.0);
        (0..10_000).into_par_iter().for_each(|_| {
            total.fetch_add(0.5);
        });
        assert_eq!(total.load(), 5_000.0);
    }

    #[test]
    fn bounded_add_respects_limit() {
        let value = AtomicF32::new(8.0);
        assert!(value.try_add_within(2.0, 10.0));
        assert!(!value.try_add_within(0.5, 10.0));
        assert_eq!(value.load(), 10.0);
    }
}
