//! Real-time safe shared state
//!
//! Two access disciplines for state shared with the render callback:
//! - `try_*` methods return immediately, without effect, when contended.
//!   These are the only ones the render thread may call.
//! - plain methods block and belong to control/background threads.
//!
//! Critical sections are copy-in/copy-out of small values, so the control
//! side never holds a lock for more than a few microseconds.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// ═══════════════════════════════════════════════════════════════════════════
// LOCK-PROTECTED VALUES
// ═══════════════════════════════════════════════════════════════════════════

/// Lock-protected `Copy` value (snapshots, small structs)
#[derive(Debug, Default)]
pub struct RtCell<T: Copy> {
    inner: Mutex<T>,
}

impl<T: Copy> RtCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Copy out without blocking (render thread)
    #[inline]
    pub fn try_read(&self) -> Option<T> {
        self.inner.try_lock().map(|guard| *guard)
    }

    /// Copy out, waiting for the lock
    #[inline]
    pub fn read(&self) -> T {
        *self.inner.lock()
    }

    #[inline]
    pub fn write(&self, value: T) {
        *self.inner.lock() = value;
    }
}

/// Lock-protected table read in place through a closure
///
/// Readers never clone the table, so the render thread can look entries up
/// without allocating.
#[derive(Debug, Default)]
pub struct RtShared<T> {
    inner: Mutex<T>,
}

impl<T> RtShared<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Run `f` if the lock is free (render thread)
    #[inline]
    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.try_lock().map(|guard| f(&guard))
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Swap in a fully built replacement; the old value is dropped here,
    /// on the calling (control) thread
    pub fn replace(&self, value: T) -> T {
        std::mem::replace(&mut *self.inner.lock(), value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOCK-FREE SCALARS
// ═══════════════════════════════════════════════════════════════════════════

/// Monotonic event counter
#[derive(Debug, Default)]
pub struct RtCounter {
    value: AtomicU64,
}

impl RtCounter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment, returns the new count
    #[inline]
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        self.value.fetch_add(n, Ordering::Relaxed) + n
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Tracks the largest value observed (peak occupancy, worst latency)
#[derive(Debug, Default)]
pub struct RtMaxTracker {
    value: AtomicU64,
}

impl RtMaxTracker {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Raise the maximum, retrying until it sticks
    #[inline]
    pub fn observe(&self, value: u64) {
        self.value.fetch_max(value, Ordering::Relaxed);
    }

    /// Single compare-exchange attempt; `false` if another writer won the race
    #[inline]
    pub fn try_observe(&self, value: u64) -> bool {
        let current = self.value.load(Ordering::Relaxed);
        if value <= current {
            return true;
        }
        self.value
            .compare_exchange(current, value, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Boolean shared across threads
#[derive(Debug, Default)]
pub struct RtFlag {
    value: AtomicBool,
}

impl RtFlag {
    pub const fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::Release);
    }

    /// Set to `true`, returning the previous value
    #[inline]
    pub fn raise(&self) -> bool {
        self.value.swap(true, Ordering::AcqRel)
    }
}
