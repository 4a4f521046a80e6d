//! The big lock: the single token that lets a native thread run guest code
//! or touch the engine's tables.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, MutexGuard};

static NEXT_LWP: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LWP: u64 = NEXT_LWP.fetch_add(1, Ordering::Relaxed);
}

/// A small, never-zero id for the calling native thread.
pub fn current_lwp() -> u64 {
    LWP.with(|id| *id)
}

/// Ownership bookkeeping that can be read without taking the lock.
#[derive(Debug, Default)]
pub struct LockProbe {
    owner: AtomicU64,
    holders: AtomicUsize,
    max_holders: AtomicUsize,
    acquisitions: AtomicU64,
}

impl LockProbe {
    fn acquired(&self) {
        let holders = self.holders.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_holders.fetch_max(holders, Ordering::AcqRel);
        self.owner.store(current_lwp(), Ordering::Release);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn releasing(&self) {
        self.owner.store(0, Ordering::Release);
        self.holders.fetch_sub(1, Ordering::AcqRel);
    }

    /// The lwp of the current holder.
    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            lwp => Some(lwp),
        }
    }

    pub fn held_by_current(&self) -> bool {
        self.owner() == Some(current_lwp())
    }

    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    /// Most holders ever seen at once. Anything above one is a bug.
    pub fn max_holders(&self) -> usize {
        self.max_holders.load(Ordering::Acquire)
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

pub struct BigLock<T> {
    inner: Mutex<T>,
    probe: Arc<LockProbe>,
}

impl<T> BigLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            probe: Arc::default(),
        }
    }

    pub fn lock(&self) -> BigLockGuard<'_, T> {
        let guard = self.inner.lock();
        self.probe.acquired();
        BigLockGuard {
            guard,
            probe: &self.probe,
        }
    }

    pub fn probe(&self) -> Arc<LockProbe> {
        Arc::clone(&self.probe)
    }
}

pub struct BigLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    probe: &'a LockProbe,
}

impl<T> BigLockGuard<'_, T> {
    /// Runs `f` with the lock released, for a call that may block.
    pub fn release_while<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.probe.releasing();
        let out = MutexGuard::unlocked(&mut self.guard, f);
        self.probe.acquired();
        out
    }

    /// Hands the lock to the longest waiter, runs `f`, and queues to get it back.
    pub fn yield_while<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.probe.releasing();
        let out = MutexGuard::unlocked_fair(&mut self.guard, f);
        self.probe.acquired();
        out
    }
}

impl<T> Deref for BigLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for BigLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for BigLockGuard<'_, T> {
    fn drop(&mut self) {
        self.probe.releasing();
    }
}
