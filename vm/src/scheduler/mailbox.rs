//! Cross-thread requests to one guest thread.
//!
//! Other threads post signals and exit requests here without holding the big
//! lock. Translated code polls [`Mailbox::interrupt_pending`] at every guest
//! instruction boundary; a thread blocked in a syscall sleeps on the doorbell
//! so a post can wake it early.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use super::{signals::Signal, threads::ExitReason};

pub struct Mailbox {
    /// Bit `n` set: signal `n` is pending.
    pending: AtomicU64,
    exit_flag: AtomicBool,
    exit: Mutex<Option<ExitReason>>,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        let (doorbell_tx, doorbell_rx) = bounded(1);
        Self {
            pending: AtomicU64::new(0),
            exit_flag: AtomicBool::new(false),
            exit: Mutex::new(None),
            doorbell_tx,
            doorbell_rx,
        }
    }

    fn ring(&self) {
        // A full doorbell already wakes the sleeper.
        let _ = self.doorbell_tx.try_send(());
    }

    pub fn post_signal(&self, sig: Signal) {
        self.pending.fetch_or(sig.bit(), Ordering::AcqRel);
        self.ring();
    }

    /// Asks the thread to exit. The first request wins; returns whether this one did.
    pub fn request_exit(&self, reason: ExitReason) -> bool {
        let mut exit = self.exit.lock();
        if exit.is_some() {
            return false;
        }
        *exit = Some(reason);
        self.exit_flag.store(true, Ordering::Release);
        drop(exit);
        self.ring();
        true
    }

    pub fn exit_request(&self) -> Option<ExitReason> {
        if !self.exit_flag.load(Ordering::Acquire) {
            return None;
        }
        *self.exit.lock()
    }

    #[inline]
    pub fn interrupt_pending(&self) -> bool {
        self.has_signal() || self.exit_flag.load(Ordering::Acquire)
    }

    pub fn has_signal(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Takes the lowest-numbered pending signal.
    pub fn take_signal(&self) -> Option<Signal> {
        let mut bits = self.pending.load(Ordering::Acquire);
        while bits != 0 {
            let n = bits.trailing_zeros();
            match self.pending.compare_exchange_weak(
                bits,
                bits & !(1 << n),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Signal::from_raw(n as u64),
                Err(now) => bits = now,
            }
        }
        None
    }

    /// Sleeps for up to `timeout`. Returns `true` if the sleep was cut short by
    /// a pending signal or exit request.
    pub fn sleep(&self, timeout: Duration) -> bool {
        while self.doorbell_rx.try_recv().is_ok() {}
        if self.interrupt_pending() {
            return true;
        }
        self.doorbell_rx.recv_timeout(timeout).is_ok() && self.interrupt_pending()
    }

    /// Clears everything, for a slot being handed to a new thread.
    pub fn reset(&self) {
        self.pending.store(0, Ordering::Release);
        *self.exit.lock() = None;
        self.exit_flag.store(false, Ordering::Release);
        while self.doorbell_rx.try_recv().is_ok() {}
    }
}
