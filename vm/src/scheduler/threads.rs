use serde::Serialize;
use strum_macros::Display;

use super::signals::{SigFrame, Signal};
use crate::{error::EngineError, host::ArchState};

/// Guest thread id. Slot 0 is never used, so valid ids are `1..=max_threads`.
pub type ThreadId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum ThreadStatus {
    Empty,
    Init,
    /// Holds or contends for the big lock.
    Runnable,
    /// Released the big lock for a blocking syscall.
    WaitSys,
    /// Released the big lock at the end of a quantum.
    Yielding,
    /// Exited with a recorded reason; the slot is reclaimed by a later allocation.
    Zombie,
}

impl ThreadStatus {
    fn can_become(self, next: ThreadStatus) -> bool {
        use ThreadStatus::*;
        matches!(
            (self, next),
            (Empty, Init)
                | (Init, Runnable)
                | (Init, Zombie)
                | (Runnable, WaitSys)
                | (Runnable, Yielding)
                | (Runnable, Zombie)
                | (WaitSys, Runnable)
                | (Yielding, Runnable)
                | (Zombie, Empty)
        )
    }

    pub fn is_live(self) -> bool {
        !matches!(self, ThreadStatus::Empty | ThreadStatus::Zombie)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    /// This thread called `exit`.
    Exit(i32),
    /// Some thread called `exit_group`.
    ExitGroup(i32),
    /// A signal whose action is to terminate.
    FatalSignal(Signal),
    /// An engine failure ended the process.
    Fatal,
}

impl ExitReason {
    /// Whether the reason ends every thread of the process.
    pub fn is_group(self) -> bool {
        !matches!(self, ExitReason::Exit(_))
    }
}

pub struct ThreadState {
    pub tid: ThreadId,
    pub status: ThreadStatus,
    /// Native thread running this guest thread, while it runs.
    pub lwp: Option<u64>,
    pub exit_reason: Option<ExitReason>,
    pub arch: Box<ArchState>,
    pub sigframes: Vec<SigFrame>,
    /// Blocks this thread has run, reconciled from its budget after each dispatch.
    pub blocks_done: u64,
}

impl ThreadState {
    fn new(tid: ThreadId) -> Self {
        Self {
            tid,
            status: ThreadStatus::Empty,
            lwp: None,
            exit_reason: None,
            arch: Box::default(),
            sigframes: Vec::new(),
            blocks_done: 0,
        }
    }
}

/// Fixed-size table of guest threads.
pub struct ThreadTable {
    /// Index 0 is a permanently empty placeholder.
    slots: Vec<ThreadState>,
}

impl ThreadTable {
    pub fn new(max_threads: usize) -> Self {
        Self {
            slots: (0..=max_threads.max(1) as ThreadId)
                .map(ThreadState::new)
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Claims a slot and moves it to `Init` with a fresh register file.
    ///
    /// Empty slots are preferred; a zombie is reclaimed only when none is left.
    pub fn alloc(&mut self) -> Result<ThreadId, EngineError> {
        let pick = |status| self.iter().find(|t| t.status == status).map(|t| t.tid);
        let tid = pick(ThreadStatus::Empty)
            .or_else(|| pick(ThreadStatus::Zombie))
            .ok_or(EngineError::ThreadSlotsExhausted(self.capacity()))?;
        if self.status(tid) == Some(ThreadStatus::Zombie) {
            self.set_status(tid, ThreadStatus::Empty)?;
        }
        self.slots[tid as usize] = ThreadState::new(tid);
        self.set_status(tid, ThreadStatus::Init)?;
        Ok(tid)
    }

    pub fn get(&self, tid: ThreadId) -> Option<&ThreadState> {
        self.slots.get(tid as usize).filter(|_| tid != 0)
    }

    pub fn get_mut(&mut self, tid: ThreadId) -> Option<&mut ThreadState> {
        self.slots.get_mut(tid as usize).filter(|_| tid != 0)
    }

    pub fn status(&self, tid: ThreadId) -> Option<ThreadStatus> {
        self.get(tid).map(|t| t.status)
    }

    /// Moves `tid` to `next`, rejecting transitions the lifecycle does not allow.
    pub fn set_status(&mut self, tid: ThreadId, next: ThreadStatus) -> Result<(), EngineError> {
        let thread = self
            .get_mut(tid)
            .ok_or_else(|| EngineError::invariant(format!("no thread slot {tid}")))?;
        if !thread.status.can_become(next) {
            return Err(EngineError::invariant(format!(
                "thread {tid}: illegal transition {} -> {next}",
                thread.status
            )));
        }
        thread.status = next;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadState> {
        self.slots.iter().skip(1)
    }

    pub fn live_count(&self) -> usize {
        self.iter().filter(|t| t.status.is_live()).count()
    }
}
