use serde::Serialize;

use crate::transtab::CacheStats;

/// Scheduler counters, updated under the big lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedStats {
    /// Calls into translated code.
    pub dispatches: u64,
    /// Checked block entries, summed over every thread.
    pub blocks_done: u64,
    pub yields: u64,
    pub polls: u64,
    pub syscalls: u64,
    /// Syscalls that released the big lock.
    pub blocking_syscalls: u64,
    pub client_requests: u64,
    pub chain_requests: u64,
    pub signals_delivered: u64,
    pub translation_failures: u64,
    pub threads_started: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub sched: SchedStats,
}
