use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, FromRepr};

/// Guest system calls.
///
/// A guest invokes a syscall with the `syscall` instruction: the number is in
/// `r0`, up to five arguments are in `r1..=r5`, and the result comes back in
/// `r0`. Failures return a negated errno.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    FromRepr,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[repr(u64)]
pub enum SyscallCode {
    /// Ends the calling thread with status `r1`.
    EXIT = 1,
    /// Ends every thread of the process with status `r1`.
    EXIT_GROUP = 2,
    /// `write(fd, buf, len)`.
    WRITE = 3,
    /// Sleeps for `r1` nanoseconds. Interrupted by a signal with `-EINTR`.
    NANOSLEEP = 4,
    SCHED_YIELD = 5,
    GETTID = 6,
    /// `clone(entry, sp, arg)`: starts a thread at `entry` with `r1 = arg`.
    CLONE = 7,
    /// `kill(tid, signo)`.
    KILL = 8,
    /// `sigaction(signo, handler)`: returns the previous handler.
    /// Handler `0` is the default action and `1` ignores the signal.
    SIGACTION = 9,
    /// Returns from a signal handler.
    SIGRETURN = 10,
    /// `mmap(hint, len, prot)`.
    MMAP = 11,
    /// `munmap(addr, len)`.
    MUNMAP = 12,
    /// `mprotect(addr, len, prot)`.
    MPROTECT = 13,
}

impl SyscallCode {
    #[must_use]
    pub fn from_raw(value: u64) -> Option<Self> {
        Self::from_repr(value)
    }
}
