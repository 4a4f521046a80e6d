//! A dynamic binary translation engine for a small 64-bit guest ISA.
//!
//! Guest code is translated block by block into host words, cached in a
//! sectored translation table and chained together so hot loops never leave
//! translated code. Guest threads map one-to-one onto native threads and
//! take turns under a single big lock.

pub mod dispatch;
pub mod error;
pub mod guest;
pub mod host;
pub mod logger;
pub mod opts;
pub mod scheduler;
pub mod translate;
pub mod transtab;

pub use error::EngineError;
pub use guest::{assemble, Program};
pub use opts::{EngineOpts, SmcCheck};
pub use scheduler::{
    signals::Signal,
    stats::EngineStats,
    syscalls::{HostKernel, Kernel},
    Engine, EngineBuilder, ExitStatus,
};
