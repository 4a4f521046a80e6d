use thiserror::Error;

use crate::guest::GuestMemoryError;

/// Fatal engine conditions. None of these is recoverable: they end `Engine::run`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invariant failed: {0}")]
    InvariantFailed(String),
    #[error("all {0} guest thread slots are in use")]
    ThreadSlotsExhausted(usize),
    #[error("translation of {addr:#x} breaks the translator contract: {reason}")]
    Translation { addr: u64, reason: String },
    #[error("guest memory setup failed: {0}")]
    Memory(#[from] GuestMemoryError),
    #[error("failed to spawn a native thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

impl EngineError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        EngineError::InvariantFailed(msg.into())
    }
}
