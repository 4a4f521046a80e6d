//! Client requests: calls from the guest into the engine itself.
//!
//! A guest issues one with the `creq` instruction after loading
//! [`CLIENT_REQUEST_MAGIC`] into `r7`, the request code into `r1` and up to
//! five arguments into `r2..=r6`. The result is written to `r0`. Without the
//! magic, or for an unknown code, `r0` is left alone, so a guest that
//! preloads a default into `r0` behaves the same natively and on the engine.

use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, FromRepr};
use tracing::{debug, info};

use super::{state::Core, syscalls::errno, threads::ThreadId};
use crate::{
    error::EngineError,
    guest::{GuestMemory, Perms},
};

/// "SHUN"
pub const CLIENT_REQUEST_MAGIC: u64 = 0x5348_554e;
pub const MAGIC_REG: u8 = 7;
pub const CODE_REG: u8 = 1;
pub const FIRST_ARG_REG: u8 = 2;
pub const RESULT_REG: u8 = 0;

/// Longer `PRINT` requests are truncated.
const MAX_PRINT: u64 = 1 << 16;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, Serialize, Deserialize,
)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[repr(u64)]
pub enum ClientRequestCode {
    /// Returns 1.
    RUNNING_ON_ENGINE = 0x1001,
    /// `(addr, len)`: discards translations of the range, returns how many.
    DISCARD_TRANSLATIONS = 0x1002,
    /// Blocks the calling thread has run so far.
    BLOCKS_DONE = 0x1003,
    /// `(addr, len)`: logs guest text, returns the bytes logged.
    PRINT = 0x1004,
}

pub struct RequestContext<'a> {
    pub tid: ThreadId,
    pub(crate) core: &'a mut Core,
}

impl RequestContext<'_> {
    pub fn memory(&self) -> &GuestMemory {
        &self.core.mem
    }

    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.core.mem
    }

    /// Discards translations of `[addr, addr + len)`; returns how many went.
    pub fn discard_translations(&mut self, addr: u64, len: u64) -> usize {
        self.core.cache.discard(addr, len, "client request")
    }
}

pub trait ClientRequest: Send + Sync {
    /// Services the request; the result goes to `r0`.
    fn handle(&self, ctx: &mut RequestContext, args: [u64; 5]) -> Result<u64, EngineError>;
}

impl<F> ClientRequest for F
where
    F: Fn(&mut RequestContext, [u64; 5]) -> u64 + Send + Sync,
{
    fn handle(&self, ctx: &mut RequestContext, args: [u64; 5]) -> Result<u64, EngineError> {
        Ok(self(ctx, args))
    }
}

pub type ClientRequests = HashMap<u64, Arc<dyn ClientRequest>>;

struct RunningOnEngine;

impl ClientRequest for RunningOnEngine {
    fn handle(&self, _: &mut RequestContext, _: [u64; 5]) -> Result<u64, EngineError> {
        Ok(1)
    }
}

struct DiscardTranslations;

impl ClientRequest for DiscardTranslations {
    fn handle(&self, ctx: &mut RequestContext, args: [u64; 5]) -> Result<u64, EngineError> {
        Ok(ctx.discard_translations(args[0], args[1]) as u64)
    }
}

struct BlocksDone;

impl ClientRequest for BlocksDone {
    fn handle(&self, ctx: &mut RequestContext, _: [u64; 5]) -> Result<u64, EngineError> {
        Ok(ctx.core.thread_mut(ctx.tid)?.blocks_done)
    }
}

struct Print;

impl ClientRequest for Print {
    fn handle(&self, ctx: &mut RequestContext, args: [u64; 5]) -> Result<u64, EngineError> {
        let [addr, len, ..] = args;
        let len = len.min(MAX_PRINT);
        match ctx.memory().read_vec(addr, len as usize, Perms::READ) {
            Ok(bytes) => {
                info!(tid = ctx.tid, "{}", String::from_utf8_lossy(&bytes));
                Ok(len)
            }
            Err(_) => Ok(errno::neg(errno::EFAULT)),
        }
    }
}

#[must_use]
pub fn default_client_requests() -> ClientRequests {
    let mut requests = ClientRequests::default();
    requests.insert(
        ClientRequestCode::RUNNING_ON_ENGINE as u64,
        Arc::new(RunningOnEngine),
    );
    requests.insert(
        ClientRequestCode::DISCARD_TRANSLATIONS as u64,
        Arc::new(DiscardTranslations),
    );
    requests.insert(ClientRequestCode::BLOCKS_DONE as u64, Arc::new(BlocksDone));
    requests.insert(ClientRequestCode::PRINT as u64, Arc::new(Print));
    requests
}

/// Services the client request `tid` just made.
pub(crate) fn service(core: &mut Core, tid: ThreadId) -> Result<(), EngineError> {
    let arch = core.arch_mut(tid)?;
    if arch.reg(MAGIC_REG) != CLIENT_REQUEST_MAGIC {
        return Ok(());
    }
    let code = arch.reg(CODE_REG);
    let args: [u64; 5] = std::array::from_fn(|i| arch.reg(FIRST_ARG_REG + i as u8));
    let Some(handler) = core.requests.get(&code).cloned() else {
        debug!(tid, code = format_args!("{code:#x}"), "unknown client request");
        return Ok(());
    };
    let mut ctx = RequestContext {
        tid,
        core: &mut *core,
    };
    let result = handler.handle(&mut ctx, args)?;
    core.arch_mut(tid)?.set_reg(RESULT_REG, result);
    Ok(())
}
