//! Translation of guest code into host words.

use thiserror::Error;

use crate::{
    guest::{DecodeError, GuestMemory, GuestMemoryError},
    opts::{EngineOpts, SmcCheck},
};

pub mod block;

pub use block::BlockTranslator;

/// What the scheduler asks of a translator on a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateRequest {
    pub guest: u64,
    pub max_insns: u32,
    /// Emit patchable chain sites for direct exits.
    pub chaining: bool,
    /// Let forward direct exits enter their target past its event check.
    pub fast_entry: bool,
    pub smc_check: SmcCheck,
}

impl TranslateRequest {
    pub fn new(guest: u64, opts: &EngineOpts) -> Self {
        Self {
            guest,
            max_insns: opts.max_insns_per_block.max(1),
            chaining: opts.chaining,
            fast_entry: opts.fast_entry,
            smc_check: opts.smc_check,
        }
    }
}

/// A patchable chain site inside a [`Translation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteSpec {
    /// Word offset from the start of the translation.
    pub offset: u32,
    /// Guest address the site transfers to.
    pub target: u64,
    /// Chain to the target's fast entry.
    pub fast: bool,
}

/// Host code for one guest block.
///
/// `code[0]` is the event check and the only one in the block; every site in
/// `sites` holds a chain-me placeholder of the matching flavour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub guest_len: u64,
    pub n_guest_insns: u32,
    pub code: Vec<u64>,
    pub sites: Vec<SiteSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("cannot fetch guest code at {addr:#x}: {source}")]
    Fetch {
        addr: u64,
        #[source]
        source: GuestMemoryError,
    },
    #[error("undecodable guest instruction at {addr:#x}: {source}")]
    Undecodable {
        addr: u64,
        #[source]
        source: DecodeError,
    },
    #[error("guest code address {0:#x} is not instruction aligned")]
    Misaligned(u64),
    #[error("guest address {0:#x} cannot be encoded in host code")]
    AddressRange(u64),
}

impl TranslateError {
    pub fn addr(&self) -> u64 {
        match *self {
            TranslateError::Fetch { addr, .. }
            | TranslateError::Undecodable { addr, .. }
            | TranslateError::Misaligned(addr)
            | TranslateError::AddressRange(addr) => addr,
        }
    }
}

/// Produces host code for a guest address. Invoked only on a cache miss.
pub trait Translator: Send {
    fn translate(
        &mut self,
        mem: &GuestMemory,
        req: &TranslateRequest,
    ) -> Result<Translation, TranslateError>;
}

impl<T: Translator + ?Sized> Translator for Box<T> {
    fn translate(
        &mut self,
        mem: &GuestMemory,
        req: &TranslateRequest,
    ) -> Result<Translation, TranslateError> {
        (**self).translate(mem, req)
    }
}
