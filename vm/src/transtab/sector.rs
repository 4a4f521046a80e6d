use std::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use hashbrown::HashMap;

/// Names a translation record: sector plus slot inside the sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TtePtr {
    pub sector: u16,
    pub slot: u32,
}

/// Handle to a patchable chain site.
///
/// The generation ties the handle to one lifetime of its sector, so a handle
/// captured before a recycle is recognised as stale afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchSite {
    pub sector: u16,
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct SiteDesc {
    /// Word offset of the site in the sector arena.
    pub offset: u32,
    /// Slot of the record the site belongs to.
    pub owner: u32,
    pub target: u64,
    pub fast: bool,
    pub patched: Option<TtePtr>,
}

/// One chain edge, stored in the source's `out_edges` and the target's `in_edges`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Edge {
    pub from: TtePtr,
    /// Site index in `from`'s sector.
    pub site: u32,
    pub to: TtePtr,
}

#[derive(Debug, Clone)]
pub struct TransRecord {
    pub guest: u64,
    pub guest_len: u64,
    pub n_guest_insns: u32,
    /// Offset of the checked entry in the sector arena.
    pub entry: u32,
    pub code_len: u32,
    pub(crate) sites: Range<u32>,
    pub(crate) in_edges: Vec<Edge>,
    pub(crate) out_edges: Vec<Edge>,
    pub live: bool,
}

impl TransRecord {
    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        len != 0
            && start < self.guest.saturating_add(self.guest_len)
            && self.guest < start.saturating_add(len)
    }

    #[cfg(test)]
    pub(crate) fn n_sites(&self) -> usize {
        self.sites.len()
    }

    pub fn n_in_edges(&self) -> usize {
        self.in_edges.len()
    }

    pub fn n_out_edges(&self) -> usize {
        self.out_edges.len()
    }
}

pub(crate) struct Sector {
    pub generation: u32,
    /// Allocated the first time the sector is filled.
    pub code: Box<[AtomicU64]>,
    pub used: u32,
    pub records: Vec<TransRecord>,
    pub index: HashMap<u64, u32>,
    /// Sorted by `offset`, since code is appended monotonically.
    pub sites: Vec<SiteDesc>,
    pub n_live: u32,
}

impl Sector {
    pub fn new() -> Self {
        Self {
            generation: 0,
            code: Box::new([]),
            used: 0,
            records: Vec::new(),
            index: HashMap::new(),
            sites: Vec::new(),
            n_live: 0,
        }
    }

    pub fn ensure_allocated(&mut self, words: u32) {
        if self.code.is_empty() {
            self.code = (0..words).map(|_| AtomicU64::new(0)).collect();
        }
    }

    pub fn has_room(&self, words: u32, capacity: u32, max_slots: u32) -> bool {
        self.used + words <= capacity && (self.records.len() as u32) < max_slots
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn word(&self, offset: u32) -> Option<u64> {
        self.code
            .get(offset as usize)
            .map(|w| w.load(Ordering::Acquire))
    }

    pub fn store(&self, offset: u32, word: u64) {
        self.code[offset as usize].store(word, Ordering::Release);
    }

    pub fn site_index_at(&self, offset: u32) -> Option<u32> {
        self.sites
            .binary_search_by_key(&offset, |s| s.offset)
            .ok()
            .map(|i| i as u32)
    }

    pub fn reset(&mut self) {
        for w in &self.code[..self.used as usize] {
            w.store(0, Ordering::Relaxed);
        }
        self.used = 0;
        self.records.clear();
        self.index.clear();
        self.sites.clear();
        self.n_live = 0;
        self.generation = self.generation.wrapping_add(1);
    }
}
