//! The translation cache.
//!
//! Translations live in a ring of sectors. Each sector owns a code arena of
//! atomic host words, a table of [`TransRecord`]s and an index from guest
//! address to record. Sectors fill monotonically; when the current one is
//! full the next (oldest) is recycled wholesale. A small direct-mapped
//! [`FastCache`] sits in front of the sectors and is scrubbed on every
//! discard or recycle, so a fast hit always names a live translation.
//!
//! All mutation happens under the engine's big lock. The dispatcher only
//! reads code words and the fast cache, through `&TransCache`.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::{
    error::EngineError,
    host::{insn::FAST_ENTRY_OFFSET, HostAddr, HostInsn},
    opts::EngineOpts,
    translate::Translation,
};

mod chain;
pub mod fast;
pub mod sector;

pub use fast::FastCache;
pub use sector::{PatchSite, TransRecord, TtePtr};
use sector::{Sector, SiteDesc};

/// Cache statistics, as counted since creation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub fast_lookups: u64,
    pub fast_hits: u64,
    pub full_lookups: u64,
    pub full_hits: u64,
    pub translations: u64,
    pub guest_insns: u64,
    pub host_words: u64,
    pub discards: u64,
    pub recycles: u64,
    pub chains: u64,
    pub unchains: u64,
    pub live_records: u64,
}

#[derive(Default)]
struct Counters {
    fast_lookups: AtomicU64,
    fast_hits: AtomicU64,
    full_lookups: AtomicU64,
    full_hits: AtomicU64,
    translations: AtomicU64,
    guest_insns: AtomicU64,
    host_words: AtomicU64,
    discards: AtomicU64,
    recycles: AtomicU64,
    chains: AtomicU64,
    unchains: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

pub struct TransCache {
    sectors: Vec<Sector>,
    /// Sector indices in full-lookup order.
    search_order: Vec<u16>,
    current: usize,
    fast: FastCache,
    sector_words: u32,
    sector_slots: u32,
    counters: Counters,
    /// Bumped by every mutation: insert, discard, recycle, chain and unchain.
    epoch: Arc<AtomicU64>,
}

impl TransCache {
    pub fn new(opts: &EngineOpts) -> Self {
        let n_sectors = opts.tt_sectors.clamp(1, u16::MAX as usize);
        Self {
            sectors: (0..n_sectors).map(|_| Sector::new()).collect(),
            search_order: (0..n_sectors as u16).collect(),
            current: 0,
            fast: FastCache::new(opts.fast_cache_bits),
            sector_words: opts.sector_words.max(16),
            sector_slots: opts.sector_slots.max(1),
            counters: Counters::default(),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// A handle on the mutation counter that can be read without the big lock.
    pub fn epoch_probe(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.epoch)
    }

    pub fn n_sectors(&self) -> usize {
        self.sectors.len()
    }

    #[inline]
    pub fn code_word(&self, addr: HostAddr) -> Option<u64> {
        self.sectors.get(addr.sector as usize)?.word(addr.offset)
    }

    /// O(1) lookup of the checked entry for `ip`.
    #[inline]
    pub fn lookup_fast(&self, ip: u64) -> Option<HostAddr> {
        bump(&self.counters.fast_lookups, 1);
        let hit = self.fast.lookup(ip);
        if hit.is_some() {
            bump(&self.counters.fast_hits, 1);
        }
        hit
    }

    /// Finds the live record for `ip` in search order, without side effects.
    pub fn find(&self, ip: u64) -> Option<TtePtr> {
        self.search_order.iter().find_map(|&sector| {
            let slot = *self.sectors[sector as usize].index.get(&ip)?;
            Some(TtePtr { sector, slot })
        })
    }

    /// Searches every sector for `ip`. A hit refills the fast cache and moves
    /// its sector one place toward the front of the search order.
    pub fn lookup_full(&mut self, ip: u64) -> Option<HostAddr> {
        bump(&self.counters.full_lookups, 1);
        let pos = self
            .search_order
            .iter()
            .position(|&s| self.sectors[s as usize].index.contains_key(&ip))?;
        let sector = self.search_order[pos];
        let slot = self.sectors[sector as usize].index[&ip];
        if pos > 0 {
            self.search_order.swap(pos, pos - 1);
        }
        let entry = self.entry_of(TtePtr { sector, slot })?;
        self.fast.set(ip, entry);
        bump(&self.counters.full_hits, 1);
        Some(entry)
    }

    pub fn record(&self, ptr: TtePtr) -> Option<&TransRecord> {
        self.sectors
            .get(ptr.sector as usize)?
            .records
            .get(ptr.slot as usize)
    }

    fn record_mut(&mut self, ptr: TtePtr) -> Option<&mut TransRecord> {
        self.sectors
            .get_mut(ptr.sector as usize)?
            .records
            .get_mut(ptr.slot as usize)
    }

    pub fn is_live(&self, ptr: TtePtr) -> bool {
        self.record(ptr).is_some_and(|r| r.live)
    }

    /// The checked entry of a live record.
    pub fn entry_of(&self, ptr: TtePtr) -> Option<HostAddr> {
        let rec = self.record(ptr).filter(|r| r.live)?;
        Some(HostAddr::new(ptr.sector, rec.entry))
    }

    pub fn fast_entry_of(&self, ptr: TtePtr) -> Option<HostAddr> {
        Some(self.entry_of(ptr)?.add(FAST_ENTRY_OFFSET))
    }

    fn check_contract(&self, guest: u64, t: &Translation) -> Result<(), EngineError> {
        let fail = |reason: String| EngineError::Translation { addr: guest, reason };
        if t.guest_len == 0 {
            return Err(fail("covers no guest bytes".into()));
        }
        if t.code.len() as u64 > self.sector_words as u64 {
            return Err(fail(format!(
                "{} host words do not fit a {}-word sector",
                t.code.len(),
                self.sector_words
            )));
        }
        if t.code.first().map(|&w| HostInsn::decode(w)) != Some(Ok(HostInsn::EvCheck)) {
            return Err(fail("does not start with an event check".into()));
        }
        for site in &t.sites {
            let word = t.code.get(site.offset as usize).copied();
            if word.map(HostInsn::decode) != Some(Ok(HostInsn::ChainMe { fast: site.fast })) {
                return Err(fail(format!(
                    "site at word {} is not a chain-me placeholder",
                    site.offset
                )));
            }
        }
        Ok(())
    }

    /// Installs a translation of `guest` and points the fast cache at it.
    pub fn insert(&mut self, guest: u64, t: Translation) -> Result<TtePtr, EngineError> {
        self.check_contract(guest, &t)?;
        if let Some(old) = self.find(guest) {
            self.delete(old);
            self.fast.invalidate_all();
        }

        let words = t.code.len() as u32;
        if !self.sectors[self.current].has_room(words, self.sector_words, self.sector_slots) {
            self.current = (self.current + 1) % self.sectors.len();
            if !self.sectors[self.current].is_empty() {
                self.recycle(self.current);
            }
        }

        let sector_no = self.current as u16;
        let sector_words = self.sector_words;
        let sector = &mut self.sectors[self.current];
        sector.ensure_allocated(sector_words);
        let base = sector.used;
        for (i, &word) in t.code.iter().enumerate() {
            sector.code[base as usize + i].store(word, Ordering::Relaxed);
        }
        sector.used += words;

        let slot = sector.records.len() as u32;
        let first_site = sector.sites.len() as u32;
        sector.sites.extend(t.sites.iter().map(|s| SiteDesc {
            offset: base + s.offset,
            owner: slot,
            target: s.target,
            fast: s.fast,
            patched: None,
        }));
        sector.records.push(TransRecord {
            guest,
            guest_len: t.guest_len,
            n_guest_insns: t.n_guest_insns,
            entry: base,
            code_len: words,
            sites: first_site..sector.sites.len() as u32,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            live: true,
        });
        sector.index.insert(guest, slot);
        sector.n_live += 1;

        bump(&self.counters.translations, 1);
        bump(&self.counters.guest_insns, t.n_guest_insns as u64);
        bump(&self.counters.host_words, words as u64);
        self.fast.set(guest, HostAddr::new(sector_no, base));
        self.touch();
        Ok(TtePtr {
            sector: sector_no,
            slot,
        })
    }

    /// Unlinks a record from the chain graph and the index.
    fn delete(&mut self, ptr: TtePtr) {
        self.unchain_incoming(ptr);
        self.unchain_outgoing(ptr);
        let sector = &mut self.sectors[ptr.sector as usize];
        let Some(rec) = sector.records.get_mut(ptr.slot as usize) else {
            return;
        };
        if !rec.live {
            return;
        }
        rec.live = false;
        if sector.index.get(&rec.guest) == Some(&ptr.slot) {
            sector.index.remove(&rec.guest);
        }
        sector.n_live -= 1;
    }

    /// Empties a sector, first breaking every chain into or out of it.
    #[instrument(skip(self), level = "debug")]
    fn recycle(&mut self, sector: usize) {
        let n_records = self.sectors[sector].records.len() as u32;
        let n_live = self.sectors[sector].n_live;
        for slot in 0..n_records {
            let ptr = TtePtr {
                sector: sector as u16,
                slot,
            };
            if self.is_live(ptr) {
                self.delete(ptr);
            }
        }
        self.sectors[sector].reset();
        self.fast.invalidate_all();
        bump(&self.counters.recycles, 1);
        self.touch();
        info!(sector, evicted = n_live, "recycled translation sector");
    }

    /// Discards every translation that intersects `[start, start + len)`.
    /// Returns how many were discarded.
    pub fn discard(&mut self, start: u64, len: u64, reason: &str) -> usize {
        let victims: Vec<TtePtr> = self
            .sectors
            .iter()
            .enumerate()
            .flat_map(|(s, sector)| {
                sector
                    .records
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.live && r.overlaps(start, len))
                    .map(move |(slot, _)| TtePtr {
                        sector: s as u16,
                        slot: slot as u32,
                    })
            })
            .collect();
        for &ptr in &victims {
            self.delete(ptr);
        }
        if !victims.is_empty() {
            self.fast.invalidate_all();
            bump(&self.counters.discards, victims.len() as u64);
            self.touch();
        }
        debug!(
            start = format_args!("{start:#x}"),
            len,
            reason,
            discarded = victims.len(),
            sectors = %victims.iter().map(|p| p.sector).dedup().join(","),
            "discard translations"
        );
        victims.len()
    }

    pub fn live_records(&self) -> u64 {
        self.sectors.iter().map(|s| s.n_live as u64).sum()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CacheStats {
            fast_lookups: get(&c.fast_lookups),
            fast_hits: get(&c.fast_hits),
            full_lookups: get(&c.full_lookups),
            full_hits: get(&c.full_hits),
            translations: get(&c.translations),
            guest_insns: get(&c.guest_insns),
            host_words: get(&c.host_words),
            discards: get(&c.discards),
            recycles: get(&c.recycles),
            chains: get(&c.chains),
            unchains: get(&c.unchains),
            live_records: self.live_records(),
        }
    }

    /// Cross-checks the fast cache, the indices and the chain graph.
    pub fn sanity_check(&self) -> Result<(), String> {
        for (guest, host) in self.fast.iter() {
            let ptr = self
                .find_in(host.sector, guest)
                .ok_or_else(|| format!("fast entry {guest:#x} -> {host} has no live record"))?;
            if self.entry_of(ptr) != Some(host) {
                return Err(format!("fast entry {guest:#x} -> {host} is not the record entry"));
            }
        }
        for (s, sector) in self.sectors.iter().enumerate() {
            let s = s as u16;
            let live = sector.records.iter().filter(|r| r.live).count() as u32;
            if live != sector.n_live {
                return Err(format!("sector {s}: {live} live records, counted {}", sector.n_live));
            }
            if let Some(slot) = sector
                .records
                .iter()
                .position(|r| !r.live && r.n_in_edges() + r.n_out_edges() != 0)
            {
                return Err(format!("sector {s}: dead record {slot} still has edges"));
            }
            for (&guest, &slot) in &sector.index {
                match sector.records.get(slot as usize) {
                    Some(r) if r.live && r.guest == guest => {}
                    _ => return Err(format!("sector {s}: index entry {guest:#x} is stale")),
                }
            }
            for (index, site) in sector.sites.iter().enumerate() {
                self.check_site(s, index as u32, site)?;
            }
        }
        Ok(())
    }

    fn find_in(&self, sector: u16, guest: u64) -> Option<TtePtr> {
        let slot = *self.sectors.get(sector as usize)?.index.get(&guest)?;
        Some(TtePtr { sector, slot })
    }
}
