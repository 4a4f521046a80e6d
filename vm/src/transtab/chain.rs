//! Block chaining: patching chain-me sites into direct jumps and undoing it.

use std::mem;

use tracing::trace;

use super::{
    bump,
    sector::{Edge, PatchSite, SiteDesc, TtePtr},
    TransCache,
};
use crate::{
    error::EngineError,
    host::{insn::FAST_ENTRY_OFFSET, HostAddr, HostInsn},
};

impl TransCache {
    /// Identifies the chain site at `addr`, as reported by a chain-me exit.
    pub fn site_at(&self, addr: HostAddr) -> Option<PatchSite> {
        let sector = self.sectors.get(addr.sector as usize)?;
        let index = sector.site_index_at(addr.offset)?;
        Some(PatchSite {
            sector: addr.sector,
            index,
            generation: sector.generation,
        })
    }

    fn site_desc(&self, site: PatchSite) -> Option<&SiteDesc> {
        let sector = self.sectors.get(site.sector as usize)?;
        if sector.generation != site.generation {
            return None;
        }
        sector.sites.get(site.index as usize)
    }

    /// `(target guest address, fast)` of a site whose handle is still current.
    pub fn site_target(&self, site: PatchSite) -> Option<(u64, bool)> {
        self.site_desc(site).map(|d| (d.target, d.fast))
    }

    /// The record a patched site currently jumps to.
    #[cfg(test)]
    pub(crate) fn site_patched_to(&self, site: PatchSite) -> Option<TtePtr> {
        self.site_desc(site)?.patched
    }

    /// Patches `site` to jump straight into `to`.
    ///
    /// Returns `Ok(false)` without touching anything when the handle is stale
    /// or its block has been discarded since the chain-me exit.
    pub fn chain(&mut self, site: PatchSite, to: TtePtr) -> Result<bool, EngineError> {
        let Some(desc) = self.site_desc(site) else {
            return Ok(false);
        };
        let from = TtePtr {
            sector: site.sector,
            slot: desc.owner,
        };
        if !self.is_live(from) {
            return Ok(false);
        }
        let (target, fast, offset, patched) = (desc.target, desc.fast, desc.offset, desc.patched);
        match patched {
            Some(p) if p == to => return Ok(true),
            Some(p) => {
                return Err(EngineError::invariant(format!(
                    "site {}:{offset:#x} already chained to {p:?}",
                    site.sector
                )))
            }
            None => {}
        }
        let to_rec = self
            .record(to)
            .filter(|r| r.live)
            .ok_or_else(|| EngineError::invariant(format!("chain target {to:?} is not live")))?;
        if to_rec.guest != target {
            return Err(EngineError::invariant(format!(
                "site for {target:#x} cannot chain to the record for {:#x}",
                to_rec.guest
            )));
        }
        let sector = &self.sectors[site.sector as usize];
        if sector.word(offset).map(HostInsn::decode) != Some(Ok(HostInsn::ChainMe { fast })) {
            return Err(EngineError::invariant(format!(
                "site {}:{offset:#x} does not hold a placeholder",
                site.sector
            )));
        }

        let entry = HostAddr::new(to.sector, to_rec.entry);
        let dest = if fast {
            entry.add(FAST_ENTRY_OFFSET)
        } else {
            entry
        };
        sector.store(offset, HostInsn::Jump(dest).encode());
        self.sectors[site.sector as usize].sites[site.index as usize].patched = Some(to);

        let edge = Edge {
            from,
            site: site.index,
            to,
        };
        if let Some(rec) = self.record_mut(from) {
            rec.out_edges.push(edge);
        }
        if let Some(rec) = self.record_mut(to) {
            rec.in_edges.push(edge);
        }
        bump(&self.counters.chains, 1);
        self.touch();
        trace!(
            target = format_args!("{target:#x}"),
            fast,
            "chained {}:{offset:#x} -> {dest}",
            site.sector
        );
        Ok(true)
    }

    /// Restores the placeholder at an edge's site.
    fn unpatch(&mut self, edge: Edge) {
        let sector = &mut self.sectors[edge.from.sector as usize];
        let Some(desc) = sector.sites.get_mut(edge.site as usize) else {
            return;
        };
        desc.patched = None;
        let (offset, fast) = (desc.offset, desc.fast);
        sector.store(offset, HostInsn::ChainMe { fast }.encode());
        bump(&self.counters.unchains, 1);
        self.touch();
    }

    /// Breaks every chain that jumps into `ptr`.
    pub(super) fn unchain_incoming(&mut self, ptr: TtePtr) {
        let Some(rec) = self.record_mut(ptr) else {
            return;
        };
        for edge in mem::take(&mut rec.in_edges) {
            self.unpatch(edge);
            if let Some(src) = self.record_mut(edge.from) {
                src.out_edges.retain(|e| *e != edge);
            }
        }
    }

    /// Breaks every chain that leaves `ptr`.
    pub(super) fn unchain_outgoing(&mut self, ptr: TtePtr) {
        let Some(rec) = self.record_mut(ptr) else {
            return;
        };
        for edge in mem::take(&mut rec.out_edges) {
            self.unpatch(edge);
            if let Some(dst) = self.record_mut(edge.to) {
                dst.in_edges.retain(|e| *e != edge);
            }
        }
    }

    pub(super) fn check_site(
        &self,
        sector: u16,
        index: u32,
        site: &SiteDesc,
    ) -> Result<(), String> {
        let word = self.sectors[sector as usize].word(site.offset);
        let decoded = word.map(HostInsn::decode);
        match site.patched {
            None => {
                if decoded != Some(Ok(HostInsn::ChainMe { fast: site.fast })) {
                    return Err(format!(
                        "unpatched site {sector}:{:#x} holds {word:?}",
                        site.offset
                    ));
                }
            }
            Some(to) => {
                let want = if site.fast {
                    self.fast_entry_of(to)
                } else {
                    self.entry_of(to)
                };
                let Some(want) = want else {
                    return Err(format!("site {sector}:{:#x} jumps to a dead record", site.offset));
                };
                if decoded != Some(Ok(HostInsn::Jump(want))) {
                    return Err(format!(
                        "site {sector}:{:#x} should jump to {want}, holds {word:?}",
                        site.offset
                    ));
                }
                let edge = Edge {
                    from: TtePtr {
                        sector,
                        slot: site.owner,
                    },
                    site: index,
                    to,
                };
                let out_ok = self
                    .record(edge.from)
                    .is_some_and(|r| r.out_edges.contains(&edge));
                let in_ok = self.record(to).is_some_and(|r| r.in_edges.contains(&edge));
                if !out_ok || !in_ok {
                    return Err(format!(
                        "site {sector}:{:#x} is patched without matching edges",
                        site.offset
                    ));
                }
            }
        }
        Ok(())
    }
}
