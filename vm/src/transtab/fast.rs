use crate::host::HostAddr;

const EMPTY: u64 = 0;

/// Direct-mapped `guest ip -> checked entry` table in front of the sectors.
///
/// Entries are `(guest, HostAddr::to_word)` pairs; a zero host word is empty.
/// There is no collision chain: a colliding insert evicts.
pub struct FastCache {
    entries: Box<[(u64, u64)]>,
    bits: u32,
    mask: u64,
}

impl FastCache {
    pub fn new(bits: u32) -> Self {
        let bits = bits.clamp(1, 24);
        Self {
            entries: vec![(0, EMPTY); 1 << bits].into_boxed_slice(),
            bits,
            mask: (1 << bits) - 1,
        }
    }

    #[inline]
    fn index(&self, ip: u64) -> usize {
        let word = ip >> 3;
        ((word ^ (word >> self.bits)) & self.mask) as usize
    }

    #[inline]
    pub fn lookup(&self, ip: u64) -> Option<HostAddr> {
        let (guest, host) = self.entries[self.index(ip)];
        if guest == ip {
            HostAddr::from_word(host)
        } else {
            None
        }
    }

    pub fn set(&mut self, ip: u64, host: HostAddr) {
        let idx = self.index(ip);
        self.entries[idx] = (ip, host.to_word());
    }

    pub fn invalidate_all(&mut self) {
        self.entries.fill((0, EMPTY));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Occupied `(guest, host)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (u64, HostAddr)> + '_ {
        self.entries
            .iter()
            .filter_map(|&(guest, host)| Some((guest, HostAddr::from_word(host)?)))
    }
}
