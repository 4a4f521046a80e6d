use std::collections::BTreeMap;

use bitflags::bitflags;
use thiserror::Error;

pub const PAGE_SIZE: u64 = 4096;
const PAGE_SHIFT: u32 = 12;

bitflags! {
    /// Page permissions. The bit values double as the guest `prot` argument.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perms: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RX = Self::READ.bits() | Self::EXEC.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),
    #[error("access to {addr:#x} needs {need:?} but the page allows {have:?}")]
    Permission { addr: u64, need: Perms, have: Perms },
    #[error("{width}-byte access to {addr:#x} is misaligned")]
    Misaligned { addr: u64, width: u64 },
    #[error("range {addr:#x}+{len:#x} is not page aligned")]
    Unaligned { addr: u64, len: u64 },
    #[error("range {addr:#x}+{len:#x} overflows the address space")]
    Overflow { addr: u64, len: u64 },
}

impl GuestMemoryError {
    /// The first guest address the failed access touched.
    pub fn fault_addr(&self) -> u64 {
        match *self {
            GuestMemoryError::Unmapped(addr)
            | GuestMemoryError::Permission { addr, .. }
            | GuestMemoryError::Misaligned { addr, .. }
            | GuestMemoryError::Unaligned { addr, .. }
            | GuestMemoryError::Overflow { addr, .. } => addr,
        }
    }
}

struct Page {
    data: Box<[u8; PAGE_SIZE as usize]>,
    perms: Perms,
}

impl Page {
    fn new(perms: Perms) -> Self {
        Self {
            data: Box::new([0; PAGE_SIZE as usize]),
            perms,
        }
    }
}

/// Page-granular guest address space.
#[derive(Default)]
pub struct GuestMemory {
    pages: BTreeMap<u64, Page>,
}

pub fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

pub fn page_align_up(addr: u64) -> Option<u64> {
    addr.checked_add(PAGE_SIZE - 1).map(page_align_down)
}

fn page_range(addr: u64, len: u64) -> Result<std::ops::Range<u64>, GuestMemoryError> {
    if addr % PAGE_SIZE != 0 {
        return Err(GuestMemoryError::Unaligned { addr, len });
    }
    let end = addr
        .checked_add(len)
        .and_then(page_align_up)
        .ok_or(GuestMemoryError::Overflow { addr, len })?;
    Ok(addr >> PAGE_SHIFT..end >> PAGE_SHIFT)
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps zeroed pages over `[addr, addr + len)`, replacing any existing mapping.
    pub fn map(&mut self, addr: u64, len: u64, perms: Perms) -> Result<(), GuestMemoryError> {
        for page in page_range(addr, len)? {
            self.pages.insert(page, Page::new(perms));
        }
        Ok(())
    }

    /// Unmaps `[addr, addr + len)`. Holes inside the range are ignored.
    pub fn unmap(&mut self, addr: u64, len: u64) -> Result<(), GuestMemoryError> {
        let mapped: Vec<u64> = self.pages.range(page_range(addr, len)?).map(|(&p, _)| p).collect();
        for page in mapped {
            self.pages.remove(&page);
        }
        Ok(())
    }

    /// Changes permissions on `[addr, addr + len)`, returning the union of the previous ones.
    pub fn protect(
        &mut self,
        addr: u64,
        len: u64,
        perms: Perms,
    ) -> Result<Perms, GuestMemoryError> {
        let range = page_range(addr, len)?;
        if let Some(hole) = range.clone().find(|page| !self.pages.contains_key(page)) {
            return Err(GuestMemoryError::Unmapped(hole << PAGE_SHIFT));
        }
        let mut old = Perms::empty();
        for page in range {
            if let Some(p) = self.pages.get_mut(&page) {
                old |= p.perms;
                p.perms = perms;
            }
        }
        Ok(old)
    }

    pub fn perms(&self, addr: u64) -> Option<Perms> {
        self.pages.get(&(addr >> PAGE_SHIFT)).map(|p| p.perms)
    }

    pub fn is_mapped(&self, addr: u64, len: u64) -> bool {
        let Some(end) = addr.checked_add(len).and_then(page_align_up) else {
            return false;
        };
        (addr >> PAGE_SHIFT..end >> PAGE_SHIFT).all(|page| self.pages.contains_key(&page))
    }

    /// First-fit search for `len` bytes of unmapped, page-aligned space at or above `base`.
    pub fn find_free(&self, base: u64, len: u64) -> Option<u64> {
        let pages = page_align_up(len)? >> PAGE_SHIFT;
        let mut candidate = page_align_up(base)? >> PAGE_SHIFT;
        for (&page, _) in self.pages.range(candidate..) {
            if page >= candidate + pages {
                break;
            }
            candidate = page + 1;
        }
        candidate.checked_mul(PAGE_SIZE)
    }

    fn access(
        &self,
        addr: u64,
        len: usize,
        need: Perms,
        mut f: impl FnMut(&Page, usize, usize, usize),
    ) -> Result<(), GuestMemoryError> {
        let mut done = 0usize;
        while done < len {
            let cur = addr
                .checked_add(done as u64)
                .ok_or(GuestMemoryError::Overflow { addr, len: len as u64 })?;
            let page = self
                .pages
                .get(&(cur >> PAGE_SHIFT))
                .ok_or(GuestMemoryError::Unmapped(cur))?;
            if !page.perms.contains(need) {
                return Err(GuestMemoryError::Permission {
                    addr: cur,
                    need,
                    have: page.perms,
                });
            }
            let off = (cur % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - off).min(len - done);
            f(page, off, done, n);
            done += n;
        }
        Ok(())
    }

    /// Reads guest bytes, requiring every touched page to allow `need`.
    pub fn read(&self, addr: u64, buf: &mut [u8], need: Perms) -> Result<(), GuestMemoryError> {
        self.access(addr, buf.len(), need, |page, off, done, n| {
            buf[done..done + n].copy_from_slice(&page.data[off..off + n]);
        })
    }

    /// Like [`Self::read`], but checks the whole range before allocating.
    pub fn read_vec(
        &self,
        addr: u64,
        len: usize,
        need: Perms,
    ) -> Result<Vec<u8>, GuestMemoryError> {
        self.access(addr, len, need, |_, _, _, _| {})?;
        let mut buf = vec![0; len];
        self.read(addr, &mut buf, need)?;
        Ok(buf)
    }

    /// Writes guest bytes. Permissions are checked for the whole range before anything changes.
    pub fn write(&mut self, addr: u64, bytes: &[u8], need: Perms) -> Result<(), GuestMemoryError> {
        self.access(addr, bytes.len(), need, |_, _, _, _| {})?;
        let mut done = 0usize;
        while done < bytes.len() {
            let cur = addr + done as u64;
            let off = (cur % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - off).min(bytes.len() - done);
            if let Some(page) = self.pages.get_mut(&(cur >> PAGE_SHIFT)) {
                page.data[off..off + n].copy_from_slice(&bytes[done..done + n]);
            }
            done += n;
        }
        Ok(())
    }

    pub fn load_u64(&self, addr: u64) -> Result<u64, GuestMemoryError> {
        if addr % 8 != 0 {
            return Err(GuestMemoryError::Misaligned { addr, width: 8 });
        }
        let mut buf = [0; 8];
        self.read(addr, &mut buf, Perms::READ)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn store_u64(&mut self, addr: u64, value: u64) -> Result<(), GuestMemoryError> {
        if addr % 8 != 0 {
            return Err(GuestMemoryError::Misaligned { addr, width: 8 });
        }
        self.write(addr, &value.to_le_bytes(), Perms::WRITE)
    }

    /// Fetches one instruction's bytes from executable memory.
    pub fn fetch(&self, addr: u64) -> Result<[u8; 8], GuestMemoryError> {
        let mut buf = [0; 8];
        self.read(addr, &mut buf, Perms::EXEC)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_read_write() {
        let mut mem = GuestMemory::new();
        mem.map(0x1000, 0x2000, Perms::RW).unwrap();
        mem.store_u64(0x1ff8, 0xdead_beef).unwrap();
        assert_eq!(mem.load_u64(0x1ff8).unwrap(), 0xdead_beef);
        assert_eq!(mem.load_u64(0x2000).unwrap(), 0);
        assert!(mem.is_mapped(0x1ffc, 8));
        assert!(!mem.is_mapped(0x2ffc, 8));
    }

    #[test]
    fn faults_report_first_bad_address() {
        let mut mem = GuestMemory::new();
        mem.map(0x1000, 0x1000, Perms::RW).unwrap();
        let err = mem.read_vec(0x1ffc, 8, Perms::READ).unwrap_err();
        assert_eq!(err, GuestMemoryError::Unmapped(0x2000));
        assert_eq!(err.fault_addr(), 0x2000);
        assert_eq!(
            mem.fetch(0x1000).unwrap_err(),
            GuestMemoryError::Permission {
                addr: 0x1000,
                need: Perms::EXEC,
                have: Perms::RW
            }
        );
        assert!(matches!(
            mem.load_u64(0x1004),
            Err(GuestMemoryError::Misaligned { addr: 0x1004, .. })
        ));
    }

    #[test]
    fn failed_write_changes_nothing() {
        let mut mem = GuestMemory::new();
        mem.map(0x1000, 0x1000, Perms::RW).unwrap();
        mem.map(0x2000, 0x1000, Perms::READ).unwrap();
        assert!(mem.write(0x1ffc, &[1; 8], Perms::WRITE).is_err());
        assert_eq!(mem.read_vec(0x1ffc, 4, Perms::READ).unwrap(), vec![0; 4]);
    }

    #[test]
    fn protect_and_unmap() {
        let mut mem = GuestMemory::new();
        mem.map(0x4000, 0x2000, Perms::RWX).unwrap();
        assert_eq!(mem.protect(0x4000, 0x1000, Perms::READ).unwrap(), Perms::RWX);
        assert_eq!(mem.perms(0x4000), Some(Perms::READ));
        assert_eq!(mem.perms(0x5000), Some(Perms::RWX));
        mem.unmap(0x4000, 0x1000).unwrap();
        assert_eq!(
            mem.protect(0x4000, 0x2000, Perms::RW),
            Err(GuestMemoryError::Unmapped(0x4000))
        );
        assert!(matches!(
            mem.map(0x4001, 8, Perms::RW),
            Err(GuestMemoryError::Unaligned { .. })
        ));
    }

    #[test]
    fn huge_ranges_only_touch_mapped_pages() {
        let mut mem = GuestMemory::new();
        mem.map(0x20000, 0x2000, Perms::RW).unwrap();
        mem.map(0x8000_0000, 0x1000, Perms::RW).unwrap();
        assert_eq!(
            mem.read_vec(0x20000, usize::MAX, Perms::READ),
            Err(GuestMemoryError::Unmapped(0x22000))
        );
        mem.unmap(0x20000, 1 << 50).unwrap();
        assert!(!mem.is_mapped(0x20000, 1));
        assert!(!mem.is_mapped(0x8000_0000, 1));
        assert!(matches!(
            mem.unmap(0x20000, u64::MAX),
            Err(GuestMemoryError::Overflow { .. })
        ));
    }

    #[test]
    fn find_free_skips_mapped_pages() {
        let mut mem = GuestMemory::new();
        mem.map(0x10000, 0x1000, Perms::RW).unwrap();
        mem.map(0x12000, 0x1000, Perms::RW).unwrap();
        assert_eq!(mem.find_free(0x10000, 0x1000), Some(0x11000));
        assert_eq!(mem.find_free(0x10000, 0x2000), Some(0x13000));
        assert_eq!(mem.find_free(0x20000, 0x2000), Some(0x20000));
    }
}
