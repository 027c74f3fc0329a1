use bitflags::bitflags;

bitflags! {
    /// Page protection bits, mirrored directly from the backend's own
    /// `PROT_*` constants so callers can pass them through unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemProt: u32 {
        const NONE = 0;
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// One contiguous mapped range as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub addr: u64,
    pub size: u64,
    pub prot: MemProt,
}

impl MemRegion {
    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }
}
