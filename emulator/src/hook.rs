use bitflags::bitflags;

use crate::{Emulator, Result};

bitflags! {
    /// Backend hook classes. The low bits (`INTR`, `INSN_INVALID`,
    /// `MEM_*_UNMAPPED`, `MEM_*_PROT`) are routed through an in-process
    /// registry above this crate because the backend only ever supports one
    /// global handler per class; `CODE`/`BLOCK`/`MEM_READ`/`MEM_WRITE`/
    /// `MEM_FETCH`/`MEM_READ_AFTER` are cheap enough to hand straight to the
    /// backend per address range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HookType: u32 {
        const INTR = 1 << 0;
        const INSN_INVALID = 1 << 1;
        const MEM_READ_UNMAPPED = 1 << 2;
        const MEM_WRITE_UNMAPPED = 1 << 3;
        const MEM_FETCH_UNMAPPED = 1 << 4;
        const MEM_READ_PROT = 1 << 5;
        const MEM_WRITE_PROT = 1 << 6;
        const MEM_FETCH_PROT = 1 << 7;
        const CODE = 1 << 8;
        const BLOCK = 1 << 9;
        const MEM_READ = 1 << 10;
        const MEM_WRITE = 1 << 11;
        const MEM_FETCH = 1 << 12;
        const MEM_READ_AFTER = 1 << 13;

        const MEM_UNMAPPED = Self::MEM_READ_UNMAPPED.bits()
            | Self::MEM_WRITE_UNMAPPED.bits()
            | Self::MEM_FETCH_UNMAPPED.bits();
        const MEM_PROT = Self::MEM_READ_PROT.bits()
            | Self::MEM_WRITE_PROT.bits()
            | Self::MEM_FETCH_PROT.bits();
        const MEM_INVALID = Self::MEM_UNMAPPED.bits() | Self::MEM_PROT.bits();
        const MEM_VALID = Self::MEM_READ.bits() | Self::MEM_WRITE.bits() | Self::MEM_FETCH.bits();
    }
}

/// Which memory access triggered a memory hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    Read,
    Write,
    Fetch,
}

/// A registered hook's payload, one variant per [`HookType`] group.
///
/// Go's `unicorn` binding threads an untyped `any data` through every
/// callback and recovers it with a type switch at dispatch time; the
/// registries above this crate play the same role, so the payload here
/// stays a plain closure rather than carrying the original's `any`.
pub enum HookCallback {
    Interrupt(Box<dyn Fn(&dyn Emulator, u32) + Send + Sync>),
    InvalidInsn(Box<dyn Fn(&dyn Emulator) -> bool + Send + Sync>),
    MemInvalid(Box<dyn Fn(&dyn Emulator, MemAccess, u64, usize, i64) -> bool + Send + Sync>),
    Code(Box<dyn Fn(&dyn Emulator, u64, u32) + Send + Sync>),
    Block(Box<dyn Fn(&dyn Emulator, u64, u32) + Send + Sync>),
    MemValid(Box<dyn Fn(&dyn Emulator, MemAccess, u64, usize, i64) + Send + Sync>),
}

/// Handle to a hook registered with the backend. Dropping this does not
/// unregister the hook; callers must call [`HookToken::remove`] explicitly,
/// matching the backend's own `uc_hook_del` semantics.
pub trait HookToken: Send {
    fn remove(self: Box<Self>) -> Result<()>;
}
