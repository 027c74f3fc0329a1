//! The contract a CPU emulator backend must satisfy to be driven by `dbgcore`.
//!
//! Everything in this crate is a façade: register and memory I/O, hook
//! registration, and context save/restore/clone. The actual instruction
//! decoding and execution lives in whatever backend implements [`Emulator`]
//! (a Unicorn-style engine, typically) and is out of scope here.

mod errors;
mod hook;
mod mem;
mod pointer;
mod reg;

pub mod arch;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use errors::{EmulatorError, Result};
pub use hook::{HookCallback, HookToken, HookType};
pub use mem::{MemProt, MemRegion};
pub use pointer::Pointer;
pub use reg::Reg;

use std::sync::Arc;

/// Supported guest instruction set architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Arm,
    Arm64,
}

/// Byte order the backend reports for the running guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// A saved CPU state plus whatever bookkeeping the backend needs to restore
/// it later. One `Context` is bound to exactly one task at a time.
pub trait Context: Send {
    fn save(&mut self) -> Result<()>;
    fn restore(&mut self) -> Result<()>;
    fn clone_context(&self) -> Result<Box<dyn Context>>;

    fn reg_read(&self, reg: Reg) -> Result<u64>;
    fn reg_write(&mut self, reg: Reg, value: u64) -> Result<()>;
    fn reg_read_batch(&self, regs: &[Reg]) -> Result<Vec<u64>> {
        regs.iter().map(|&r| self.reg_read(r)).collect()
    }
    fn reg_write_batch(&mut self, regs: &[Reg], vals: &[u64]) -> Result<()> {
        for (&r, &v) in regs.iter().zip(vals) {
            self.reg_write(r, v)?;
        }
        Ok(())
    }
}

/// The emulator backend contract (§4.1).
///
/// `start` is expected to block the calling thread until `stop` is called
/// from a hook callback or an unrecoverable backend error occurs.
pub trait Emulator: Send + Sync {
    fn arch(&self) -> Arch;
    fn page_size(&self) -> u64;
    fn endian(&self) -> Endian;

    fn reg_read(&self, reg: Reg) -> Result<u64>;
    fn reg_write(&self, reg: Reg, value: u64) -> Result<()>;
    fn reg_read_batch(&self, regs: &[Reg]) -> Result<Vec<u64>> {
        regs.iter().map(|&r| self.reg_read(r)).collect()
    }
    fn reg_write_batch(&self, regs: &[Reg], vals: &[u64]) -> Result<()> {
        for (&r, &v) in regs.iter().zip(vals) {
            self.reg_write(r, v)?;
        }
        Ok(())
    }

    /// The current program counter, independent of where the backend's own
    /// register numbering happens to put it.
    fn pc(&self) -> Result<u64>;

    fn mem_map(&self, addr: u64, size: u64, prot: MemProt) -> Result<()>;
    fn mem_unmap(&self, addr: u64, size: u64) -> Result<()>;
    fn mem_protect(&self, addr: u64, size: u64, prot: MemProt) -> Result<()>;
    fn mem_read(&self, addr: u64, buf: &mut [u8]) -> Result<()>;
    fn mem_write(&self, addr: u64, buf: &[u8]) -> Result<()>;
    fn mem_regions(&self) -> Result<Vec<MemRegion>>;

    fn context_alloc(&self) -> Result<Box<dyn Context>>;

    fn hook(&self, kind: HookType, callback: HookCallback, begin: u64, end: u64)
        -> Result<Box<dyn HookToken>>;

    /// Blocks the calling thread running guest code from `pc` onward, until
    /// `stop` is called or execution runs `until` cycles (`u64::MAX` for
    /// unbounded).
    fn start(&self, pc: u64, until: u64) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Convenience wrapper so callers can pass `Arc<dyn Emulator>` around and
/// still construct `Pointer`s tied to it without repeating the `Arc` clone.
pub fn to_pointer(emu: Arc<dyn Emulator>, addr: u64) -> Pointer {
    Pointer::new(emu, addr)
}
