use std::sync::Arc;

use crate::{Emulator, Result};

/// A guest address paired with the emulator it lives in, so callers can
/// dereference it without threading the emulator handle separately.
#[derive(Clone)]
pub struct Pointer {
    emu: Arc<dyn Emulator>,
    addr: u64,
}

impl Pointer {
    pub fn new(emu: Arc<dyn Emulator>, addr: u64) -> Self {
        Pointer { emu, addr }
    }

    pub fn address(&self) -> u64 {
        self.addr
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    pub fn add(&self, offset: i64) -> Pointer {
        Pointer {
            emu: self.emu.clone(),
            addr: self.addr.wrapping_add(offset as u64),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<()> {
        self.emu.mem_read(self.addr, buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<()> {
        self.emu.mem_write(self.addr, buf)
    }

    /// Reads a little-endian pointer-sized value stored at this address and
    /// returns it as a new `Pointer` into the same emulator.
    pub fn read_pointer(&self, pointer_size: usize) -> Result<Pointer> {
        let mut buf = [0u8; 8];
        self.emu.mem_read(self.addr, &mut buf[..pointer_size])?;
        let value = u64::from_le_bytes(buf);
        Ok(Pointer::new(self.emu.clone(), value))
    }

    /// Reads a NUL-terminated string starting at this address.
    pub fn read_cstring(&self) -> Result<String> {
        let mut out = Vec::new();
        let mut addr = self.addr;
        let mut byte = [0u8; 1];
        loop {
            self.emu.mem_read(addr, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
            addr = addr.wrapping_add(1);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

impl std::fmt::Debug for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pointer({:#x})", self.addr)
    }
}
