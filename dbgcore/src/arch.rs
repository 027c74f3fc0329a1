//! ARM/ARM64 ABI adapters (§4.7): which registers carry PC/SP/LR and
//! arguments, how many spill to the stack, and the register-walking
//! [`dbgcore_encoding::Stream`] that `dbgcore_encoding_derive`-generated
//! `Encode`/`Decode` impls marshal guest call arguments through.

use std::sync::Arc;

use dbgcore_emulator::arch::{arm, arm64};
use dbgcore_emulator::{Arch, Emulator, Reg};

use crate::errors::{DbgError, Result};
use crate::task::Task;

/// Public calling-convention surface (§6). Only conventions that make
/// sense for an ARM/ARM64 guest are actually usable; `Stdcall` is an x86
/// convention with no ARM equivalent and is always rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    Default,
    Cdecl,
    Stdcall,
    /// Register-argument convention; the spec calls this "ATPCS" on ARM,
    /// which for the subset this crate implements (no varargs, no thumb
    /// interworking thunks) is indistinguishable from `Default`.
    Fastcall,
}

impl CallConv {
    fn check_supported(self) -> Result<()> {
        match self {
            CallConv::Stdcall => Err(DbgError::CallingUnsupported(self)),
            _ => Ok(()),
        }
    }
}

struct ArchInfo {
    pointer_size: usize,
    stack_align: u64,
    pc: Reg,
    sp: Reg,
    lr: Reg,
    arg_base: Reg,
    arg_count: u32,
    float_base: Reg,
    float_count: u32,
    double_base: Reg,
    double_count: u32,
    return_reg: Reg,
}

fn info(arch: Arch) -> ArchInfo {
    match arch {
        Arch::Arm => ArchInfo {
            pointer_size: arm::POINTER_SIZE,
            stack_align: arm::STACK_ALIGNMENT,
            pc: arm::PC,
            sp: arm::SP,
            lr: arm::LR,
            arg_base: arm::ARG_BASE,
            arg_count: arm::ARG_REG_COUNT,
            float_base: arm::FLOAT_ARG_BASE,
            float_count: arm::FLOAT_ARG_REG_COUNT,
            double_base: arm::DOUBLE_ARG_BASE,
            double_count: arm::DOUBLE_ARG_REG_COUNT,
            return_reg: arm::RETURN_REG,
        },
        Arch::Arm64 => ArchInfo {
            pointer_size: arm64::POINTER_SIZE,
            stack_align: arm64::STACK_ALIGNMENT,
            pc: arm64::PC,
            sp: arm64::SP,
            lr: arm64::X30,
            arg_base: arm64::ARG_BASE,
            arg_count: arm64::ARG_REG_COUNT,
            float_base: arm64::FLOAT_ARG_BASE,
            float_count: arm64::FLOAT_ARG_REG_COUNT,
            double_base: arm64::DOUBLE_ARG_BASE,
            double_count: arm64::DOUBLE_ARG_REG_COUNT,
            return_reg: arm64::RETURN_REG,
        },
    }
}

pub fn pc_reg(arch: Arch) -> Reg {
    info(arch).pc
}

pub fn sp_reg(arch: Arch) -> Reg {
    info(arch).sp
}

pub fn lr_reg(arch: Arch) -> Reg {
    info(arch).lr
}

pub fn pointer_size(arch: Arch) -> usize {
    info(arch).pointer_size
}

pub fn stack_align(arch: Arch) -> u64 {
    info(arch).stack_align
}

/// ARM64 requires `CPACR_EL1.FPEN` set before the guest can execute any
/// SIMD/FP instruction; real backends trap on it otherwise. ARM has no
/// equivalent control register gate.
pub fn init_cpu(emu: &dyn Emulator, arch: Arch) -> Result<()> {
    if arch == Arch::Arm64 {
        let current = emu.reg_read(arm64::CPACR_EL1).unwrap_or(0);
        emu.reg_write(arm64::CPACR_EL1, current | 0x0030_0000)?;
    }
    Ok(())
}

/// Copies `LR` into `PC`, the ARM/ARM64 equivalent of a bare `ret`, used
/// when a host-synthesized call needs to force a return without the guest
/// executing the instruction itself.
pub fn force_return(emu: &dyn Emulator, arch: Arch) -> Result<()> {
    let a = info(arch);
    let lr = emu.reg_read(a.lr)?;
    emu.reg_write(a.pc, lr)?;
    Ok(())
}

/// A [`dbgcore_encoding::Stream`] that sources/sinks argument words through
/// a task's integer and float/double register files before spilling to
/// its guest stack, per AAPCS (ARM) / AArch64 PCS (ARM64, §8 property 5).
pub struct RegisterStream<'a> {
    task: &'a Arc<Task>,
    emu: Arc<dyn Emulator>,
    info: ArchInfo,
    next_int: u32,
    next_float: u32,
    next_double: u32,
    stack_cursor: u64,
}

impl<'a> RegisterStream<'a> {
    pub fn new(task: &'a Arc<Task>, emu: Arc<dyn Emulator>, arch: Arch) -> RegisterStream<'a> {
        let info = info(arch);
        let stack_cursor = task.sp();
        RegisterStream {
            task,
            emu,
            info,
            next_int: 0,
            next_float: 0,
            next_double: 0,
            stack_cursor,
        }
    }

    fn spill(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        let ptr_size = self.info.pointer_size as u64;
        self.stack_cursor = (self.stack_cursor + ptr_size - 1) & !(ptr_size - 1);
        let addr = self.stack_cursor;
        self.stack_cursor += ptr_size;
        let mut padded = bytes.to_vec();
        padded.resize(ptr_size as usize, 0);
        self.emu.mem_write(addr, &padded)?;
        Ok(padded)
    }

    fn read_spill(&mut self, size: usize) -> Result<Vec<u8>> {
        let ptr_size = self.info.pointer_size as u64;
        self.stack_cursor = (self.stack_cursor + ptr_size - 1) & !(ptr_size - 1);
        let addr = self.stack_cursor;
        self.stack_cursor += ptr_size;
        let mut buf = vec![0u8; size];
        self.emu.mem_read(addr, &mut buf)?;
        Ok(buf)
    }
}

impl<'a> dbgcore_encoding::Stream for RegisterStream<'a> {
    fn pointer_size(&self) -> usize {
        self.info.pointer_size
    }

    fn write_word(&mut self, bytes: &[u8]) -> dbgcore_encoding::Result<()> {
        if self.next_int < self.info.arg_count {
            let mut padded = [0u8; 8];
            padded[..bytes.len()].copy_from_slice(bytes);
            let reg = self.info.arg_base + self.next_int;
            self.next_int += 1;
            self.task
                .reg_write(reg, u64::from_le_bytes(padded))
                .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))?;
        } else {
            self.spill(bytes)
                .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    fn read_word(&mut self, size: usize) -> dbgcore_encoding::Result<Vec<u8>> {
        if self.next_int < self.info.arg_count {
            let reg = self.info.arg_base + self.next_int;
            self.next_int += 1;
            let value = self
                .task
                .reg_read(reg)
                .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))?;
            Ok(value.to_le_bytes()[..size].to_vec())
        } else {
            self.read_spill(size)
                .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))
        }
    }

    fn write_float_word(&mut self, bytes: &[u8]) -> dbgcore_encoding::Result<()> {
        let (base, count, counter) = if bytes.len() <= 4 {
            (self.info.float_base, self.info.float_count, &mut self.next_float)
        } else {
            (self.info.double_base, self.info.double_count, &mut self.next_double)
        };
        if *counter < count {
            let mut padded = [0u8; 8];
            padded[..bytes.len()].copy_from_slice(bytes);
            let reg = base + *counter;
            *counter += 1;
            self.task
                .reg_write(reg, u64::from_le_bytes(padded))
                .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))?;
            Ok(())
        } else {
            // Real AAPCS hardfloat spills excess FP args onto the integer
            // stack area too, rather than reusing an integer/FP register id
            // from the wrong bank (§9's open question about the ARM float
            // path is avoided by never reusing ids across banks here).
            self.spill(bytes)
                .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))?;
            Ok(())
        }
    }

    fn read_float_word(&mut self, size: usize) -> dbgcore_encoding::Result<Vec<u8>> {
        let (base, count, counter) = if size <= 4 {
            (self.info.float_base, self.info.float_count, &mut self.next_float)
        } else {
            (self.info.double_base, self.info.double_count, &mut self.next_double)
        };
        if *counter < count {
            let reg = base + *counter;
            *counter += 1;
            let value = self
                .task
                .reg_read(reg)
                .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))?;
            Ok(value.to_le_bytes()[..size].to_vec())
        } else {
            self.read_spill(size)
                .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))
        }
    }

    fn alloc(&mut self, size: usize, align: usize) -> dbgcore_encoding::Result<u64> {
        self.task
            .stack_alloc(size as u64, align as u64)
            .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))
    }

    fn write_at(&mut self, addr: u64, bytes: &[u8]) -> dbgcore_encoding::Result<()> {
        self.emu
            .mem_write(addr, bytes)
            .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))
    }

    fn read_at(&mut self, addr: u64, len: usize) -> dbgcore_encoding::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.emu
            .mem_read(addr, &mut buf)
            .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))?;
        Ok(buf)
    }
}

/// A register-stream view restricted to just the return-value register(s)
/// (`r0`/`x0`), used by `ret_extract`/`ret_write` rather than the full
/// argument-walking [`RegisterStream`].
pub struct ReturnStream<'a> {
    task: &'a Arc<Task>,
    emu: Arc<dyn Emulator>,
    info: ArchInfo,
    next: u32,
}

impl<'a> ReturnStream<'a> {
    pub fn new(task: &'a Arc<Task>, emu: Arc<dyn Emulator>, arch: Arch) -> ReturnStream<'a> {
        ReturnStream { task, emu, info: info(arch), next: 0 }
    }
}

impl<'a> dbgcore_encoding::Stream for ReturnStream<'a> {
    fn pointer_size(&self) -> usize {
        self.info.pointer_size
    }

    fn write_word(&mut self, bytes: &[u8]) -> dbgcore_encoding::Result<()> {
        let mut padded = [0u8; 8];
        padded[..bytes.len()].copy_from_slice(bytes);
        let reg = self.info.return_reg + self.next;
        self.next += 1;
        self.task
            .reg_write(reg, u64::from_le_bytes(padded))
            .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))
    }

    fn read_word(&mut self, size: usize) -> dbgcore_encoding::Result<Vec<u8>> {
        let reg = self.info.return_reg + self.next;
        self.next += 1;
        let value = self
            .task
            .reg_read(reg)
            .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))?;
        Ok(value.to_le_bytes()[..size].to_vec())
    }

    fn write_float_word(&mut self, bytes: &[u8]) -> dbgcore_encoding::Result<()> {
        self.write_word(bytes)
    }

    fn read_float_word(&mut self, size: usize) -> dbgcore_encoding::Result<Vec<u8>> {
        self.read_word(size)
    }

    fn alloc(&mut self, size: usize, align: usize) -> dbgcore_encoding::Result<u64> {
        self.task
            .stack_alloc(size as u64, align as u64)
            .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))
    }

    fn write_at(&mut self, addr: u64, bytes: &[u8]) -> dbgcore_encoding::Result<()> {
        self.emu
            .mem_write(addr, bytes)
            .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))
    }

    fn read_at(&mut self, addr: u64, len: usize) -> dbgcore_encoding::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.emu
            .mem_read(addr, &mut buf)
            .map_err(|e| dbgcore_encoding::EncodingError::Backend(e.to_string()))?;
        Ok(buf)
    }
}

/// Writes one guest-call argument following `conv`'s register-walking
/// order. Arguments must be written in left-to-right order on the same
/// [`RegisterStream`] instance to land in the right registers/stack slots.
pub fn arg_write<T: dbgcore_encoding::Encode>(
    stream: &mut RegisterStream<'_>,
    conv: CallConv,
    value: &T,
) -> Result<()> {
    conv.check_supported()?;
    value.encode(stream).map_err(DbgError::from)
}

pub fn ret_extract<T: dbgcore_encoding::Decode>(
    task: &Arc<Task>,
    emu: Arc<dyn Emulator>,
    arch: Arch,
) -> Result<T> {
    let mut stream = ReturnStream::new(task, emu, arch);
    T::decode(&mut stream).map_err(DbgError::from)
}

pub fn ret_write<T: dbgcore_encoding::Encode>(
    task: &Arc<Task>,
    emu: Arc<dyn Emulator>,
    arch: Arch,
    value: &T,
) -> Result<()> {
    let mut stream = ReturnStream::new(task, emu, arch);
    value.encode(&mut stream).map_err(DbgError::from)
}
