use crate::Reg;

// Numbering follows a Unicorn-style `UC_ARM_REG_*` enum: general purpose
// registers first, then the banked/special registers, then the VFP/NEON
// file. Only the subset the ABI streams and hook dispatch actually touch is
// named here.

pub const R0: Reg = Reg(0);
pub const R1: Reg = Reg(1);
pub const R2: Reg = Reg(2);
pub const R3: Reg = Reg(3);
pub const R4: Reg = Reg(4);
pub const R5: Reg = Reg(5);
pub const R6: Reg = Reg(6);
pub const R7: Reg = Reg(7);
pub const R8: Reg = Reg(8);
pub const R9: Reg = Reg(9);
pub const R10: Reg = Reg(10);
pub const R11: Reg = Reg(11);
pub const R12: Reg = Reg(12);
pub const SP: Reg = Reg(13);
pub const LR: Reg = Reg(14);
pub const PC: Reg = Reg(15);
pub const CPSR: Reg = Reg(16);

pub const S0: Reg = Reg(32);
pub const D0: Reg = Reg(96);

/// First of the four AAPCS integer/pointer argument registers (`r0..r3`).
pub const ARG_BASE: Reg = R0;
/// Count of AAPCS integer argument registers before spilling to the stack.
pub const ARG_REG_COUNT: u32 = 4;

/// First of the AAPCS VFP argument registers (`s0..s15` / `d0..d7`).
pub const FLOAT_ARG_BASE: Reg = S0;
pub const DOUBLE_ARG_BASE: Reg = D0;
/// Count of single/double-precision argument registers before spilling.
pub const FLOAT_ARG_REG_COUNT: u32 = 16;
pub const DOUBLE_ARG_REG_COUNT: u32 = 8;

pub const RETURN_REG: Reg = R0;
pub const STACK_ALIGNMENT: u64 = 8;
pub const POINTER_SIZE: usize = 4;
