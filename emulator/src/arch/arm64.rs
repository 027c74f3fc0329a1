use crate::Reg;

pub const X0: Reg = Reg(0);
pub const X1: Reg = Reg(1);
pub const X2: Reg = Reg(2);
pub const X3: Reg = Reg(3);
pub const X4: Reg = Reg(4);
pub const X5: Reg = Reg(5);
pub const X6: Reg = Reg(6);
pub const X7: Reg = Reg(7);
pub const X29: Reg = Reg(29); // frame pointer
pub const X30: Reg = Reg(30); // link register
pub const SP: Reg = Reg(31);
pub const PC: Reg = Reg(32);
pub const NZCV: Reg = Reg(33);
/// Architectural feature-access control register; bit 20-21 (`FPEN`) must
/// be set before the guest can execute any SIMD/FP instruction.
pub const CPACR_EL1: Reg = Reg(34);

pub const Q0: Reg = Reg(64);
pub const D0: Reg = Reg(128);
pub const S0: Reg = Reg(192);

/// First of the eight AAPCS64 integer/pointer argument registers (`x0..x7`).
pub const ARG_BASE: Reg = X0;
pub const ARG_REG_COUNT: u32 = 8;

/// First of the AAPCS64 SIMD/FP argument registers (`v0..v7`), addressed
/// here by width since the ABI stream picks the register file matching the
/// field type.
pub const FLOAT_ARG_BASE: Reg = S0;
pub const DOUBLE_ARG_BASE: Reg = D0;
pub const FLOAT_ARG_REG_COUNT: u32 = 8;
pub const DOUBLE_ARG_REG_COUNT: u32 = 8;

pub const RETURN_REG: Reg = X0;
pub const STACK_ALIGNMENT: u64 = 16;
pub const POINTER_SIZE: usize = 8;
