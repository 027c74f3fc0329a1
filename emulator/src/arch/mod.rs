//! Register id constants for each supported guest architecture.
//!
//! These mirror the numbering a Unicorn-style backend assigns to its own
//! `UC_ARM_REG_*` / `UC_ARM64_REG_*` enums. `dbgcore`'s ABI streams index
//! into these with [`crate::Reg::add`] to walk argument register runs.

pub mod arm;
pub mod arm64;
