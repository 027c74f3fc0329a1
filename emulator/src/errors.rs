use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmulatorError>;

/// Errors a backend can surface through the [`crate::Emulator`] facade.
///
/// These map onto the backend's own error codes (Unicorn's `uc_err` and
/// similar); `dbgcore` never constructs these itself, only propagates them.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("unmapped memory at {addr:#x} ({size} bytes)")]
    Unmapped { addr: u64, size: u64 },

    #[error("memory already mapped at {addr:#x} ({size} bytes)")]
    AlreadyMapped { addr: u64, size: u64 },

    #[error("memory protection violation at {addr:#x}")]
    ProtectionViolation { addr: u64 },

    #[error("invalid register id {0:?}")]
    InvalidRegister(crate::Reg),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend error: {0}")]
    Backend(String),
}
