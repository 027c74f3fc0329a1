use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbgError>;

/// The four exception classes a running task can raise. These are the
/// causes a task's status carries when it stops for any reason other than
/// running to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Interrupt,
    InvalidInstruction,
    InvalidMemory,
    Panic,
}

impl ExceptionKind {
    fn label(&self) -> &'static str {
        match self {
            ExceptionKind::Interrupt => "Interrupt",
            ExceptionKind::InvalidInstruction => "InvalidInstruction",
            ExceptionKind::InvalidMemory => "InvalidMemory",
            ExceptionKind::Panic => "Panic",
        }
    }
}

/// Where in the guest an exception occurred: a raw program counter, and if
/// it falls inside a loaded module's bounds, that module's name and the
/// offset within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcLocation {
    pub pc: u64,
    pub module: Option<(String, u64)>,
}

/// A task-stopping exception, formatted the same way regardless of which
/// hook raised it so callers can surface it to a user directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulateException {
    pub kind: ExceptionKind,
    pub location: PcLocation,
    pub detail: String,
}

impl std::fmt::Display for SimulateException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location.module {
            Some((name, offset)) => write!(
                f,
                "[{}] module: {}, offset: {:08x}, {}",
                self.kind.label(),
                name,
                offset,
                self.detail
            ),
            None => write!(
                f,
                "[{}] pc: {:016x}, {}",
                self.kind.label(),
                self.location.pc,
                self.detail
            ),
        }
    }
}

impl std::error::Error for SimulateException {}

#[derive(Debug, Error)]
pub enum DbgError {
    #[error(transparent)]
    Emulator(#[from] dbgcore_emulator::EmulatorError),

    #[error(transparent)]
    Encoding(#[from] dbgcore_encoding::EncodingError),

    #[error(transparent)]
    Filesystem(#[from] dbgcore_filesystem::FsError),

    #[error(transparent)]
    Socket(#[from] dbgcore_socket::SocketError),

    #[error(transparent)]
    Simulate(#[from] SimulateException),

    #[error("task {0:?} is not pending")]
    TaskNotPending(crate::task::TaskId),

    #[error("no free task context available")]
    NoFreeContext,

    #[error("unknown module {0:?}")]
    UnknownModule(crate::module::ModuleId),

    #[error("control address pool exhausted")]
    ControlPoolExhausted,

    #[error("invalid configuration: {0}")]
    Config(String),

    // The remaining variants are the synchronous error surface from §6:
    // programming errors and resource errors that never become a task's
    // cancellation cause, only an `Err` returned straight back to the caller.
    #[error("task context is invalid or already released")]
    ContextInvalid,

    #[error("module not found")]
    ModuleNotFound,

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("hook callback does not match the registered hook kind")]
    HookCallbackType,

    #[error("task is invalid or has already completed")]
    TaskInvalid,

    #[error("unsupported calling convention: {0:?}")]
    CallingUnsupported(crate::arch::CallConv),

    #[error("unhandled exception: {0}")]
    UnhandledException(SimulateException),

    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),

    #[error("emulator stopped: {0}")]
    EmulatorStop(String),

    #[error("invalid address {0:#x}")]
    AddressInvalid(u64),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl DbgError {
    /// Wraps a backend failure as the synchronous `EmulatorStop` surface
    /// (§6) rather than letting a raw `EmulatorError` escape - used by the
    /// scheduler when `emulator.start`/`stop` itself fails, as opposed to a
    /// guest-raised exception, which takes the `Simulate` path instead.
    pub fn emulator_stop(err: impl std::fmt::Display) -> DbgError {
        DbgError::EmulatorStop(err.to_string())
    }
}
