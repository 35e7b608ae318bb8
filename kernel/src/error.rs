//! Kernel error types.
//!
//! A flat enum of subsystem errors rather than one type per module --
//! every fallible kernel operation threads back through `syscall::dispatch`
//! to a single `errno` mapping, so a single `Display`-able type at the top
//! keeps that mapping in one place.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors.
    OutOfMemory {
        requested: usize,
    },
    InvalidAddress {
        addr: usize,
    },
    UnmappedMemory {
        addr: usize,
    },

    /// Process/thread-related errors.
    ProcessNotFound {
        pid: u32,
    },
    ThreadNotFound {
        tid: u32,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// IPC-related errors.
    IpcError(IpcError),

    /// Scheduler-related errors.
    SchedulerError(SchedError),

    /// System call errors.
    SyscallError(SyscallError),

    /// Filesystem-related errors.
    FsError(FsError),

    /// Signal-related errors.
    SignalError(SignalError),

    /// Hardware errors.
    HardwareError {
        device: &'static str,
        code: u32,
    },

    /// Generic errors.
    InvalidArgument {
        reason: &'static str,
    },
    OperationNotSupported {
        operation: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
        id: u32,
    },
    NotFound {
        resource: &'static str,
        id: u32,
    },
    NotImplemented {
        feature: &'static str,
    },
    /// Operation would block (non-blocking fd, empty pipe, etc).
    WouldBlock,
    /// Write end closed on a pipe/socket, or read end closed.
    BrokenPipe,
    /// Subsystem used before its `init()` ran.
    NotInitialized {
        subsystem: &'static str,
    },
    /// Legacy string error for call sites not yet given a specific variant.
    LegacyError {
        message: &'static str,
    },
}

/// IPC-specific errors (listener endpoints, futexes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    InvalidEndpoint { id: u32 },
    MessageTooLarge { size: usize, max: usize },
    QueueFull { capacity: usize },
    QueueEmpty,
    EndpointNotFound { id: u32 },
    PermissionDenied,
    WouldBlock,
    Timeout,
}

/// Scheduler-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    TaskNotFound { id: u32 },
    CpuOffline { cpu: usize },
    InvalidCpuId { cpu: usize },
    QueueEmpty,
}

/// System call errors, mapped to POSIX-style errno values at the
/// dispatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall { nr: u32 },
    InvalidArgument { arg: usize },
    InvalidPointer { addr: usize },
    BufferTooSmall { required: usize, provided: usize },
    AccessDenied,
    NotImplemented,
}

/// Filesystem-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    NotADirectory,
    NotAFile,
    IsADirectory,
    ReadOnly,
    InvalidPath,
    NoRootFs,
    AlreadyMounted,
    NotMounted,
    UnknownFsType,
    IoError,
    DirectoryNotEmpty,
    TooManyOpenFiles,
    BadFileDescriptor,
    NotSupported,
    NotASymlink,
    FileTooLarge,
}

/// Signal-subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    InvalidSignal { num: u32 },
    NoHandler,
    CannotCatch,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: requested {} bytes", requested)
            }
            Self::InvalidAddress { addr } => write!(f, "invalid address: 0x{:x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at 0x{:x}", addr),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::ThreadNotFound { tid } => write!(f, "thread {} not found", tid),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::IpcError(e) => write!(f, "ipc error: {:?}", e),
            Self::SchedulerError(e) => write!(f, "scheduler error: {:?}", e),
            Self::SyscallError(e) => write!(f, "syscall error: {:?}", e),
            Self::FsError(e) => write!(f, "filesystem error: {:?}", e),
            Self::SignalError(e) => write!(f, "signal error: {:?}", e),
            Self::HardwareError { device, code } => {
                write!(f, "hardware error on {}: code 0x{:x}", device, code)
            }
            Self::InvalidArgument { reason } => write!(f, "invalid argument: {}", reason),
            Self::OperationNotSupported { operation } => {
                write!(f, "operation not supported: {}", operation)
            }
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied for operation: {}", operation)
            }
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} with id {} already exists", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::NotImplemented { feature } => write!(f, "feature not implemented: {}", feature),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::LegacyError { message } => write!(f, "{}", message),
        }
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::IpcError(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedulerError(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::SyscallError(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}

impl From<SignalError> for KernelError {
    fn from(err: SignalError) -> Self {
        Self::SignalError(err)
    }
}

/// Gradual-migration escape hatch: lets call sites written against a
/// plain `&'static str` error still compose with `?` into `KernelResult`.
impl From<&'static str> for KernelError {
    fn from(msg: &'static str) -> Self {
        Self::LegacyError { message: msg }
    }
}
