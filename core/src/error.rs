use std::cell::RefCell;
use std::fmt;

/// Error kinds surfaced by every fallible bridge operation.
///
/// Compile, load and runtime failures share one last-error slot on the
/// wrapper, so callers branch on the variant (or [`Error::code`]) and never on
/// message text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("load error: {0}")]
    Load(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("memory error: {0}")]
    Memory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(message.into())
    }

    /// The bare message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::Compile(msg)
            | Error::Load(msg)
            | Error::Runtime(msg)
            | Error::Memory(msg)
            | Error::InvalidArgument(msg) => msg,
        }
    }

    /// Error code reported on the C surface. Load failures share the compile
    /// code because both mean the chunk never started running.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Compile(_) | Error::Load(_) => ErrorCode::CompileError,
            Error::Runtime(_) => ErrorCode::RuntimeError,
            Error::Memory(_) => ErrorCode::MemoryError,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
        }
    }
}

/// Closed error-code enumeration shared with C callers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    CompileError = 1,
    RuntimeError = 2,
    MemoryError = 3,
    InvalidArgument = 4,
}

impl ErrorCode {
    pub fn of<T>(result: &Result<T>) -> ErrorCode {
        match result {
            Ok(_) => ErrorCode::Ok,
            Err(err) => err.code(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::CompileError => "compile error",
            ErrorCode::RuntimeError => "runtime error",
            ErrorCode::MemoryError => "memory error",
            ErrorCode::InvalidArgument => "invalid argument",
        };
        f.write_str(label)
    }
}

/// Wrapper-local "last error" slot.
///
/// Overwritten by every failing operation and cleared at the start of the
/// next fallible call. An empty slot means "no error", never an empty string.
#[derive(Debug, Default)]
pub struct LastError(RefCell<Option<String>>);

impl LastError {
    pub(crate) fn set(&self, message: impl Into<String>) {
        let message = message.into();
        *self.0.borrow_mut() = if message.is_empty() { None } else { Some(message) };
    }

    pub(crate) fn clear(&self) {
        self.0.borrow_mut().take();
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0.borrow().clone()
    }
}
