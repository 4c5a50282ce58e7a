// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types for the coroutine runtime.
//!
//! Three families:
//! - `ScriptError`: a fault inside a coroutine body; kills that coroutine
//! - `ApiError`:    misuse rejected at the call boundary
//! - `IoFailure`:   operational adapter failures, returned as values

use std::fmt;
use std::io;

use crate::co::CoStatus;
use crate::value::Value;

/// Kind of fault raised from a coroutine body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Runtime,
    Syntax,
    Memory,
    Handler,
    Unknown,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::Runtime => "runtime error",
            FaultKind::Syntax => "syntax error",
            FaultKind::Memory => "memory allocation error",
            FaultKind::Handler => "error handler error",
            FaultKind::Unknown => "unknown error",
        };
        f.write_str(s)
    }
}

/// A fault that terminated a coroutine body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ScriptError {
    pub kind: FaultKind,
    pub message: String,
    /// Coroutine chain captured when the fault reached the scheduler.
    pub traceback: Option<String>,
}

impl ScriptError {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Runtime, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Syntax, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Memory, message)
    }

    /// The value handed to whichever coroutine receives this failure.
    pub fn to_value(&self) -> Value {
        Value::Str(self.message.clone())
    }
}

impl From<ApiError> for ScriptError {
    fn from(err: ApiError) -> Self {
        ScriptError::runtime(err.to_string())
    }
}

impl From<SocketError> for ScriptError {
    fn from(err: SocketError) -> Self {
        ScriptError::runtime(err.to_string())
    }
}

/// Misuse of a scheduler primitive. Nothing is mutated when one is returned,
/// except where a variant says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("no request found")]
    NoRequest,
    #[error("no co ctx found")]
    NoCoCtx,
    #[error("API disabled in the context of {0}")]
    NotYieldable(&'static str),
    #[error("at least one coroutine should be specified")]
    NoThreads,
    #[error("attempt to wait on a coroutine that is not a user thread")]
    WaitNotUserThread,
    #[error("only the parent coroutine can wait on the thread")]
    WaitNotParent,
    #[error("already waited or killed")]
    AlreadyWaited,
    #[error("not user thread")]
    KillNotUserThread,
    #[error("killer not parent")]
    KillerNotParent,
    #[error("pending subrequests")]
    PendingSubrequests,
    /// The zombie target has been reaped by the call that returned this.
    #[error("already terminated")]
    AlreadyTerminated,
    #[error("cannot resume {0} coroutine")]
    CannotResume(CoStatus),
    #[error("duplicate call")]
    DuplicateCall,
    #[error("check_client_abort is off")]
    ClientAbortDisabled,
    #[error("invalid sleep duration")]
    InvalidSleep,
    #[error("delay cannot be zero")]
    ZeroInterval,
    #[error("process exiting")]
    Exiting,
    #[error("too many pending timers")]
    TooManyTimers,
    #[error("request already finalized")]
    Finalized,
}

/// Failure classes produced by I/O adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoFailure {
    #[error("timeout")]
    Timeout,
    #[error("closed")]
    Closed,
    #[error("resolver: {0}")]
    Resolver(String),
    #[error("no memory")]
    NoMemory,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("client aborted")]
    ClientAborted,
    #[error("partial write")]
    PartialWrite,
    #[error("socket busy {0}")]
    Busy(&'static str),
    #[error("{0}")]
    Other(String),
}

impl IoFailure {
    /// Map an OS error to its failure class, lower-casing the strerror text.
    pub fn from_io(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) => IoFailure::Timeout,
            Some(libc::ECONNRESET) | Some(libc::EPIPE) => IoFailure::Closed,
            Some(libc::ENOMEM) | Some(libc::ENOBUFS) => IoFailure::NoMemory,
            Some(code) => {
                let text = io::Error::from_raw_os_error(code).to_string();
                // Drop the " (os error N)" suffix std appends.
                let text = text.split(" (os error").next().unwrap_or("error");
                IoFailure::Other(text.to_lowercase())
            }
            None => IoFailure::Other("error".into()),
        }
    }
}

/// An adapter failure plus whatever data arrived before it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct SocketError {
    pub kind: IoFailure,
    pub partial: Vec<u8>,
}

impl SocketError {
    pub fn new(kind: IoFailure) -> Self {
        Self {
            kind,
            partial: Vec::new(),
        }
    }

    pub fn with_partial(kind: IoFailure, partial: Vec<u8>) -> Self {
        Self { kind, partial }
    }
}

impl From<ApiError> for SocketError {
    fn from(err: ApiError) -> Self {
        SocketError::new(IoFailure::Other(err.to_string()))
    }
}

impl From<IoFailure> for SocketError {
    fn from(kind: IoFailure) -> Self {
        SocketError::new(kind)
    }
}

/// Errors loading a `RuntimeConfig`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
