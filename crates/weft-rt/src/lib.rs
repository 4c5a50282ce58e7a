// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Weft runtime: cooperative coroutine scheduling for a single-threaded
//! event-driven worker.
//!
//! Request handlers run as coroutines that look like they block on sockets,
//! timers, and sub-requests. Each blocking call suspends only the calling
//! coroutine; the worker keeps servicing other requests and resumes the
//! coroutine when its event fires.
//!
//! Components:
//! - co:      per-request coroutine trees, the resume loop, user threads
//! - phase:   entry points used by the request-phase driver
//! - io:      event loop, reactor, timers, and the I/O adapters
//! - runtime: per-worker state shared by every request
//! - config:  JSON-loaded limits and timeouts
//! - value:   values moved between coroutines

pub mod co;
pub mod config;
pub mod error;
pub mod io;
pub mod phase;
pub mod runtime;
pub mod value;

pub use co::{
    run_posted_threads, run_thread, Captured, Co, CoId, CoSnapshot, CoStatus, Outcome, Phase,
    PendingOp, Request, Wrapped,
};
pub use config::RuntimeConfig;
pub use error::{ApiError, ConfigError, FaultKind, IoFailure, ScriptError, SocketError};
pub use io::sema::Semaphore;
pub use io::socket::{Pattern, TcpSocket};
pub use io::worker::Worker;
pub use phase::{resume_after_io, run_entry};
pub use runtime::Runtime;
pub use value::{Func, Value};
