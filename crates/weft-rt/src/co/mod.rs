// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutine scheduler: per-request coroutine trees and the resume loop.

mod arena;
mod coctx;
mod control;
mod coroutine;
mod handle;
mod pending;
mod posted;
mod request;
mod scheduler;
mod subreq;
mod traceback;
mod uthread;

pub use arena::CoId;
pub use coctx::{CoSnapshot, CoStatus};
pub use coroutine::Wrapped;
pub use handle::Co;
pub use pending::PendingOp;
pub use posted::run_posted_threads;
pub use request::{Phase, Request};
pub use scheduler::{run_thread, Outcome};
pub use subreq::Captured;

pub(crate) use coctx::CoOp;
pub(crate) use request::{RequestKind, WeakRequest};
