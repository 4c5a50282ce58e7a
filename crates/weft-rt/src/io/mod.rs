// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker I/O: the event loop and the adapters that suspend coroutines.
//!
//! Components:
//! - `reactor`:      epoll readiness with one-shot handlers
//! - `timer`:        deadline-ordered timer queue
//! - `worker`:       the loop tying events, timers, and the reactor together
//! - `sleep`:        timer-backed sleep
//! - `sema`:         FIFO counting semaphore
//! - `socket`:       non-blocking TCP socket
//! - `script_timer`: timers that run an entry function in a request of its own

pub mod reactor;
pub mod script_timer;
pub mod sema;
pub mod sleep;
pub mod socket;
pub mod timer;
pub mod worker;
