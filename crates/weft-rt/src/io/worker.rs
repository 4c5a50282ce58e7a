// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The worker event loop: deferred events, timers, then epoll.

use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::co::{Phase, Request};
use crate::config::RuntimeConfig;
use crate::io::script_timer::abort_pending_timers;
use crate::runtime::Runtime;

/// One worker: a runtime plus the loop that drives it.
pub struct Worker {
    rt: Rc<Runtime>,
}

impl Worker {
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        Ok(Self {
            rt: Runtime::new(config)?,
        })
    }

    pub fn runtime(&self) -> &Rc<Runtime> {
        &self.rt
    }

    /// A fresh client request in `phase`.
    pub fn request(&self, phase: Phase) -> Request {
        Request::new(&self.rt, phase)
    }

    /// Run one loop turn, blocking at most `max_wait` for I/O.
    /// Returns the number of events, timers, and I/O handlers that ran.
    pub fn run_once(&self, max_wait: Duration) -> io::Result<usize> {
        let mut n = self.rt.run_posted_events();
        n += self.rt.fire_expired_timers(Instant::now());

        let timeout_ms = if n > 0 || self.rt.has_events() {
            0
        } else {
            let wait = match self.rt.next_timer_deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(max_wait),
                None => max_wait,
            };
            // Round up so a timer is never polled for just before it is due.
            let ms = wait.as_nanos().div_ceil(1_000_000);
            i32::try_from(ms).unwrap_or(i32::MAX)
        };

        n += self.rt.reactor().poll_once(timeout_ms)?;
        n += self.rt.fire_expired_timers(Instant::now());
        n += self.rt.run_posted_events();
        Ok(n)
    }

    /// Loop until nothing is left to do or `limit` passes.
    /// Returns whether the runtime went idle.
    pub fn run_until_idle(&self, limit: Duration) -> io::Result<bool> {
        let start = Instant::now();
        while !self.rt.is_idle() {
            let elapsed = start.elapsed();
            if elapsed >= limit {
                debug!("worker still busy after {elapsed:?}");
                return Ok(false);
            }
            self.run_once(limit - elapsed)?;
        }
        Ok(true)
    }

    pub fn is_idle(&self) -> bool {
        self.rt.is_idle()
    }

    /// Stop accepting new timers and fire the pending ones as premature.
    pub fn shutdown(&self) {
        info!("worker shutting down");
        self.rt.set_exiting();
        abort_pending_timers(&self.rt);
        self.rt.run_posted_events();
    }
}
