// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Posted-thread queue draining.

use log::debug;

use super::coctx::CoStatus;
use super::request::Request;
use super::scheduler::{run_thread, Outcome};

/// Resume posted coroutines in FIFO order until the queue is empty or one
/// of them ends the request.
pub fn run_posted_threads(req: &Request) -> Outcome {
    loop {
        let next = {
            let mut ctx = req.ctx_mut();
            if ctx.destroyed {
                return ctx.outcome.clone().unwrap_or(Outcome::Error);
            }
            ctx.posted.pop_front()
        };
        let Some(id) = next else {
            return Outcome::Suspend;
        };
        if req.status(id) != CoStatus::Running {
            debug!("skip posted thread {id}: {}", req.status(id));
            continue;
        }
        match run_thread(req, id, Vec::new()) {
            Outcome::Suspend => continue,
            done => return done,
        }
    }
}
