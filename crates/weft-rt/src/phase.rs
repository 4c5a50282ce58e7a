// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Phase driver entry points: start a request's entry coroutine and resume
//! a coroutine when its adapter event fires.
//!
//! Both run the scheduler, drain the posted queue when it suspends, and
//! finalize the request on a terminal outcome.

use log::{debug, warn};

use crate::co::{run_posted_threads, run_thread, CoId, Outcome, Request};
use crate::value::{Func, Value};

/// Run `func` as the entry coroutine of `req`.
pub fn run_entry(req: &Request, func: Func, args: Vec<Value>) -> Outcome {
    let id = match req.start_entry(func, args) {
        Ok(id) => id,
        Err(err) => {
            warn!("request {}: cannot start entry: {err}", req.id());
            return Outcome::Error;
        }
    };
    let outcome = run_thread(req, id, Vec::new());
    settle(req, outcome)
}

/// Resume `co` with the results of the operation it was blocked on.
pub fn resume_after_io(req: &Request, co: CoId, results: Vec<Value>) -> Outcome {
    if req.is_destroyed() {
        debug!("request {} already finalized, not resuming {co}", req.id());
        return req.outcome().unwrap_or(Outcome::Error);
    }
    let outcome = run_thread(req, co, results);
    settle(req, outcome)
}

pub(crate) fn settle(req: &Request, outcome: Outcome) -> Outcome {
    let outcome = match outcome {
        Outcome::Suspend => run_posted_threads(req),
        done => done,
    };
    if outcome.is_terminal() {
        req.finalize(outcome)
    } else {
        Outcome::Suspend
    }
}
