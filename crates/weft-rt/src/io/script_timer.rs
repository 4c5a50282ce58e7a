// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Script timers: run an entry function later in a request of its own.
//!
//! Each firing gets a fresh synthetic request in the `timer` phase. A
//! periodic timer re-arms before its handler runs, so a failing handler
//! does not stop the schedule.

use std::rc::Rc;
use std::time::Duration;

use log::{debug, error};

use crate::co::{Co, Phase, Request, RequestKind};
use crate::error::ApiError;
use crate::io::timer::TimerId;
use crate::phase::run_entry;
use crate::runtime::Runtime;
use crate::value::{Func, Value};

pub(crate) struct ScriptTimer {
    timer: TimerId,
    job: Rc<TimerJob>,
}

struct TimerJob {
    delay: Duration,
    periodic: bool,
    entry: Func,
    args: Vec<Value>,
}

impl Runtime {
    /// Run `entry` once after `delay`, with `[premature, args...]`.
    pub fn timer_at(
        self: &Rc<Self>,
        delay: Duration,
        entry: Func,
        args: Vec<Value>,
    ) -> Result<(), ApiError> {
        arm(
            self,
            Rc::new(TimerJob {
                delay,
                periodic: false,
                entry,
                args,
            }),
        )
    }

    /// Run `entry` every `interval` until the worker shuts down.
    pub fn timer_every(
        self: &Rc<Self>,
        interval: Duration,
        entry: Func,
        args: Vec<Value>,
    ) -> Result<(), ApiError> {
        if interval.is_zero() {
            return Err(ApiError::ZeroInterval);
        }
        arm(
            self,
            Rc::new(TimerJob {
                delay: interval,
                periodic: true,
                entry,
                args,
            }),
        )
    }
}

impl Co {
    pub fn timer_at(&self, delay: Duration, entry: Func, args: Vec<Value>) -> Result<(), ApiError> {
        self.runtime()?.timer_at(delay, entry, args)
    }

    pub fn timer_every(
        &self,
        interval: Duration,
        entry: Func,
        args: Vec<Value>,
    ) -> Result<(), ApiError> {
        self.runtime()?.timer_every(interval, entry, args)
    }
}

fn arm(rt: &Rc<Runtime>, job: Rc<TimerJob>) -> Result<(), ApiError> {
    if rt.is_exiting() && !job.delay.is_zero() {
        return Err(ApiError::Exiting);
    }
    let pending = rt.pending_timers();
    if pending.get() >= rt.config().max_pending_timers {
        return Err(ApiError::TooManyTimers);
    }

    let key = rt.next_timer_key();
    let weak = Rc::downgrade(rt);
    let timer = rt.add_timer(job.delay, move || {
        if let Some(rt) = weak.upgrade() {
            fire(&rt, key, false);
        }
    });
    rt.script_timers
        .borrow_mut()
        .insert(key, ScriptTimer { timer, job });
    pending.set(pending.get() + 1);
    debug!("script timer {key} armed ({} pending)", pending.get());
    Ok(())
}

fn fire(rt: &Rc<Runtime>, key: u64, premature: bool) {
    let Some(st) = rt.script_timers.borrow_mut().remove(&key) else {
        return;
    };
    let pending = rt.pending_timers();
    pending.set(pending.get().saturating_sub(1));
    let job = st.job;

    if job.periodic && !premature && !rt.is_exiting() {
        if let Err(err) = arm(rt, job.clone()) {
            error!("failed to re-arm periodic timer: {err}");
        }
    }

    let running = rt.running_timers();
    if running.get() >= rt.config().max_running_timers {
        error!(
            "{} max_running_timers are not enough",
            rt.config().max_running_timers
        );
        return;
    }

    let req = Request::with_kind(rt, Phase::Timer, RequestKind::Timer);
    running.set(running.get() + 1);
    debug!(
        "script timer {key} fires in request {} (premature: {premature})",
        req.id()
    );

    let mut args = Vec::with_capacity(job.args.len() + 1);
    args.push(Value::Bool(premature));
    args.extend(job.args.iter().cloned());
    let outcome = run_entry(&req, job.entry.clone(), args);
    debug!("script timer {key}: {outcome:?}");
}

/// Fire every armed script timer now with `premature = true`.
pub(crate) fn abort_pending_timers(rt: &Rc<Runtime>) {
    let keys: Vec<u64> = rt.script_timers.borrow().keys().copied().collect();
    for key in keys {
        let timer = rt.script_timers.borrow().get(&key).map(|st| st.timer);
        if let Some(timer) = timer {
            rt.cancel_timer(timer);
            fire(rt, key, true);
        }
    }
}
