// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The `Co` handle a coroutine body uses to reach the scheduler, and the
//! single poll step the scheduler drives it with.
//!
//! Bodies are futures polled only by the scheduler, never by a waker: a
//! `Pending` result means "yielded", and the next poll happens when the
//! scheduler resumes that coroutine with values on its stack.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use super::arena::CoId;
use super::coctx::{Body, CoOp};
use super::request::{Request, WeakRequest};
use crate::error::{ApiError, FaultKind, ScriptError};
use crate::runtime::Runtime;
use crate::value::Value;

/// Handle passed to every coroutine body.
#[derive(Clone)]
pub struct Co {
    req: WeakRequest,
    id: CoId,
}

impl Co {
    pub(crate) fn new(req: &Request, id: CoId) -> Self {
        Self {
            req: req.downgrade(),
            id,
        }
    }

    /// This coroutine's handle.
    pub fn id(&self) -> CoId {
        self.id
    }

    pub fn request(&self) -> Result<Request, ApiError> {
        self.req.upgrade().ok_or(ApiError::NoRequest)
    }

    pub fn runtime(&self) -> Result<Rc<Runtime>, ApiError> {
        Ok(self.request()?.runtime())
    }

    /// Checks shared by every primitive that suspends the caller.
    pub(crate) fn check_yieldable(&self) -> Result<Request, ApiError> {
        let req = self.request()?;
        {
            let ctx = req.ctx();
            if ctx.destroyed {
                return Err(ApiError::Finalized);
            }
            if !ctx.phase.is_yieldable() {
                return Err(ApiError::NotYieldable(ctx.phase.as_str()));
            }
            if !ctx.cos.contains(self.id) {
                return Err(ApiError::NoCoCtx);
            }
        }
        Ok(req)
    }

    /// Leave `values` for the scheduler and tag why we are yielding.
    pub(crate) fn prepare_yield(&self, req: &Request, op: CoOp, values: Vec<Value>) {
        let mut ctx = req.ctx_mut();
        ctx.co_op = op;
        if let Some(co) = ctx.cos.get_mut(self.id) {
            co.stack = values;
        }
    }

    /// Yield to the scheduler. Resolves to the values this coroutine is
    /// resumed with.
    pub(crate) fn suspend(&self) -> Suspend {
        Suspend {
            co: self.clone(),
            yielded: false,
        }
    }
}

impl std::fmt::Debug for Co {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Co({})", self.id)
    }
}

pub(crate) struct Suspend {
    co: Co,
    yielded: bool,
}

impl Future for Suspend {
    type Output = Vec<Value>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.yielded {
            self.yielded = true;
            return Poll::Pending;
        }
        let values = match self.co.req.upgrade() {
            Some(req) => req
                .ctx_mut()
                .cos
                .get_mut(self.co.id)
                .map(|c| std::mem::take(&mut c.stack))
                .unwrap_or_default(),
            None => Vec::new(),
        };
        Poll::Ready(values)
    }
}

/// Result of driving a coroutine body up to its next suspension point.
pub(crate) enum Step {
    Yielded,
    Returned(Vec<Value>),
    Failed(ScriptError),
}

struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

/// Poll `id` once. The body is taken out of its slot for the duration so
/// the request is not borrowed while user code runs.
pub(crate) fn resume_body(req: &Request, id: CoId) -> Step {
    let taken = {
        let mut ctx = req.ctx_mut();
        let Some(co) = ctx.cos.get_mut(id) else {
            return Step::Failed(ScriptError::new(FaultKind::Unknown, "no co ctx found"));
        };
        match std::mem::replace(&mut co.body, Body::Polling) {
            Body::Entry(func) => Ok((func, std::mem::take(&mut co.stack))),
            Body::Started(body) => Err(body),
            other => {
                co.body = other;
                return Step::Failed(ScriptError::runtime("cannot resume dead coroutine"));
            }
        }
    };

    let mut body = match taken {
        Ok((func, args)) => {
            let co = Co::new(req, id);
            match catch_unwind(AssertUnwindSafe(|| func.start(co, args))) {
                Ok(body) => body,
                Err(payload) => {
                    mark_finished(req, id);
                    return Step::Failed(ScriptError::runtime(panic_message(payload)));
                }
            }
        }
        Err(body) => body,
    };

    let waker = Waker::from(Arc::new(NoopWaker));
    let mut cx = Context::from_waker(&waker);
    let polled = catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));

    match polled {
        Ok(Poll::Pending) => {
            let mut ctx = req.ctx_mut();
            if let Some(co) = ctx.cos.get_mut(id) {
                co.body = Body::Started(body);
            } else {
                // Reclaimed while running; drop the body once unborrowed.
                drop(ctx);
                drop(body);
            }
            Step::Yielded
        }
        Ok(Poll::Ready(result)) => {
            mark_finished(req, id);
            drop(body);
            match result {
                Ok(values) => Step::Returned(values),
                Err(err) => Step::Failed(err),
            }
        }
        Err(payload) => {
            mark_finished(req, id);
            drop(body);
            Step::Failed(ScriptError::runtime(panic_message(payload)))
        }
    }
}

fn mark_finished(req: &Request, id: CoId) {
    if let Some(co) = req.ctx_mut().cos.get_mut(id) {
        co.body = Body::Finished;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
