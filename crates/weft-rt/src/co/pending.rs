// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pending-operation registration.
//!
//! A coroutine blocked on an adapter carries exactly one `PendingOp`. The
//! adapter's event handler clears it before resuming the coroutine; every
//! other path out (kill, teardown, a second registration) runs it instead.
//! Either way the handler is consumed, so it can run at most once.
//!
//! Handlers only release adapter state (timers, fds, wait queues) and are
//! invoked with no borrow of the request context held.

use log::debug;

use super::arena::CoId;
use super::handle::Co;
use super::request::Request;

pub struct PendingOp {
    label: &'static str,
    handler: Box<dyn FnOnce()>,
}

impl PendingOp {
    pub fn new(label: &'static str, handler: impl FnOnce() + 'static) -> Self {
        Self {
            label,
            handler: Box::new(handler),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn run(self) {
        (self.handler)()
    }
}

impl std::fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PendingOp({})", self.label)
    }
}

impl Request {
    /// Register the cleanup for the operation `co` is about to block on.
    /// A stale registration is run first.
    pub fn set_pending(&self, co: CoId, op: PendingOp) {
        self.cleanup_pending_operation(co);
        if let Some(ctx) = self.ctx_mut().cos.get_mut(co) {
            ctx.pending = Some(op);
        }
    }

    /// Drop the registration without running it: the operation completed.
    pub fn clear_pending(&self, co: CoId) {
        let op = self
            .ctx_mut()
            .cos
            .get_mut(co)
            .and_then(|ctx| ctx.pending.take());
        // Dropped after the borrow is released; the handler may own adapter state.
        drop(op);
    }

    /// Run and clear the registration, if any.
    pub fn cleanup_pending_operation(&self, co: CoId) {
        let op = self
            .ctx_mut()
            .cos
            .get_mut(co)
            .and_then(|ctx| ctx.pending.take());
        if let Some(op) = op {
            debug!("cleanup pending {} on co {co}", op.label());
            op.run();
        }
    }

    pub fn has_pending(&self, co: CoId) -> bool {
        self.ctx()
            .cos
            .get(co)
            .map_or(false, |ctx| ctx.pending.is_some())
    }
}

impl Co {
    pub fn set_pending(&self, label: &'static str, handler: impl FnOnce() + 'static) {
        if let Ok(req) = self.request() {
            req.set_pending(self.id(), PendingOp::new(label, handler));
        }
    }

    pub fn clear_pending(&self) {
        if let Ok(req) = self.request() {
            req.clear_pending(self.id());
        }
    }

    pub fn cleanup_pending_operation(&self) {
        if let Ok(req) = self.request() {
            req.cleanup_pending_operation(self.id());
        }
    }
}
