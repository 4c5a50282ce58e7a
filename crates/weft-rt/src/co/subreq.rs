// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sub-requests: run entry functions as child requests and collect their
//! outcomes in the caller.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use super::arena::CoId;
use super::coctx::CoOp;
use super::handle::Co;
use super::pending::PendingOp;
use super::request::{Phase, Request, RequestKind, WeakRequest};
use super::scheduler::Outcome;
use crate::error::ApiError;
use crate::phase::{resume_after_io, run_entry};
use crate::value::{Func, Value};

/// What one child request ended with.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    pub outcome: Outcome,
    /// Values returned by the child's entry coroutine.
    pub values: Vec<Value>,
}

struct CaptureState {
    results: RefCell<Vec<Option<Captured>>>,
    remaining: Cell<usize>,
    cancelled: Cell<bool>,
}

impl CaptureState {
    fn take_results(&self) -> Vec<Captured> {
        self.results
            .borrow_mut()
            .drain(..)
            .map(|r| {
                r.unwrap_or(Captured {
                    outcome: Outcome::Error,
                    values: Vec::new(),
                })
            })
            .collect()
    }
}

/// Ties a child request back to the coroutine waiting for it.
pub(crate) struct SubLink {
    parent: WeakRequest,
    co: CoId,
    slot: usize,
    state: Rc<CaptureState>,
}

impl SubLink {
    /// Called once when the child request is finalized.
    pub(crate) fn complete(self, outcome: Outcome, values: Vec<Value>) {
        if self.state.cancelled.get() {
            return;
        }
        if let Some(slot) = self.state.results.borrow_mut().get_mut(self.slot) {
            *slot = Some(Captured { outcome, values });
        }
        let remaining = self.state.remaining.get().saturating_sub(1);
        self.state.remaining.set(remaining);

        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        if let Some(c) = parent.ctx_mut().cos.get_mut(self.co) {
            c.pending_subreqs = c.pending_subreqs.saturating_sub(1);
        }
        if remaining > 0 {
            return;
        }

        debug!("request {}: all sub-requests of co {} done", parent.id(), self.co);
        let co = self.co;
        let rt = parent.runtime();
        rt.post_event(move || {
            parent.clear_pending(co);
            resume_after_io(&parent, co, Vec::new());
        });
    }
}

impl Co {
    /// Run each `(entry, args)` as a child request and wait for all of them.
    /// Results come back in argument order.
    pub async fn capture(&self, calls: Vec<(Func, Vec<Value>)>) -> Result<Vec<Captured>, ApiError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.prepare_capture(calls)?;
        self.suspend().await;
        Ok(state.take_results())
    }

    fn prepare_capture(
        &self,
        calls: Vec<(Func, Vec<Value>)>,
    ) -> Result<Rc<CaptureState>, ApiError> {
        let req = self.check_yieldable()?;
        let rt = req.runtime();
        let n = calls.len();
        let state = Rc::new(CaptureState {
            results: RefCell::new(vec![None; n]),
            remaining: Cell::new(n),
            cancelled: Cell::new(false),
        });

        let mut children = Vec::with_capacity(n);
        for (slot, (entry, args)) in calls.into_iter().enumerate() {
            let link = SubLink {
                parent: req.downgrade(),
                co: self.id(),
                slot,
                state: state.clone(),
            };
            let child = Request::with_kind(&rt, Phase::Content, RequestKind::Subrequest(link));
            debug!("co {} starts sub-request {}", self.id(), child.id());
            children.push(child.clone());
            rt.post_event(move || {
                run_entry(&child, entry, args);
            });
        }

        let cancel_state = state.clone();
        req.set_pending(
            self.id(),
            PendingOp::new("subrequest", move || {
                cancel_state.cancelled.set(true);
                for child in children {
                    child.finalize(Outcome::Error);
                }
            }),
        );
        if let Some(c) = req.ctx_mut().cos.get_mut(self.id()) {
            c.pending_subreqs += n;
        }
        self.prepare_yield(&req, CoOp::Nop, Vec::new());
        Ok(state)
    }
}
