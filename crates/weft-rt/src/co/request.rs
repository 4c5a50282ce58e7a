// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Request context: the coroutine tree of one request and its lifecycle.
//!
//! The request owns every coroutine through an arena. Teardown walks the
//! tree explicitly, running each pending cleanup once; it is idempotent.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use log::{debug, error};

use super::arena::{Arena, CoId};
use super::coctx::{CoCtx, CoOp, CoSnapshot, CoStatus};
use super::pending::PendingOp;
use super::scheduler::Outcome;
use super::subreq::SubLink;
use crate::error::ApiError;
use crate::runtime::Runtime;
use crate::value::{Func, Value};

/// Request processing phase. Decides which primitives may yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Rewrite,
    Access,
    Content,
    Timer,
    Log,
    HeaderFilter,
    BodyFilter,
    InitWorker,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Rewrite => "rewrite",
            Phase::Access => "access",
            Phase::Content => "content",
            Phase::Timer => "timer",
            Phase::Log => "log",
            Phase::HeaderFilter => "header_filter",
            Phase::BodyFilter => "body_filter",
            Phase::InitWorker => "init_worker",
        }
    }

    pub fn is_yieldable(self) -> bool {
        matches!(
            self,
            Phase::Rewrite | Phase::Access | Phase::Content | Phase::Timer
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect recorded by exit/exec/rewrite, acted on by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Jump {
    Exit(i32),
    Exec { uri: String, args: String },
    Rewrite(String),
}

pub(crate) enum RequestKind {
    Client,
    /// Synthesized to host a script timer handler.
    Timer,
    Subrequest(SubLink),
}

pub(crate) struct ReqCtx {
    pub id: u64,
    pub runtime: Rc<Runtime>,
    pub phase: Phase,
    pub kind: RequestKind,
    pub cos: Arena<CoCtx>,
    pub entry: Option<CoId>,
    /// Selected to run next; `None` hands control back to the caller.
    pub current: Option<CoId>,
    pub posted: VecDeque<CoId>,
    pub uthreads: usize,
    pub co_op: CoOp,
    pub jump: Option<Jump>,
    pub on_abort: Option<CoId>,
    pub header_sent: bool,
    pub no_abort: bool,
    /// Request cleanup already ran.
    pub cleaned: bool,
    pub destroyed: bool,
    pub outcome: Option<Outcome>,
    /// Values the entry coroutine returned.
    pub results: Vec<Value>,
}

impl ReqCtx {
    /// Entry coroutine or a user thread, as opposed to a library coroutine.
    pub fn is_thread(&self, id: CoId) -> bool {
        self.entry == Some(id) || self.cos.get(id).map_or(false, |c| c.is_uthread)
    }

    pub fn is_alive(&self, id: CoId) -> bool {
        self.cos.get(id).map_or(false, |c| c.status.is_alive())
    }

    pub fn entry_alive(&self) -> bool {
        self.entry.map_or(false, |id| self.is_alive(id))
    }

    pub fn status(&self, id: CoId) -> CoStatus {
        self.cos.get(id).map_or(CoStatus::Dead, |c| c.status)
    }

    pub fn post_thread(&mut self, id: CoId) {
        debug!("post thread {id}");
        self.posted.push_back(id);
    }

    /// Coroutines below `root` reached only through library coroutines:
    /// its resume chain and whatever it created. User threads, and what
    /// lies below them, are not included. Deepest first.
    pub fn library_descendants(&self, root: CoId) -> Vec<CoId> {
        let mut found = Vec::new();
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            for (id, c) in self.cos.iter() {
                if c.parent == Some(parent) && !c.is_uthread && self.on_abort != Some(id) {
                    found.push(id);
                    frontier.push(id);
                }
            }
        }
        found.reverse();
        found
    }

    /// Reap finished children that nobody waited for.
    pub fn take_zombie_children(&mut self, id: CoId) -> Vec<CoCtx> {
        let zombies = match self.cos.get_mut(id) {
            Some(c) => std::mem::take(&mut c.zombie_children),
            None => return Vec::new(),
        };
        let mut reaped = Vec::new();
        for z in zombies {
            if self.cos.get(z).map(|c| c.status) == Some(CoStatus::Zombie) {
                if let Some(c) = self.cos.remove(z) {
                    self.uthreads -= 1;
                    reaped.push(c);
                }
            }
        }
        reaped
    }
}

/// Shared handle to a request context.
#[derive(Clone)]
pub struct Request(Rc<RefCell<ReqCtx>>);

#[derive(Clone)]
pub(crate) struct WeakRequest(Weak<RefCell<ReqCtx>>);

impl WeakRequest {
    pub fn upgrade(&self) -> Option<Request> {
        self.0.upgrade().map(Request)
    }
}

impl Request {
    pub fn new(rt: &Rc<Runtime>, phase: Phase) -> Self {
        Self::with_kind(rt, phase, RequestKind::Client)
    }

    pub(crate) fn with_kind(rt: &Rc<Runtime>, phase: Phase, kind: RequestKind) -> Self {
        let id = rt.next_request_id();
        debug!("new request {id} in {phase}");
        Request(Rc::new(RefCell::new(ReqCtx {
            id,
            runtime: rt.clone(),
            phase,
            kind,
            cos: Arena::new(),
            entry: None,
            current: None,
            posted: VecDeque::new(),
            uthreads: 0,
            co_op: CoOp::Nop,
            jump: None,
            on_abort: None,
            header_sent: false,
            no_abort: false,
            cleaned: false,
            destroyed: false,
            outcome: None,
            results: Vec::new(),
        })))
    }

    pub(crate) fn ctx(&self) -> Ref<'_, ReqCtx> {
        self.0.borrow()
    }

    pub(crate) fn ctx_mut(&self) -> RefMut<'_, ReqCtx> {
        self.0.borrow_mut()
    }

    pub(crate) fn downgrade(&self) -> WeakRequest {
        WeakRequest(Rc::downgrade(&self.0))
    }

    pub fn id(&self) -> u64 {
        self.ctx().id
    }

    pub fn runtime(&self) -> Rc<Runtime> {
        self.ctx().runtime.clone()
    }

    pub fn phase(&self) -> Phase {
        self.ctx().phase
    }

    pub fn entry(&self) -> Option<CoId> {
        self.ctx().entry
    }

    pub fn current(&self) -> Option<CoId> {
        self.ctx().current
    }

    pub fn live_user_threads(&self) -> usize {
        self.ctx().uthreads
    }

    pub fn posted_len(&self) -> usize {
        self.ctx().posted.len()
    }

    pub fn status(&self, id: CoId) -> CoStatus {
        self.ctx().status(id)
    }

    pub fn header_sent(&self) -> bool {
        self.ctx().header_sent
    }

    pub fn mark_header_sent(&self) {
        self.ctx_mut().header_sent = true;
    }

    /// With `no_abort`, a failing entry coroutine ends the request with
    /// `Outcome::Error` rather than a 500 response.
    pub fn set_no_abort(&self, no_abort: bool) {
        self.ctx_mut().no_abort = no_abort;
    }

    pub fn is_destroyed(&self) -> bool {
        self.ctx().destroyed
    }

    /// The terminal outcome, once the request has been finalized.
    pub fn outcome(&self) -> Option<Outcome> {
        self.ctx().outcome.clone()
    }

    /// Values returned by the entry coroutine.
    pub fn results(&self) -> Vec<Value> {
        self.ctx().results.clone()
    }

    pub fn snapshot(&self) -> Vec<CoSnapshot> {
        let ctx = self.ctx();
        ctx.cos
            .iter()
            .map(|(id, c)| CoSnapshot::of(id, c))
            .collect()
    }

    /// Create the entry coroutine. It runs on the first `run_thread`.
    pub fn start_entry(&self, entry: Func, args: Vec<Value>) -> Result<CoId, ApiError> {
        let mut ctx = self.ctx_mut();
        if ctx.destroyed {
            return Err(ApiError::Finalized);
        }
        if ctx.entry_alive() {
            return Err(ApiError::DuplicateCall);
        }
        let mut co = CoCtx::new(entry, None, args);
        co.status = CoStatus::Running;
        let id = ctx.cos.insert(co);
        ctx.entry = Some(id);
        debug!("request {} entry co {id}", ctx.id);
        Ok(id)
    }

    /// Tear down every coroutine still in the tree, children before parents,
    /// running each pending cleanup exactly once.
    pub(crate) fn finalize_threads(&self) {
        let (ops, removed) = {
            let mut ctx = self.ctx_mut();
            debug!("request {} finalize threads", ctx.id);
            let order = teardown_order(&ctx);
            let mut ops: Vec<PendingOp> = Vec::new();
            let mut removed = Vec::new();
            for id in order {
                let Some(mut co) = ctx.cos.remove(id) else {
                    continue;
                };
                if co.is_uthread {
                    ctx.uthreads = ctx.uthreads.saturating_sub(1);
                }
                co.status = CoStatus::Dead;
                if let Some(op) = co.pending.take() {
                    ops.push(op);
                }
                removed.push(co);
            }
            if ctx.uthreads != 0 {
                error!(
                    "request {}: {} user threads unaccounted for at teardown",
                    ctx.id, ctx.uthreads
                );
                ctx.uthreads = 0;
            }
            ctx.current = None;
            ctx.posted.clear();
            ctx.on_abort = None;
            (ops, removed)
        };

        for op in ops {
            debug!("teardown: cleanup pending {}", op.label());
            op.run();
        }
        drop(removed);
    }

    /// Request-level cleanup. Safe to call any number of times.
    pub fn cleanup(&self) {
        let (is_timer, rt) = {
            let mut ctx = self.ctx_mut();
            if ctx.cleaned {
                return;
            }
            ctx.cleaned = true;
            (
                matches!(ctx.kind, RequestKind::Timer),
                ctx.runtime.clone(),
            )
        };
        if is_timer {
            let running = rt.running_timers();
            running.set(running.get().saturating_sub(1));
        }
        self.finalize_threads();
    }

    /// Record the terminal outcome and release everything. A second call
    /// returns the outcome recorded by the first.
    pub(crate) fn finalize(&self, outcome: Outcome) -> Outcome {
        if let Some(done) = self.outcome() {
            return done;
        }
        self.cleanup();
        let (link, results) = {
            let mut ctx = self.ctx_mut();
            ctx.destroyed = true;
            ctx.outcome = Some(outcome.clone());
            debug!("request {} finalized: {outcome:?}", ctx.id);
            let kind = std::mem::replace(&mut ctx.kind, RequestKind::Client);
            match kind {
                RequestKind::Subrequest(link) => (Some(link), ctx.results.clone()),
                other => {
                    ctx.kind = other;
                    (None, Vec::new())
                }
            }
        };
        if let Some(link) = link {
            link.complete(outcome.clone(), results);
        }
        outcome
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(ctx) => f
                .debug_struct("Request")
                .field("id", &ctx.id)
                .field("phase", &ctx.phase)
                .field("coroutines", &ctx.cos.len())
                .field("uthreads", &ctx.uthreads)
                .field("destroyed", &ctx.destroyed)
                .finish(),
            Err(_) => f.write_str("Request(<borrowed>)"),
        }
    }
}

/// Post-order walk from the entry coroutine, then any detached subtrees.
fn teardown_order(ctx: &ReqCtx) -> Vec<CoId> {
    let mut children: HashMap<CoId, Vec<CoId>> = HashMap::new();
    let mut roots = Vec::new();
    for (id, co) in ctx.cos.iter() {
        match co.parent.filter(|p| ctx.cos.contains(*p)) {
            Some(parent) => children.entry(parent).or_default().push(id),
            None => roots.push(id),
        }
    }
    if let Some(entry) = ctx.entry.filter(|e| ctx.cos.contains(*e)) {
        roots.retain(|r| *r != entry);
        roots.insert(0, entry);
    }

    let mut order = Vec::with_capacity(ctx.cos.len());
    for root in roots {
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            if let Some(kids) = children.get(&id) {
                for kid in kids.iter().rev() {
                    stack.push((*kid, false));
                }
            }
        }
    }
    order
}
