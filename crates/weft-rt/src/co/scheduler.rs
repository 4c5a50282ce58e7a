// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The resume loop.
//!
//! `run_thread` resumes the selected coroutine, looks at how it stopped,
//! and picks the next coroutine to run until one of them waits on an
//! external event or the coroutine tree is finished. Control only moves
//! along the resume chain here; posted coroutines are drained by the
//! caller once this returns `Outcome::Suspend`.

use std::ops::ControlFlow;

use log::{debug, error};

use super::arena::CoId;
use super::coctx::{CoCtx, CoOp, CoStatus};
use super::handle::{resume_body, Step};
use super::request::{Jump, ReqCtx, Request};
use super::traceback::traceback;
use crate::error::ScriptError;
use crate::value::Value;

/// What the caller of the scheduler should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every runnable coroutine is waiting on an event (or is posted).
    Suspend,
    /// The entry coroutine and all user threads finished.
    TreeDone,
    /// Abort the connection without a response.
    Error,
    /// Finish the request with this status.
    Status(u16),
    /// Internal redirect requested by `exec`.
    Redirect { uri: String, args: String },
    /// URI rewritten with a jump in the rewrite phase.
    Rewrite { uri: String },
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Suspend)
    }

    pub(crate) fn from_exit(code: i32) -> Self {
        match code {
            0 => Outcome::TreeDone,
            c if c < 0 => Outcome::Error,
            c => u16::try_from(c).map_or(Outcome::Error, Outcome::Status),
        }
    }
}

type Flow = ControlFlow<Outcome>;

/// Resume `co` with `args` and run until suspension or completion.
pub fn run_thread(req: &Request, co: CoId, args: Vec<Value>) -> Outcome {
    {
        let mut ctx = req.ctx_mut();
        if ctx.destroyed {
            return ctx.outcome.clone().unwrap_or(Outcome::Error);
        }
        let Some(c) = ctx.cos.get_mut(co) else {
            debug!("run thread: co {co} is gone");
            return Outcome::Suspend;
        };
        c.stack.extend(args);
        ctx.current = Some(co);
    }

    loop {
        let cur = {
            let mut ctx = req.ctx_mut();
            let Some(cur) = ctx.current else {
                return Outcome::Suspend;
            };
            ctx.co_op = CoOp::Nop;
            cur
        };
        debug!("run thread {cur}");

        let flow = match resume_body(req, cur) {
            Step::Yielded => on_yield(req, cur),
            Step::Returned(values) => on_return(req, cur, values),
            Step::Failed(err) => on_error(req, cur, err),
        };
        if let ControlFlow::Break(outcome) = flow {
            debug!("run thread {cur} stopped: {outcome:?}");
            return outcome;
        }
    }
}

fn on_yield(req: &Request, cur: CoId) -> Flow {
    let jump = req.ctx_mut().jump.take();
    if let Some(jump) = jump {
        return ControlFlow::Break(handle_jump(req, cur, jump));
    }

    let mut ctx = req.ctx_mut();
    if !ctx.cos.contains(cur) {
        ctx.current = None;
        return ControlFlow::Break(Outcome::Suspend);
    }
    let op = std::mem::take(&mut ctx.co_op);
    debug!("co {cur} yielded: {op:?}");

    match op {
        CoOp::Nop => {
            ctx.current = None;
            ControlFlow::Break(Outcome::Suspend)
        }
        // `spawn` already selected the child; its start arguments are on its stack.
        CoOp::ThreadResume => ControlFlow::Continue(()),
        CoOp::CoroResume => {
            let Some(target) = ctx.current else {
                return ControlFlow::Break(Outcome::Suspend);
            };
            let args = take_stack(&mut ctx, cur);
            if let Some(t) = ctx.cos.get_mut(target) {
                t.stack.extend(args);
            }
            ControlFlow::Continue(())
        }
        CoOp::CoroYield => {
            if ctx.is_thread(cur) {
                // Nothing to yield into: resume again, after posted work if any.
                if let Some(c) = ctx.cos.get_mut(cur) {
                    c.stack.clear();
                    c.status = CoStatus::Running;
                }
                if !ctx.posted.is_empty() {
                    ctx.post_thread(cur);
                    ctx.current = None;
                    return ControlFlow::Break(Outcome::Suspend);
                }
                return ControlFlow::Continue(());
            }

            let parent = ctx.cos.get(cur).and_then(|c| c.parent);
            let Some(parent) = parent.filter(|p| ctx.cos.contains(*p)) else {
                return ControlFlow::Break(no_parent(&mut ctx, cur));
            };
            let mut values = take_stack(&mut ctx, cur);
            values.insert(0, Value::Bool(true));
            if let Some(p) = ctx.cos.get_mut(parent) {
                p.stack.extend(values);
                p.status = CoStatus::Running;
            }
            ctx.current = Some(parent);
            ControlFlow::Continue(())
        }
    }
}

fn on_return(req: &Request, cur: CoId, values: Vec<Value>) -> Flow {
    req.cleanup_pending_operation(cur);

    let mut ctx = req.ctx_mut();
    let Some(c) = ctx.cos.get_mut(cur) else {
        ctx.current = None;
        return ControlFlow::Break(Outcome::Suspend);
    };
    c.status = CoStatus::Dead;
    c.stack = values;
    let reaped = ctx.take_zombie_children(cur);

    if ctx.entry == Some(cur) {
        let results = take_stack(&mut ctx, cur);
        ctx.results = results;
        let entry = ctx.cos.remove(cur);
        ctx.current = None;
        let outcome = if ctx.uthreads > 0 {
            Outcome::Suspend
        } else {
            Outcome::TreeDone
        };
        drop(ctx);
        drop((entry, reaped));
        return ControlFlow::Break(outcome);
    }

    let (is_uthread, waited, parent) = match ctx.cos.get(cur) {
        Some(c) => (c.is_uthread, c.waited_by_parent, c.parent),
        None => (false, false, None),
    };

    let flow = if is_uthread {
        match parent.filter(|p| ctx.is_alive(*p)) {
            Some(_) if waited => user_co_done(&mut ctx, cur, true),
            Some(parent) => park_zombie(&mut ctx, cur, parent, Value::Bool(true)),
            None => orphan_thread_done(&mut ctx, cur),
        }
    } else {
        user_co_done(&mut ctx, cur, true)
    };
    drop(ctx);
    drop(reaped);
    flow
}

fn on_error(req: &Request, cur: CoId, mut err: ScriptError) -> Flow {
    req.cleanup_pending_operation(cur);

    let mut ctx = req.ctx_mut();
    let Some(c) = ctx.cos.get_mut(cur) else {
        ctx.current = None;
        return ControlFlow::Break(Outcome::Suspend);
    };
    c.status = CoStatus::Dead;
    let (is_uthread, is_wrap, waited, parent) =
        (c.is_uthread, c.is_wrap, c.waited_by_parent, c.parent);
    let is_entry = ctx.entry == Some(cur);

    if (is_uthread || is_entry || is_wrap) && err.traceback.is_none() {
        err.traceback = Some(traceback(&ctx, cur));
    }
    let trace = err.traceback.clone().unwrap_or_default();
    let reaped = ctx.take_zombie_children(cur);

    if is_entry {
        error!("entry thread aborted: {err}\n{trace}");
        ctx.current = None;
        let removed = ctx.cos.remove(cur);
        drop(ctx);
        drop((removed, reaped));
        req.cleanup();
        let ctx = req.ctx();
        let outcome = if ctx.no_abort || ctx.header_sent {
            Outcome::Error
        } else {
            Outcome::Status(500)
        };
        return ControlFlow::Break(outcome);
    }

    if is_uthread {
        error!("user thread aborted: {err}\n{trace}");
    } else {
        debug!("coroutine {cur} failed: {err}");
    }

    if let Some(c) = ctx.cos.get_mut(cur) {
        c.stack = vec![err.to_value()];
    }
    let flow = if is_uthread {
        match parent.filter(|p| ctx.is_alive(*p)) {
            Some(_) if waited => user_co_done(&mut ctx, cur, false),
            Some(parent) => park_zombie(&mut ctx, cur, parent, Value::Bool(false)),
            None => orphan_thread_done(&mut ctx, cur),
        }
    } else {
        user_co_done(&mut ctx, cur, false)
    };
    drop(ctx);
    drop(reaped);
    flow
}

/// Hand a finished coroutine's values (prefixed with `success`) to its
/// parent and continue with the parent.
fn user_co_done(ctx: &mut ReqCtx, cur: CoId, success: bool) -> Flow {
    let parent = ctx.cos.get(cur).and_then(|c| c.parent);
    let Some(parent) = parent.filter(|p| ctx.cos.contains(*p)) else {
        return ControlFlow::Break(no_parent(ctx, cur));
    };

    let Some(done) = ctx.cos.remove(cur) else {
        return ControlFlow::Break(Outcome::Suspend);
    };
    if done.is_uthread {
        ctx.uthreads -= 1;
        if done.waited_by_parent {
            clear_sibling_waits(ctx, parent);
        }
    }
    let mut values = done.stack;
    values.insert(0, Value::Bool(success));
    if let Some(p) = ctx.cos.get_mut(parent) {
        p.stack.extend(values);
        p.status = CoStatus::Running;
    }
    ctx.current = Some(parent);
    // The finished body was already dropped when it completed.
    ControlFlow::Continue(())
}

/// A wait completes on the first thread to finish; the other threads the
/// parent named are no longer waited on.
fn clear_sibling_waits(ctx: &mut ReqCtx, parent: CoId) {
    for id in ctx.cos.ids() {
        if let Some(c) = ctx.cos.get_mut(id) {
            if c.parent == Some(parent) {
                c.waited_by_parent = false;
            }
        }
    }
}

fn park_zombie(ctx: &mut ReqCtx, cur: CoId, parent: CoId, flag: Value) -> Flow {
    debug!("user thread {cur} parked as zombie of {parent}");
    if let Some(c) = ctx.cos.get_mut(cur) {
        c.stack.insert(0, flag);
        c.status = CoStatus::Zombie;
    }
    if let Some(p) = ctx.cos.get_mut(parent) {
        p.zombie_children.push_back(cur);
    }
    ctx.current = None;
    ControlFlow::Break(Outcome::Suspend)
}

/// A user thread finished after its parent died: nobody can collect it.
fn orphan_thread_done(ctx: &mut ReqCtx, cur: CoId) -> Flow {
    if ctx.cos.remove(cur).is_some() {
        ctx.uthreads -= 1;
    }
    ctx.current = None;
    if ctx.uthreads == 0 && !ctx.entry_alive() {
        return ControlFlow::Break(Outcome::TreeDone);
    }
    ControlFlow::Break(Outcome::Suspend)
}

/// The caller finalizes the request on the returned outcome.
fn no_parent(ctx: &mut ReqCtx, cur: CoId) -> Outcome {
    error!("request {}: coroutine {cur} has no parent", ctx.id);
    if let Some(c) = ctx.cos.get_mut(cur) {
        c.status = CoStatus::Dead;
    }
    ctx.current = None;
    if ctx.header_sent {
        Outcome::Error
    } else {
        Outcome::Status(500)
    }
}

fn handle_jump(req: &Request, cur: CoId, jump: Jump) -> Outcome {
    req.cleanup_pending_operation(cur);
    {
        let mut ctx = req.ctx_mut();
        if let Some(c) = ctx.cos.get_mut(cur) {
            c.status = CoStatus::Dead;
        }
        ctx.current = None;
    }
    debug!("co {cur} jump: {jump:?}");
    req.cleanup();
    match jump {
        Jump::Exit(code) => Outcome::from_exit(code),
        Jump::Exec { uri, args } => Outcome::Redirect { uri, args },
        Jump::Rewrite(uri) => Outcome::Rewrite { uri },
    }
}

fn take_stack(ctx: &mut ReqCtx, id: CoId) -> Vec<Value> {
    ctx.cos
        .get_mut(id)
        .map(|c: &mut CoCtx| std::mem::take(&mut c.stack))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::co::request::Phase;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use crate::value::Func;

    fn request() -> Request {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        Request::new(&rt, Phase::Content)
    }

    fn run(req: &Request, f: Func) -> Outcome {
        let id = req.start_entry(f, Vec::new()).unwrap();
        run_thread(req, id, Vec::new())
    }

    #[test]
    fn entry_return_is_tree_done() {
        let req = request();
        let f = Func::new("main", |_co, _| async { Ok(vec![Value::Int(1)]) });
        assert_eq!(run(&req, f), Outcome::TreeDone);
        assert_eq!(req.results(), vec![Value::Int(1)]);
        assert!(req.snapshot().is_empty());
    }

    #[test]
    fn entry_error_is_500() {
        let req = request();
        let f = Func::new("main", |_co, _| async { Err(ScriptError::runtime("bad")) });
        assert_eq!(run(&req, f), Outcome::Status(500));
    }

    #[test]
    fn entry_error_after_headers_closes() {
        let req = request();
        req.mark_header_sent();
        let f = Func::new("main", |_co, _| async { Err(ScriptError::runtime("bad")) });
        assert_eq!(run(&req, f), Outcome::Error);
    }

    #[test]
    fn entry_error_with_no_abort() {
        let req = request();
        req.set_no_abort(true);
        let f = Func::new("main", |_co, _| async { Err(ScriptError::syntax("bad")) });
        assert_eq!(run(&req, f), Outcome::Error);
    }

    #[test]
    fn adapter_wait_suspends() {
        let req = request();
        let f = Func::new("main", |co, _| async move {
            let got = co.suspend().await;
            Ok(got)
        });
        let id = req.start_entry(f, Vec::new()).unwrap();
        assert_eq!(run_thread(&req, id, Vec::new()), Outcome::Suspend);
        assert_eq!(req.current(), None);
        assert_eq!(req.status(id), CoStatus::Running);
        assert_eq!(
            run_thread(&req, id, vec![Value::from("data")]),
            Outcome::TreeDone
        );
        assert_eq!(req.results(), vec![Value::from("data")]);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Outcome::from_exit(0), Outcome::TreeDone);
        assert_eq!(Outcome::from_exit(-1), Outcome::Error);
        assert_eq!(Outcome::from_exit(404), Outcome::Status(404));
        assert!(!Outcome::Suspend.is_terminal());
    }

    #[test]
    fn destroyed_request_is_not_resumed() {
        let req = request();
        let f = Func::new("main", |co, _| async move {
            co.suspend().await;
            panic!("resumed after teardown");
        });
        let id = req.start_entry(f, Vec::new()).unwrap();
        assert_eq!(run_thread(&req, id, Vec::new()), Outcome::Suspend);
        req.finalize(Outcome::Status(499));
        assert_eq!(run_thread(&req, id, Vec::new()), Outcome::Status(499));
    }
}
