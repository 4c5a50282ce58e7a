// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! User threads: spawn, wait, kill.

use log::debug;

use super::arena::CoId;
use super::coctx::{CoCtx, CoOp, CoStatus};
use super::handle::Co;
use crate::error::ApiError;
use crate::value::{Func, Value};

enum WaitStep {
    Ready(Vec<Value>),
    Blocked,
}

impl Co {
    /// Start `entry` as a user thread. The child runs right away; the caller
    /// continues after it from the posted queue.
    pub async fn spawn(&self, entry: Func, args: Vec<Value>) -> Result<CoId, ApiError> {
        let child = self.prepare_spawn(entry, args)?;
        self.suspend().await;
        Ok(child)
    }

    fn prepare_spawn(&self, entry: Func, args: Vec<Value>) -> Result<CoId, ApiError> {
        let req = self.check_yieldable()?;
        let mut ctx = req.ctx_mut();
        let mut co = CoCtx::new(entry, Some(self.id()), args);
        co.is_uthread = true;
        co.status = CoStatus::Running;
        let child = ctx.cos.insert(co);
        ctx.uthreads += 1;
        debug!(
            "co {} spawned user thread {child} ({} live)",
            self.id(),
            ctx.uthreads
        );

        if let Some(me) = ctx.cos.get_mut(self.id()) {
            me.stack = vec![Value::Thread(child)];
        }
        ctx.post_thread(self.id());
        ctx.co_op = CoOp::ThreadResume;
        ctx.current = Some(child);
        Ok(child)
    }

    /// Wait for the first of `threads` to finish. Resolves to
    /// `[true, values...]` or `[false, message]`.
    pub async fn wait(&self, threads: &[CoId]) -> Result<Vec<Value>, ApiError> {
        match self.prepare_wait(threads)? {
            WaitStep::Ready(values) => Ok(values),
            WaitStep::Blocked => Ok(self.suspend().await),
        }
    }

    fn prepare_wait(&self, threads: &[CoId]) -> Result<WaitStep, ApiError> {
        let req = self.check_yieldable()?;
        let mut ctx = req.ctx_mut();
        if threads.is_empty() {
            return Err(ApiError::NoThreads);
        }
        for &t in threads {
            let Some(c) = ctx.cos.get(t) else {
                continue;
            };
            if !c.is_uthread {
                return Err(ApiError::WaitNotUserThread);
            }
            if c.parent != Some(self.id()) {
                return Err(ApiError::WaitNotParent);
            }
        }

        for (i, &t) in threads.iter().enumerate() {
            match ctx.status(t) {
                CoStatus::Zombie => {
                    let Some(done) = ctx.cos.remove(t) else {
                        continue;
                    };
                    ctx.uthreads -= 1;
                    if let Some(me) = ctx.cos.get_mut(self.id()) {
                        me.zombie_children.retain(|z| *z != t);
                    }
                    debug!("co {} harvested zombie {t}", self.id());
                    drop(ctx);
                    return Ok(WaitStep::Ready(done.stack));
                }
                CoStatus::Dead if i + 1 == threads.len() => {
                    return Err(ApiError::AlreadyWaited);
                }
                _ => {}
            }
        }

        for &t in threads {
            if let Some(c) = ctx.cos.get_mut(t) {
                if c.status.is_alive() {
                    c.waited_by_parent = true;
                }
            }
        }
        drop(ctx);
        self.prepare_yield(&req, CoOp::Nop, Vec::new());
        Ok(WaitStep::Blocked)
    }

    /// Terminate a user thread spawned by this coroutine.
    pub fn kill(&self, thread: CoId) -> Result<(), ApiError> {
        let req = self.request()?;
        let mut ctx = req.ctx_mut();
        if !ctx.cos.contains(self.id()) {
            return Err(ApiError::NoCoCtx);
        }
        let Some(target) = ctx.cos.get(thread) else {
            return Err(ApiError::AlreadyWaited);
        };
        if !target.is_uthread {
            return Err(ApiError::KillNotUserThread);
        }
        if target.parent != Some(self.id()) {
            return Err(ApiError::KillerNotParent);
        }
        if target.pending_subreqs > 0 {
            return Err(ApiError::PendingSubrequests);
        }

        let status = target.status;
        match status {
            CoStatus::Zombie => {
                let reaped = ctx.cos.remove(thread);
                ctx.uthreads -= 1;
                if let Some(me) = ctx.cos.get_mut(self.id()) {
                    me.zombie_children.retain(|z| *z != thread);
                }
                drop(ctx);
                drop(reaped);
                Err(ApiError::AlreadyTerminated)
            }
            CoStatus::Dead => Err(ApiError::AlreadyWaited),
            _ => {
                debug!("co {} kills user thread {thread}", self.id());
                let reaped = ctx.take_zombie_children(thread);
                // Library coroutines the thread resumed or created die with it.
                let mut doomed = ctx.library_descendants(thread);
                doomed.push(thread);
                let mut ops = Vec::new();
                let mut removed = Vec::with_capacity(doomed.len());
                for id in doomed {
                    let Some(mut c) = ctx.cos.remove(id) else {
                        continue;
                    };
                    c.status = CoStatus::Dead;
                    if let Some(op) = c.pending.take() {
                        ops.push(op);
                    }
                    removed.push(c);
                    ctx.posted.retain(|p| *p != id);
                }
                ctx.uthreads -= 1;
                drop(ctx);
                for op in ops {
                    debug!("kill: cleanup pending {}", op.label());
                    op.run();
                }
                drop((removed, reaped));
                Ok(())
            }
        }
    }
}
