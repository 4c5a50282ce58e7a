// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Request-level jumps (exit, exec, rewrite) and client abort handling.

use log::{debug, info};

use super::coctx::{CoCtx, CoOp, CoStatus};
use super::handle::Co;
use super::posted::run_posted_threads;
use super::request::{Jump, Phase, Request};
use super::scheduler::Outcome;
use crate::error::ApiError;
use crate::phase::settle;
use crate::value::Func;

impl Co {
    /// End the request. `0` finishes normally, a negative code aborts the
    /// connection, anything else is sent as the response status.
    pub async fn exit(&self, code: i32) -> Result<(), ApiError> {
        self.jump(Jump::Exit(code))?;
        self.suspend().await;
        Ok(())
    }

    /// Internal redirect to `uri`.
    pub async fn exec(&self, uri: &str, args: &str) -> Result<(), ApiError> {
        self.jump(Jump::Exec {
            uri: uri.to_string(),
            args: args.to_string(),
        })?;
        self.suspend().await;
        Ok(())
    }

    /// Rewrite the request URI and restart location matching.
    pub async fn rewrite(&self, uri: &str) -> Result<(), ApiError> {
        let phase = self.request()?.phase();
        if phase != Phase::Rewrite {
            return Err(ApiError::NotYieldable(phase.as_str()));
        }
        self.jump(Jump::Rewrite(uri.to_string()))?;
        self.suspend().await;
        Ok(())
    }

    fn jump(&self, jump: Jump) -> Result<(), ApiError> {
        let req = self.check_yieldable()?;
        req.ctx_mut().jump = Some(jump);
        self.prepare_yield(&req, CoOp::Nop, Vec::new());
        Ok(())
    }

    /// Register the coroutine to run when the client goes away.
    pub fn on_abort(&self, entry: Func) -> Result<(), ApiError> {
        let req = self.request()?;
        let mut ctx = req.ctx_mut();
        if !ctx.runtime.config().check_client_abort {
            return Err(ApiError::ClientAbortDisabled);
        }
        if ctx.on_abort.is_some() {
            return Err(ApiError::DuplicateCall);
        }
        if !ctx.cos.contains(self.id()) {
            return Err(ApiError::NoCoCtx);
        }
        let id = ctx.cos.insert(CoCtx::new(entry, Some(self.id()), Vec::new()));
        ctx.on_abort = Some(id);
        debug!("co {} registered on_abort {id}", self.id());
        Ok(())
    }
}

impl Request {
    /// The client closed the connection.
    ///
    /// A registered handler starts as a user thread; otherwise the request
    /// is torn down with status 499.
    pub fn client_aborted(&self) -> Outcome {
        let handler = {
            let mut ctx = self.ctx_mut();
            if ctx.destroyed {
                return ctx.outcome.clone().unwrap_or(Outcome::Error);
            }
            match ctx.on_abort {
                Some(id) => match ctx.cos.get_mut(id) {
                    Some(co) if co.status == CoStatus::Suspended && !co.is_uthread => {
                        co.is_uthread = true;
                        co.status = CoStatus::Running;
                        ctx.uthreads += 1;
                        ctx.post_thread(id);
                        Some(id)
                    }
                    // Already started.
                    _ => return Outcome::Suspend,
                },
                None => None,
            }
        };

        match handler {
            Some(id) => {
                info!("client prematurely closed connection, running on_abort {id}");
                let outcome = run_posted_threads(self);
                settle(self, outcome)
            }
            None => {
                info!("client prematurely closed connection");
                self.finalize(Outcome::Status(499))
            }
        }
    }
}
