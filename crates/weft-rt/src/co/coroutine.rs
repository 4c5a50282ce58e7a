// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The coroutine library: create, resume, yield, wrap, status.
//!
//! Each async primitive does its bookkeeping in a synchronous `prepare_*`
//! step, so no request borrow or strong request handle is held across the
//! suspension point.

use log::debug;

use super::arena::CoId;
use super::coctx::{CoCtx, CoOp, CoStatus};
use super::handle::Co;
use crate::error::{ApiError, ScriptError};
use crate::value::{Func, Value};

impl Co {
    /// Create a suspended coroutine linked under the caller.
    pub fn create(&self, entry: Func) -> Result<CoId, ApiError> {
        self.spawn_library_co(entry, false)
    }

    fn spawn_library_co(&self, entry: Func, is_wrap: bool) -> Result<CoId, ApiError> {
        let req = self.check_yieldable()?;
        let mut ctx = req.ctx_mut();
        let mut co = CoCtx::new(entry, Some(self.id()), Vec::new());
        co.is_wrap = is_wrap;
        let id = ctx.cos.insert(co);
        debug!("co {} created coroutine {id}", self.id());
        Ok(id)
    }

    /// Resume `target` with `args`.
    ///
    /// Resolves to `[true, values...]` when the target yields or returns and
    /// to `[false, message]` when it fails. A target that is not suspended
    /// is rejected without touching anything.
    pub async fn resume(&self, target: CoId, args: Vec<Value>) -> Result<Vec<Value>, ApiError> {
        self.prepare_resume(target, args)?;
        Ok(self.suspend().await)
    }

    fn prepare_resume(&self, target: CoId, args: Vec<Value>) -> Result<(), ApiError> {
        let req = self.check_yieldable()?;
        let mut ctx = req.ctx_mut();
        let status = ctx.status(target);
        if status != CoStatus::Suspended {
            return Err(ApiError::CannotResume(status));
        }
        if let Some(me) = ctx.cos.get_mut(self.id()) {
            me.status = CoStatus::Normal;
            me.stack = args;
        }
        if let Some(t) = ctx.cos.get_mut(target) {
            t.parent = Some(self.id());
            t.status = CoStatus::Running;
        }
        ctx.co_op = CoOp::CoroResume;
        ctx.current = Some(target);
        Ok(())
    }

    /// Yield `values` to whoever resumed this coroutine and wait to be
    /// resumed again.
    ///
    /// From the entry coroutine or a user thread there is no resumer: the
    /// values are dropped and the thread runs again after any posted threads.
    pub async fn yield_values(&self, values: Vec<Value>) -> Result<Vec<Value>, ApiError> {
        let req = self.check_yieldable()?;
        {
            let mut ctx = req.ctx_mut();
            if let Some(me) = ctx.cos.get_mut(self.id()) {
                me.status = CoStatus::Suspended;
            }
        }
        self.prepare_yield(&req, CoOp::CoroYield, values);
        drop(req);
        Ok(self.suspend().await)
    }

    /// Create a coroutine whose calls return values directly and raise its
    /// failures in the caller.
    pub fn wrap(&self, entry: Func) -> Result<Wrapped, ApiError> {
        let id = self.spawn_library_co(entry, true)?;
        Ok(Wrapped { id })
    }

    /// Status of `id` as seen from this request. Reclaimed handles are dead.
    pub fn status(&self, id: CoId) -> CoStatus {
        match self.request() {
            Ok(req) => req.status(id),
            Err(_) => CoStatus::Dead,
        }
    }

    /// The running coroutine and whether it is the entry coroutine.
    pub fn running(&self) -> (CoId, bool) {
        (self.id(), self.is_entry())
    }

    pub fn is_entry(&self) -> bool {
        self.request()
            .map_or(false, |req| req.entry() == Some(self.id()))
    }
}

/// A coroutine created by `Co::wrap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wrapped {
    id: CoId,
}

impl Wrapped {
    pub fn id(&self) -> CoId {
        self.id
    }

    /// Resume the wrapped coroutine from `co`.
    pub async fn call(&self, co: &Co, args: Vec<Value>) -> Result<Vec<Value>, ScriptError> {
        let mut values = co.resume(self.id, args).await?;
        if values.is_empty() {
            return Ok(values);
        }
        match values.remove(0) {
            Value::Bool(true) => Ok(values),
            _ => {
                let message = values
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("error")
                    .to_string();
                Err(ScriptError::runtime(message))
            }
        }
    }
}
