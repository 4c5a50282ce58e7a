// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-coroutine bookkeeping.

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use super::arena::CoId;
use super::pending::PendingOp;
use crate::value::{BoxBody, Func, Value};

/// Coroutine status as reported by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    Running,
    Suspended,
    Normal,
    Dead,
    Zombie,
}

impl CoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CoStatus::Running => "running",
            CoStatus::Suspended => "suspended",
            CoStatus::Normal => "normal",
            CoStatus::Dead => "dead",
            CoStatus::Zombie => "zombie",
        }
    }

    /// Neither dead nor a zombie.
    pub fn is_alive(self) -> bool {
        !matches!(self, CoStatus::Dead | CoStatus::Zombie)
    }
}

impl fmt::Display for CoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag left by the last primitive that yielded, read by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoOp {
    /// Adapter wait: suspend until an external event.
    #[default]
    Nop,
    ThreadResume,
    CoroResume,
    CoroYield,
}

/// Where a coroutine's code is.
pub(crate) enum Body {
    /// Not started; the stack holds the start arguments.
    Entry(Func),
    Started(BoxBody),
    /// Taken out by the scheduler while being polled.
    Polling,
    Finished,
}

pub(crate) struct CoCtx {
    pub status: CoStatus,
    pub parent: Option<CoId>,
    pub name: Rc<str>,
    pub body: Body,
    /// Values moving into or out of this coroutine.
    pub stack: Vec<Value>,
    pub pending: Option<PendingOp>,
    pub is_uthread: bool,
    pub is_wrap: bool,
    pub waited_by_parent: bool,
    pub zombie_children: VecDeque<CoId>,
    pub pending_subreqs: usize,
}

impl CoCtx {
    pub fn new(entry: Func, parent: Option<CoId>, args: Vec<Value>) -> Self {
        Self {
            status: CoStatus::Suspended,
            parent,
            name: Rc::from(entry.name()),
            body: Body::Entry(entry),
            stack: args,
            pending: None,
            is_uthread: false,
            is_wrap: false,
            waited_by_parent: false,
            zombie_children: VecDeque::new(),
            pending_subreqs: 0,
        }
    }
}

/// Read-only view of one coroutine, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoSnapshot {
    pub id: CoId,
    pub name: String,
    pub status: CoStatus,
    pub parent: Option<CoId>,
    pub is_user_thread: bool,
    pub has_pending: bool,
}

impl CoSnapshot {
    pub(crate) fn of(id: CoId, ctx: &CoCtx) -> Self {
        Self {
            id,
            name: ctx.name.to_string(),
            status: ctx.status,
            parent: ctx.parent,
            is_user_thread: ctx.is_uthread,
            has_pending: ctx.pending.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names() {
        assert_eq!(CoStatus::Normal.to_string(), "normal");
        assert!(CoStatus::Suspended.is_alive());
        assert!(!CoStatus::Zombie.is_alive());
    }

    #[test]
    fn new_coctx_is_suspended_entry() {
        let f = Func::new("child", |_co, args| async move { Ok(args) });
        let ctx = CoCtx::new(f, None, vec![Value::Int(1)]);
        assert_eq!(ctx.status, CoStatus::Suspended);
        assert_eq!(&*ctx.name, "child");
        assert!(matches!(ctx.body, Body::Entry(_)));
        assert_eq!(ctx.stack, vec![Value::Int(1)]);
    }
}
