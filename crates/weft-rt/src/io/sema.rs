// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Counting semaphore shared by the coroutines of one worker.
//!
//! Waiters queue in FIFO order. `post` never resumes a waiter inline: the
//! wakeup goes through the runtime's event queue so the poster finishes its
//! own step first.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::debug;

use crate::co::{Co, CoId, CoOp, Request};
use crate::error::ApiError;
use crate::io::timer::TimerId;
use crate::phase::resume_after_io;
use crate::runtime::Runtime;
use crate::value::Value;

struct Waiter {
    key: u64,
    req: Request,
    co: CoId,
    timer: Option<TimerId>,
}

struct SemaInner {
    rt: Weak<Runtime>,
    resources: usize,
    waiters: VecDeque<Waiter>,
    next_key: u64,
}

#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<RefCell<SemaInner>>,
}

impl Semaphore {
    pub fn new(rt: &Rc<Runtime>, resources: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SemaInner {
                rt: Rc::downgrade(rt),
                resources,
                waiters: VecDeque::new(),
                next_key: 0,
            })),
        }
    }

    /// Resources available right now.
    pub fn count(&self) -> usize {
        self.inner.borrow().resources
    }

    pub fn waiters(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    /// Release `n` resources. Queued waiters take them when the deferred
    /// wakeup runs; a waiter cancelled before then consumes nothing.
    pub fn post(&self, n: usize) {
        let rt = {
            let mut inner = self.inner.borrow_mut();
            inner.resources += n;
            if inner.waiters.is_empty() {
                return;
            }
            inner.rt.upgrade()
        };
        let Some(rt) = rt else {
            return;
        };
        let weak = Rc::downgrade(&self.inner);
        rt.post_event(move || {
            if let Some(inner) = weak.upgrade() {
                wake_waiters(&inner);
            }
        });
    }

    /// Take one resource, waiting up to `timeout` for it.
    ///
    /// Returns `Ok(false)` on timeout.
    pub async fn wait(&self, co: &Co, timeout: Duration) -> Result<bool, ApiError> {
        if self.try_acquire(co)? {
            return Ok(true);
        }
        if timeout.is_zero() {
            return Ok(false);
        }
        self.enqueue(co, timeout)?;
        let got = co.suspend().await;
        Ok(got.first().map_or(false, Value::is_truthy))
    }

    fn try_acquire(&self, co: &Co) -> Result<bool, ApiError> {
        co.check_yieldable()?;
        let mut inner = self.inner.borrow_mut();
        if inner.waiters.is_empty() && inner.resources > 0 {
            inner.resources -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn enqueue(&self, co: &Co, timeout: Duration) -> Result<(), ApiError> {
        let req = co.check_yieldable()?;
        let rt = req.runtime();
        let id = co.id();
        req.cleanup_pending_operation(id);

        let key = {
            let mut inner = self.inner.borrow_mut();
            let key = inner.next_key;
            inner.next_key += 1;
            inner.waiters.push_back(Waiter {
                key,
                req: req.clone(),
                co: id,
                timer: None,
            });
            key
        };

        let expire = Rc::downgrade(&self.inner);
        let timer = rt.add_timer(timeout, move || {
            let Some(inner) = expire.upgrade() else {
                return;
            };
            let waiter = {
                let mut inner = inner.borrow_mut();
                let pos = inner.waiters.iter().position(|w| w.key == key);
                pos.and_then(|i| inner.waiters.remove(i))
            };
            if let Some(w) = waiter {
                debug!("semaphore wait timed out for co {}", w.co);
                w.req.clear_pending(w.co);
                resume_after_io(&w.req, w.co, vec![Value::Nil, Value::from("timeout")]);
            }
        });
        if let Some(w) = self
            .inner
            .borrow_mut()
            .waiters
            .iter_mut()
            .find(|w| w.key == key)
        {
            w.timer = Some(timer);
        }

        let cancel = Rc::downgrade(&self.inner);
        let weak_rt = Rc::downgrade(&rt);
        co.set_pending("semaphore", move || {
            let Some(inner) = cancel.upgrade() else {
                return;
            };
            let waiter = {
                let mut inner = inner.borrow_mut();
                let pos = inner.waiters.iter().position(|w| w.key == key);
                pos.and_then(|i| inner.waiters.remove(i))
            };
            if let (Some(w), Some(rt)) = (waiter, weak_rt.upgrade()) {
                if let Some(timer) = w.timer {
                    rt.cancel_timer(timer);
                }
            }
        });
        co.prepare_yield(&req, CoOp::Nop, Vec::new());
        Ok(())
    }
}

/// Hand available resources to waiters in FIFO order, resuming each one
/// with no borrow of the semaphore held.
fn wake_waiters(inner: &RefCell<SemaInner>) {
    loop {
        let (waiter, rt) = {
            let mut guard = inner.borrow_mut();
            if guard.resources == 0 {
                return;
            }
            let Some(w) = guard.waiters.pop_front() else {
                return;
            };
            guard.resources -= 1;
            (w, guard.rt.upgrade())
        };
        if let (Some(timer), Some(rt)) = (waiter.timer, rt) {
            rt.cancel_timer(timer);
        }
        debug!("semaphore wakes co {}", waiter.co);
        waiter.req.clear_pending(waiter.co);
        resume_after_io(&waiter.req, waiter.co, vec![Value::Bool(true)]);
    }
}
