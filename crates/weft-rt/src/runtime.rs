// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-worker runtime context.
//!
//! Everything that outlives a single request lives here: the reactor, the
//! timer queue, deferred events, and the script timer counters. Every
//! request holds an `Rc<Runtime>`; nothing is process-global.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::io::reactor::Reactor;
use crate::io::script_timer::ScriptTimer;
use crate::io::timer::{TimerId, TimerQueue};

pub struct Runtime {
    config: RuntimeConfig,
    reactor: Reactor,
    timers: RefCell<TimerQueue>,
    /// Work to run on the next loop turn, before polling.
    events: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    pub(crate) script_timers: RefCell<BTreeMap<u64, ScriptTimer>>,
    pending_timers: Cell<usize>,
    running_timers: Cell<usize>,
    exiting: Cell<bool>,
    next_request_id: Cell<u64>,
    next_timer_key: Cell<u64>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> io::Result<Rc<Self>> {
        Ok(Rc::new(Self {
            config,
            reactor: Reactor::new()?,
            timers: RefCell::new(TimerQueue::new()),
            events: RefCell::new(VecDeque::new()),
            script_timers: RefCell::new(BTreeMap::new()),
            pending_timers: Cell::new(0),
            running_timers: Cell::new(0),
            exiting: Cell::new(false),
            next_request_id: Cell::new(1),
            next_timer_key: Cell::new(0),
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.get()
    }

    pub(crate) fn set_exiting(&self) {
        self.exiting.set(true);
    }

    /// Script timers armed and not yet expired.
    pub fn pending_timer_count(&self) -> usize {
        self.pending_timers.get()
    }

    /// Script timer handlers currently running.
    pub fn running_timer_count(&self) -> usize {
        self.running_timers.get()
    }

    pub(crate) fn pending_timers(&self) -> &Cell<usize> {
        &self.pending_timers
    }

    pub(crate) fn running_timers(&self) -> &Cell<usize> {
        &self.running_timers
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        let id = self.next_request_id.get();
        self.next_request_id.set(id + 1);
        id
    }

    pub(crate) fn next_timer_key(&self) -> u64 {
        let key = self.next_timer_key.get();
        self.next_timer_key.set(key + 1);
        key
    }

    pub(crate) fn add_timer(&self, delay: Duration, handler: impl FnOnce() + 'static) -> TimerId {
        self.timers
            .borrow_mut()
            .add(Instant::now() + delay, Box::new(handler))
    }

    /// Returns whether the timer was still armed.
    pub(crate) fn cancel_timer(&self, id: TimerId) -> bool {
        let handler = self.timers.borrow_mut().cancel(id);
        // Dropped here, after the queue borrow is released.
        handler.is_some()
    }

    /// Queue work for the next loop turn. Used wherever resuming right away
    /// would re-enter a coroutine that is still being polled.
    pub(crate) fn post_event(&self, event: impl FnOnce() + 'static) {
        self.events.borrow_mut().push_back(Box::new(event));
    }

    pub(crate) fn run_posted_events(&self) -> usize {
        let mut n = 0;
        loop {
            let next = self.events.borrow_mut().pop_front();
            let Some(event) = next else {
                return n;
            };
            event();
            n += 1;
        }
    }

    pub(crate) fn fire_expired_timers(&self, now: Instant) -> usize {
        let expired = self.timers.borrow_mut().take_expired(now);
        let n = expired.len();
        for handler in expired {
            handler();
        }
        n
    }

    pub(crate) fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.borrow().next_deadline()
    }

    pub(crate) fn has_events(&self) -> bool {
        !self.events.borrow().is_empty()
    }

    /// No timers, registrations, or deferred events left.
    pub fn is_idle(&self) -> bool {
        !self.has_events() && self.timers.borrow().is_empty() && self.reactor.is_empty()
    }
}
