// SPDX-License-Identifier: (MIT OR Apache-2.0)
#![allow(dead_code)]
//! Shared integration test helpers.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

use weft_rt::{CoStatus, Request, RuntimeConfig, Worker};

static INIT_LOGGING: Once = Once::new();

pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .is_test(true)
            .try_init();
    });
}

pub fn worker() -> Worker {
    worker_with(RuntimeConfig::default())
}

pub fn worker_with(config: RuntimeConfig) -> Worker {
    init_test_logging();
    Worker::new(config).expect("worker")
}

/// Drive the worker until it has nothing left to do.
pub fn drain(worker: &Worker) {
    let idle = worker
        .run_until_idle(Duration::from_secs(5))
        .expect("event loop");
    assert!(idle, "worker did not go idle");
}

/// Shared append-only log for ordering assertions.
#[derive(Clone, Default)]
pub struct Trace(Rc<RefCell<Vec<String>>>);

impl Trace {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

/// `live_user_threads` must match the user threads still in the tree,
/// and no dead or zombie coroutine may hold a pending registration.
pub fn assert_tree_invariants(req: &Request) {
    let snapshot = req.snapshot();
    let counted = snapshot
        .iter()
        .filter(|c| c.is_user_thread && c.status != CoStatus::Dead)
        .count();
    assert_eq!(counted, req.live_user_threads(), "user thread counter");
    for co in &snapshot {
        if matches!(co.status, CoStatus::Dead | CoStatus::Zombie) {
            assert!(!co.has_pending, "{:?} still has a pending op", co.id);
        }
    }
}
