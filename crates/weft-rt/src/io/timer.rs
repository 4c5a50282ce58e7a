// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer queue ordered by deadline, then insertion order.

use std::collections::BTreeMap;
use std::time::Instant;

/// Handle to an armed timer. Ordering is expiry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    deadline: Instant,
    seq: u64,
}

impl TimerId {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

pub(crate) struct TimerQueue {
    entries: BTreeMap<TimerId, Box<dyn FnOnce()>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn add(&mut self, deadline: Instant, handler: Box<dyn FnOnce()>) -> TimerId {
        let id = TimerId {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(id, handler);
        id
    }

    /// Returns the handler so the caller can drop it outside any borrow.
    pub fn cancel(&mut self, id: TimerId) -> Option<Box<dyn FnOnce()>> {
        self.entries.remove(&id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|id| id.deadline)
    }

    /// Remove every timer due at or before `now`, in expiry order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
        let rest = self.entries.split_off(&TimerId {
            deadline: now,
            seq: u64::MAX,
        });
        std::mem::replace(&mut self.entries, rest)
            .into_values()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, n: u32) -> Box<dyn FnOnce()> {
        let log = log.clone();
        Box::new(move || log.borrow_mut().push(n))
    }

    #[test]
    fn expires_in_deadline_then_insertion_order() {
        let mut q = TimerQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();
        q.add(now + Duration::from_millis(5), recorder(&log, 3));
        q.add(now, recorder(&log, 1));
        q.add(now, recorder(&log, 2));
        q.add(now + Duration::from_secs(60), recorder(&log, 4));

        for h in q.take_expired(now + Duration::from_millis(5)) {
            h();
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cancel_removes_entry() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let id = q.add(now, Box::new(|| panic!("cancelled timer ran")));
        assert!(q.cancel(id).is_some());
        assert!(q.cancel(id).is_none());
        assert!(q.take_expired(now).is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn next_deadline_is_earliest() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        q.add(now + Duration::from_secs(2), Box::new(|| {}));
        q.add(now + Duration::from_secs(1), Box::new(|| {}));
        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(1)));
    }
}
