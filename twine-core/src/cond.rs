//! Fiber condition variables.
//!
//! The waiter list keeps fibers in arrival order: `signal` wakes the
//! oldest live waiter, `broadcast` wakes them all. Lost-wakeup races do
//! not exist inside a cord — only one fiber runs at a time — so the
//! usual predicate-recheck loop is about cooperation, not atomicity.

use crate::error::{CoreError, Result};
use crate::fiber::{self, Fiber};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// A condition variable for fibers of one cord.
#[derive(Default)]
pub struct FiberCond {
    waiters: RefCell<VecDeque<Weak<Fiber>>>,
}

impl FiberCond {
    /// Create a condition variable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the oldest waiting fiber, if any.
    pub fn signal(&self) {
        let mut waiters = self.waiters.borrow_mut();
        while let Some(w) = waiters.pop_front() {
            if let Some(f) = w.upgrade() {
                drop(waiters);
                fiber::wakeup(&f);
                return;
            }
        }
    }

    /// Wake every waiting fiber.
    pub fn broadcast(&self) {
        let drained: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        for w in drained {
            if let Some(f) = w.upgrade() {
                fiber::wakeup(&f);
            }
        }
    }

    /// Park the current fiber until signalled.
    pub fn wait(&self) {
        let me = fiber::self_ref();
        self.waiters.borrow_mut().push_back(Rc::downgrade(&me));
        fiber::yield_now();
        self.remove(&me);
    }

    /// Park the current fiber until signalled or until `timeout`
    /// expires, whichever comes first.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let me = fiber::self_ref();
        self.waiters.borrow_mut().push_back(Rc::downgrade(&me));
        let timed_out = fiber::yield_timeout(timeout);
        self.remove(&me);
        if timed_out {
            return Err(CoreError::Timeout);
        }
        Ok(())
    }

    fn remove(&self, f: &Rc<Fiber>) {
        self.waiters
            .borrow_mut()
            .retain(|w| w.upgrade().map_or(false, |x| !Rc::ptr_eq(&x, f)));
    }
}

impl std::fmt::Debug for FiberCond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FiberCond(waiters={})", self.waiters.borrow().len())
    }
}
