//! Trigger lists: ordered callbacks invoked on named events.
//!
//! A trigger may unlink itself (or any other trigger) while the list is
//! being traversed. The first callback returning an error aborts the rest
//! of the chain with that error.

use crate::error::Result;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// One registered callback.
pub struct Trigger<E = ()> {
    run: RefCell<Box<dyn FnMut(&E) -> Result<()>>>,
    cleared: Cell<bool>,
}

impl<E> Trigger<E> {
    /// Create a trigger from a callback.
    pub fn new<F>(f: F) -> Rc<Self>
    where
        F: FnMut(&E) -> Result<()> + 'static,
    {
        Rc::new(Self {
            run: RefCell::new(Box::new(f)),
            cleared: Cell::new(false),
        })
    }

    /// Unlink the trigger. Safe to call from inside its own callback.
    pub fn clear(&self) {
        self.cleared.set(true);
    }

    /// True once the trigger was cleared.
    pub fn is_cleared(&self) -> bool {
        self.cleared.get()
    }

    fn fire(&self, event: &E) -> Result<()> {
        (self.run.borrow_mut())(event)
    }
}

impl<E> std::fmt::Debug for Trigger<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Trigger(cleared={})", self.cleared.get())
    }
}

/// An ordered list of triggers.
pub struct TriggerList<E = ()> {
    items: RefCell<Vec<Rc<Trigger<E>>>>,
}

impl<E> Default for TriggerList<E> {
    fn default() -> Self {
        Self {
            items: RefCell::new(Vec::new()),
        }
    }
}

impl<E> TriggerList<E> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trigger at the head of the list, so the most recently added
    /// trigger runs first on a forward traversal.
    pub fn add(&self, t: &Rc<Trigger<E>>) {
        self.items.borrow_mut().insert(0, t.clone());
    }

    /// Add a trigger at the tail of the list.
    pub fn add_tail(&self, t: &Rc<Trigger<E>>) {
        self.items.borrow_mut().push(t.clone());
    }

    /// True when no live triggers are registered.
    pub fn is_empty(&self) -> bool {
        self.items.borrow().iter().all(|t| t.is_cleared())
    }

    /// Drop every registered trigger.
    pub fn clear_all(&self) {
        self.items.borrow_mut().clear();
    }

    fn snapshot(&self) -> Vec<Rc<Trigger<E>>> {
        self.items.borrow().clone()
    }

    fn compact(&self) {
        self.items.borrow_mut().retain(|t| !t.is_cleared());
    }

    fn run_over(&self, items: impl Iterator<Item = Rc<Trigger<E>>>, event: &E) -> Result<()> {
        for t in items {
            if t.is_cleared() {
                continue;
            }
            if let Err(e) = t.fire(event) {
                self.compact();
                return Err(e);
            }
        }
        self.compact();
        Ok(())
    }

    /// Invoke the triggers in list order; the first failure aborts the
    /// remaining chain.
    pub fn run(&self, event: &E) -> Result<()> {
        self.run_over(self.snapshot().into_iter(), event)
    }

    /// Invoke the triggers in reverse list order.
    pub fn run_reverse(&self, event: &E) -> Result<()> {
        self.run_over(self.snapshot().into_iter().rev(), event)
    }
}

impl<E> std::fmt::Debug for TriggerList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TriggerList(len={})", self.items.borrow().len())
    }
}
