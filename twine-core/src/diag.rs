//! Per-fiber diagnostics slot.
//!
//! Each fiber carries the last error raised in it. The slot is empty
//! whenever control enters the fiber body; `join` and `cord_join` move it
//! to the waiting side.

use crate::error::CoreError;
use std::cell::RefCell;

/// A single-error diagnostics area.
#[derive(Default)]
pub struct Diag {
    last: RefCell<Option<CoreError>>,
}

impl Diag {
    /// Create an empty diagnostics slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, replacing any previous one.
    pub fn set(&self, err: CoreError) {
        *self.last.borrow_mut() = Some(err);
    }

    /// Take the recorded error out, leaving the slot empty.
    pub fn take(&self) -> Option<CoreError> {
        self.last.borrow_mut().take()
    }

    /// Discard the recorded error.
    pub fn clear(&self) {
        *self.last.borrow_mut() = None;
    }

    /// True when no error is recorded.
    pub fn is_empty(&self) -> bool {
        self.last.borrow().is_none()
    }

    /// Move the recorded error into `dst`, leaving this slot empty.
    pub fn move_to(&self, dst: &Diag) {
        if let Some(e) = self.take() {
            dst.set(e);
        }
    }
}

impl std::fmt::Debug for Diag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diag")
            .field("last", &*self.last.borrow())
            .finish()
    }
}
