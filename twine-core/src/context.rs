//! Machine context switching over the `ucontext` family.
//!
//! Each fiber owns a boxed `ucontext_t`. The box matters: glibc stores a
//! pointer to the in-struct FPU save area inside the struct itself, so a
//! context must never move after it has been initialized. `swapcontext`
//! is the one transfer primitive; it saves the running context into the
//! first argument and resumes the second, giving O(ns) suspension over
//! private stacks.

use crate::error::{CoreError, Result};
use std::cell::UnsafeCell;
use std::io;

/// A saved machine context.
pub(crate) struct Context {
    ucp: Box<UnsafeCell<libc::ucontext_t>>,
}

impl Context {
    /// An empty context, good only as a `transfer` save target until
    /// [`Context::make`] prepares it to run a trampoline.
    pub(crate) fn empty() -> Self {
        Self {
            // SAFETY: ucontext_t is a plain-old-data register dump; an
            // all-zero value is a valid "never resumed" placeholder that
            // getcontext/swapcontext fully overwrite.
            ucp: Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() })),
        }
    }

    /// Prepare the context to enter `entry` on the given stack. The entry
    /// function must never return: a returning trampoline would fall off
    /// the context chain and terminate the thread.
    pub(crate) fn make(
        &self,
        stack_lo: *mut u8,
        stack_size: usize,
        entry: extern "C" fn(),
    ) -> Result<()> {
        let ucp = self.ucp.get();
        // SAFETY: ucp points into our own box; stack_lo/stack_size
        // describe a mapped, writable region owned by the caller.
        unsafe {
            if libc::getcontext(ucp) != 0 {
                return Err(CoreError::system("getcontext", io::Error::last_os_error()));
            }
            (*ucp).uc_stack.ss_sp = stack_lo.cast();
            (*ucp).uc_stack.ss_size = stack_size;
            (*ucp).uc_link = std::ptr::null_mut();
            libc::makecontext(ucp, entry, 0);
        }
        Ok(())
    }

    /// Save the running context into `from` and resume `to`.
    ///
    /// Returns when something later transfers back into `from`.
    pub(crate) fn transfer(from: &Context, to: &Context) {
        // SAFETY: both contexts are live, boxed (stable addresses), and
        // `to` was either prepared by `make` or previously saved by a
        // transfer. The caller guarantees no RefCell borrows are held
        // across this call.
        let rc = unsafe { libc::swapcontext(from.ucp.get(), to.ucp.get()) };
        if rc != 0 {
            // Transfer failure leaves the scheduler in an undefined
            // state; there is nothing sensible to resume.
            panic!(
                "swapcontext failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

// The context never leaves its cord's thread; Fiber as a whole is !Send
// already via Rc/Cell fields.
