//! Fibers: lightweight, stackful, cooperatively scheduled execution
//! contexts.
//!
//! A fiber runs until it yields, sleeps or blocks; control then returns
//! to its caller chain and ultimately to the cord's scheduler. There is
//! no preemption: every suspension point is an explicit call into this
//! module.
//!
//! Failures travel through the per-fiber diagnostics slot and the return
//! code, never through unwinding: the trampoline catches panics and
//! converts them to diagnostics before the next context switch.

use crate::context::Context;
use crate::cord::{cord, FID_SCHED};
use crate::diag::Diag;
use crate::error::{CoreError, Result};
use crate::region::Region;
use crate::stack::FiberStack;
use crate::trigger::TriggerList;
use bitflags::bitflags;
use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

bitflags! {
    /// Fiber state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FiberFlags: u32 {
        /// The fiber is enqueued on the cord's ready list or linked into
        /// a dispatch chain.
        const READY = 1 << 0;
        /// The fiber body has finished; a dead fiber never runs again.
        const DEAD = 1 << 1;
        /// Cancellation was requested; observed at cancellation points.
        const CANCELLED = 1 << 2;
        /// `cancel` may wake this fiber.
        const CANCELLABLE = 1 << 3;
        /// A dead fiber lingers until joined.
        const JOINABLE = 1 << 4;
        /// Non-default stack size: untracked, unpooled.
        const CUSTOM_STACK = 1 << 5;
    }
}

/// Flags a fresh or recycled fiber starts with.
pub const FIBER_DEFAULT_FLAGS: FiberFlags = FiberFlags::CANCELLABLE;

/// A fiber body. The returned error becomes the fiber's diagnostic and a
/// non-zero return code.
pub type FiberBody = Box<dyn FnOnce() -> Result<()> + 'static>;

/// Creation attributes: stack size, and the flags derived from it.
#[derive(Debug, Clone)]
pub struct FiberAttr {
    pub(crate) stack_size: usize,
    pub(crate) custom_stack: bool,
}

impl FiberAttr {
    /// Attributes with the cord's default stack size.
    pub fn new() -> Self {
        Self {
            stack_size: 0, // resolved against the cord default at creation
            custom_stack: false,
        }
    }

    /// Request a custom stack size (min 16 KiB). Custom stacks are not
    /// pooled and not watermark-tracked.
    pub fn set_stack_size(&mut self, size: usize) -> Result<()> {
        if size < crate::config::STACK_SIZE_MINIMAL {
            return Err(CoreError::IllegalParams("stack size is too small".into()));
        }
        self.stack_size = size;
        self.custom_stack = true;
        Ok(())
    }

    /// The configured stack size, or 0 for the cord default.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl Default for FiberAttr {
    fn default() -> Self {
        Self::new()
    }
}

/// A cooperative execution context. Always handled through `Rc`.
pub struct Fiber {
    pub(crate) fid: Cell<u32>,
    pub(crate) name: RefCell<String>,
    pub(crate) flags: Cell<FiberFlags>,
    /// Context switch counter.
    pub(crate) csw: Cell<u64>,
    pub(crate) ctx: Context,
    pub(crate) stack: RefCell<Option<FiberStack>>,
    /// The fiber to switch to on yield; links dispatch chains.
    pub(crate) caller: RefCell<Option<Rc<Fiber>>>,
    /// Fibers waiting for this one to die.
    pub(crate) wake: RefCell<Vec<Weak<Fiber>>>,
    /// Scratch region for the current request.
    pub(crate) gc_region: Region,
    /// Last error raised in this fiber.
    pub diag: Diag,
    pub(crate) f_ret: Cell<i32>,
    pub(crate) body: RefCell<Option<FiberBody>>,
    /// Run on every yield of this fiber. Must not fail or yield.
    pub on_yield: TriggerList<()>,
    /// Run once when the fiber dies.
    pub on_stop: TriggerList<()>,
    /// Type-keyed storage owned by external collaborators.
    pub(crate) storage: RefCell<HashMap<TypeId, Box<dyn Any>>>,
}

impl Fiber {
    pub(crate) fn raw(fid: u32, name: &str, gc_threshold: usize) -> Self {
        Self {
            fid: Cell::new(fid),
            name: RefCell::new(name.to_string()),
            flags: Cell::new(FIBER_DEFAULT_FLAGS),
            csw: Cell::new(0),
            ctx: Context::empty(),
            stack: RefCell::new(None),
            caller: RefCell::new(None),
            wake: RefCell::new(Vec::new()),
            gc_region: Region::new(gc_threshold),
            diag: Diag::new(),
            f_ret: Cell::new(0),
            body: RefCell::new(None),
            on_yield: TriggerList::new(),
            on_stop: TriggerList::new(),
            storage: RefCell::new(HashMap::new()),
        }
    }

    /// Create a fiber on the current cord with default attributes.
    ///
    /// Takes a parked fiber from the cord's dead pool when one is
    /// available; the new fiber returns itself to the pool when its body
    /// completes (unless joinable).
    pub fn new(name: &str, body: FiberBody) -> Result<Rc<Fiber>> {
        Self::new_with_attr(name, &FiberAttr::new(), body)
    }

    /// Create a fiber with explicit attributes.
    pub fn new_with_attr(name: &str, attr: &FiberAttr, body: FiberBody) -> Result<Rc<Fiber>> {
        cord().fiber_new(name, attr, body)
    }

    /// The fiber id: unique within the cord, never reused while the cord
    /// lives.
    pub fn fid(&self) -> u32 {
        self.fid.get()
    }

    /// The fiber's human name.
    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// Rename the fiber; truncated to the cord's name limit.
    pub fn set_name(&self, name: &str) {
        let max = cord().config().fiber_name_max;
        let mut trimmed = name.to_string();
        if trimmed.len() > max {
            // Truncate on a char boundary.
            let mut cut = max;
            while !trimmed.is_char_boundary(cut) {
                cut -= 1;
            }
            trimmed.truncate(cut);
        }
        *self.name.borrow_mut() = trimmed;
    }

    /// Context switch count.
    pub fn csw(&self) -> u64 {
        self.csw.get()
    }

    pub(crate) fn flags(&self) -> FiberFlags {
        self.flags.get()
    }

    pub(crate) fn set_flag(&self, flag: FiberFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    pub(crate) fn clear_flag(&self, flag: FiberFlags) {
        self.flags.set(self.flags.get() - flag);
    }

    /// The fiber body has completed.
    pub fn is_dead(&self) -> bool {
        self.flags().contains(FiberFlags::DEAD)
    }

    /// A cancellation request is pending.
    pub fn is_cancelled(&self) -> bool {
        self.flags().contains(FiberFlags::CANCELLED)
    }

    /// Make a living fiber joinable or not. A joinable dead fiber is not
    /// recycled until joined.
    pub fn set_joinable(&self, yesno: bool) {
        if yesno {
            self.set_flag(FiberFlags::JOINABLE);
        } else {
            self.clear_flag(FiberFlags::JOINABLE);
        }
    }

    /// The scratch region tied to this fiber's lifetime.
    pub fn region(&self) -> &Region {
        &self.gc_region
    }

    /// Reset to the creation state; shared by creation and recycling.
    pub(crate) fn reset(&self) {
        self.on_yield.clear_all();
        self.on_stop.clear_all();
        self.flags.set(FIBER_DEFAULT_FLAGS);
    }

    fn push_waiter(&self, waiter: &Rc<Fiber>) {
        let mut wake = self.wake.borrow_mut();
        let fid = waiter.fid();
        if !wake
            .iter()
            .any(|w| w.upgrade().is_some_and(|f| f.fid() == fid))
        {
            wake.push(Rc::downgrade(waiter));
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("fid", &self.fid.get())
            .field("name", &*self.name.borrow())
            .field("flags", &self.flags.get())
            .field("csw", &self.csw.get())
            .finish()
    }
}

/// The currently running fiber of this thread's cord.
pub fn self_ref() -> Rc<Fiber> {
    cord().current()
}

/// Fid of the currently running fiber.
pub fn self_fid() -> u32 {
    cord().current().fid()
}

/// Look a fiber up by id in the current cord's registry. Never crosses
/// cords; joinable dead fibers stay findable until joined.
pub fn find(fid: u32) -> Option<Rc<Fiber>> {
    cord().find(fid)
}

/// Transfer control to `callee` immediately, putting the current fiber
/// behind it on the caller chain.
pub fn start(callee: &Rc<Fiber>) {
    let cord = cord();
    let caller = cord.current();
    debug_assert!(!caller.flags().contains(FiberFlags::READY));
    debug_assert!(!callee.flags().contains(FiberFlags::READY));
    // By convention these triggers must not fail; a failure here has no
    // one to report to.
    if let Err(e) = caller.on_yield.run(&()) {
        tracing::warn!(err = %e, "on_yield trigger failed");
    }
    *callee.caller.borrow_mut() = Some(caller.clone());
    callee.set_flag(FiberFlags::READY);
    caller.set_flag(FiberFlags::READY);
    cord.call_impl(callee);
}

/// Deliver control back to the caller chain.
pub fn yield_now() {
    let cord = cord();
    let caller = cord.current();
    let callee = caller
        .caller
        .borrow_mut()
        .take()
        .unwrap_or_else(|| cord.sched());
    *caller.caller.borrow_mut() = Some(cord.sched());

    if let Err(e) = caller.on_yield.run(&()) {
        tracing::warn!(err = %e, "on_yield trigger failed");
    }

    debug_assert!(
        callee.flags().contains(FiberFlags::READY) || callee.fid() == FID_SCHED,
        "yield into a fiber that was not scheduled"
    );
    debug_assert!(!callee.is_dead());
    cord.set_current(&callee);
    callee.csw.set(callee.csw.get() + 1);
    callee.clear_flag(FiberFlags::READY);
    Context::transfer(&caller.ctx, &callee.ctx);
}

/// Enqueue `f` on its cord's ready list unless it is already scheduled
/// or dead.
///
/// The append goes to the tail: fibers woken in one loop turn run in
/// wakeup order. External collaborators that must commit in wakeup order
/// (write-ahead-log commit/rollback) rely on this.
pub fn wakeup(f: &Rc<Fiber>) {
    // A wakeup is a request to schedule the fiber; once it is running
    // (or already queued) the request is complete. Dead fibers can be
    // reached through stale handles; ignore those too.
    if f.flags()
        .intersects(FiberFlags::READY | FiberFlags::DEAD)
    {
        return;
    }
    let cord = cord();
    cord.push_ready(f);
    f.set_flag(FiberFlags::READY);
}

/// Request cancellation of `f`.
///
/// Cancellation is asynchronous and cooperative: it is observed only by
/// [`testcancel`] and by primitives that explicitly check. Join a
/// cancelled fiber to wait for the cancellation to complete.
pub fn cancel(f: &Rc<Fiber>) {
    // Cancelling a dead fiber would clear the cause of death.
    if f.is_dead() {
        return;
    }
    f.set_flag(FiberFlags::CANCELLED);
    let self_fid = cord().current().fid();
    if f.fid() != self_fid && f.flags().contains(FiberFlags::CANCELLABLE) {
        wakeup(f);
    }
}

/// Fail with `Cancelled` if the current fiber has a pending cancellation
/// request.
pub fn testcancel() -> Result<()> {
    if cord().current().is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    Ok(())
}

/// Change the current fiber's cancellability; returns the previous
/// value. Not a cancellation point.
pub fn set_cancellable(yesno: bool) -> bool {
    let f = cord().current();
    let prev = f.flags().contains(FiberFlags::CANCELLABLE);
    if yesno {
        f.set_flag(FiberFlags::CANCELLABLE);
    } else {
        f.clear_flag(FiberFlags::CANCELLABLE);
    }
    prev
}

/// Move the current fiber to the end of the ready list and switch to the
/// next ready fiber: round-robin among equal-priority work.
pub fn reschedule() {
    let f = cord().current();
    wakeup(&f);
    yield_now();
}

/// Yield with a one-shot timeout; true when the timeout fired before
/// something else woke the fiber.
pub fn yield_timeout(delay: Duration) -> bool {
    let cord = cord();
    let fid = cord.current().fid();
    let token = cord.ev().arm_timer(delay, fid);
    yield_now();
    let fired = token.fired();
    token.disarm();
    fired
}

/// Suspend the current fiber for `delay`.
///
/// A zero delay still reaches the event loop: the idle watcher forces a
/// zero-timeout poll so other ready fibers and pending events run before
/// control returns.
pub fn sleep(delay: Duration) {
    let cord = cord();
    if delay.is_zero() {
        cord.ev().idle_start();
    }
    let _ = yield_timeout(delay);
    if delay.is_zero() {
        cord.ev().idle_stop();
    }
}

/// Wait for a joinable fiber to die; return its result and recycle it.
pub fn join(f: &Rc<Fiber>) -> Result<()> {
    if !f.flags().contains(FiberFlags::JOINABLE) {
        return Err(CoreError::Unjoinable);
    }
    let cord = cord();
    let self_f = cord.current();
    while !f.is_dead() {
        // A wakeup aimed at us (cancel, timer) consumes our entry in the
        // wake list, so re-register on every turn.
        f.push_waiter(&self_f);
        yield_now();
    }
    let ret = f.f_ret.get();
    let err = f.diag.take();
    cord.recycle(f);
    if ret != 0 {
        Err(err.unwrap_or_else(|| CoreError::FiberPanic("fiber failed without diagnostics".into())))
    } else {
        Ok(())
    }
}

/// Collect scratch-region garbage of the current fiber between requests.
pub fn gc() {
    cord().current().gc_region.gc();
}

/// Monotonic clock of the current cord's event loop.
pub fn clock() -> Duration {
    cord().ev().clock()
}

/// Visit every alive fiber of the current cord; a non-zero return stops
/// the walk and is returned.
pub fn stat(mut cb: impl FnMut(&Fiber) -> i32) -> i32 {
    for f in cord().alive_snapshot() {
        let rc = cb(&f);
        if rc != 0 {
            return rc;
        }
    }
    0
}

/// Store a value in the current fiber's type-keyed local storage.
pub fn local_set<T: Any>(value: T) {
    cord()
        .current()
        .storage
        .borrow_mut()
        .insert(TypeId::of::<T>(), Box::new(value));
}

/// Take a value out of the current fiber's local storage.
pub fn local_take<T: Any>() -> Option<T> {
    cord()
        .current()
        .storage
        .borrow_mut()
        .remove(&TypeId::of::<T>())
        .and_then(|b| b.downcast::<T>().ok())
        .map(|b| *b)
}

/// Run a closure over a value in the current fiber's local storage.
pub fn local_with<T: Any, R>(f: impl FnOnce(&mut T) -> R) -> Option<R> {
    let current = cord().current();
    let mut storage = current.storage.borrow_mut();
    storage
        .get_mut(&TypeId::of::<T>())
        .and_then(|b| b.downcast_mut::<T>())
        .map(f)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The trampoline every fiber context enters. Loops forever: recycled
/// fibers park at the final yield and resume here with a fresh body.
pub(crate) extern "C" fn fiber_trampoline() {
    loop {
        let cord = cord();
        let fiber = cord.current();
        debug_assert!(fiber.fid() != 0);
        let body = fiber
            .body
            .borrow_mut()
            .take()
            .expect("fiber resumed without a body");

        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        let ret = match outcome {
            Ok(Ok(())) => {
                // A leftover diagnostic must not reach the joiner.
                fiber.diag.clear();
                0
            }
            Ok(Err(e)) => {
                fiber.diag.set(e);
                -1
            }
            Err(payload) => {
                fiber.diag.set(CoreError::FiberPanic(panic_message(payload)));
                -1
            }
        };
        fiber.f_ret.set(ret);
        if ret != 0 && !fiber.flags().contains(FiberFlags::JOINABLE) {
            // For joinable fibers dealing with the error is the joiner's
            // business; for detached ones the runtime is the last stop.
            if !fiber.is_cancelled() {
                if let Some(e) = fiber.diag.take() {
                    tracing::error!(fiber = %fiber.name(), err = %e, "detached fiber failed");
                }
            }
            fiber.diag.clear();
        }

        fiber.set_flag(FiberFlags::DEAD);
        let waiters = std::mem::take(&mut *fiber.wake.borrow_mut());
        for w in waiters {
            if let Some(joiner) = w.upgrade() {
                debug_assert!(joiner.fid() != fiber.fid());
                wakeup(&joiner);
            }
        }
        if let Err(e) = fiber.on_stop.run(&()) {
            tracing::warn!(err = %e, "on_stop trigger failed");
        }
        // Drop a pending wakeup; a dead fiber never receives control.
        cord.remove_ready(&fiber);
        fiber.clear_flag(FiberFlags::READY);
        if !fiber.flags().contains(FiberFlags::JOINABLE) {
            cord.recycle(&fiber);
        }
        debug_assert!(fiber.body.borrow().is_none());
        drop(fiber);
        drop(cord);
        yield_now();
    }
}
