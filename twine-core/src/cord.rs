//! Cords: one fiber scheduler and event loop per OS thread.
//!
//! A cord owns its fibers (alive list, FIFO ready list, dead pool), the
//! fiber-id registry, the stack arena and the event loop. Exactly one
//! fiber is current at any time; the privileged scheduler fiber (`fid`
//! [`FID_SCHED`]) drives the loop and dispatches the ready list as a
//! caller chain: each ready fiber's `caller` is linked to the next, so a
//! yielding fiber continues the chain instead of bouncing through the
//! scheduler.
//!
//! Cross-thread life cycle: [`Cord::start`] spawns a thread whose entry
//! builds a cord, signals a start condition and runs the entry closure;
//! [`CordHandle::join`] is a plain thread join with diagnostic
//! propagation; [`CordHandle::cojoin`] parks the joining *fiber* instead
//! of its thread, rendezvousing through a single compare-and-swap on the
//! target's `on_exit` slot.

use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::{CoreError, Result};
use crate::evloop::{EvLoop, LoopRemote};
use crate::fiber::{self, fiber_trampoline, Fiber, FiberAttr, FiberBody, FiberFlags};
use crate::stack::StackArena;
use crate::trigger::Trigger;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Fiber id of every cord's scheduler fiber.
pub const FID_SCHED: u32 = 1;

thread_local! {
    static CURRENT_CORD: RefCell<Option<Rc<Cord>>> = const { RefCell::new(None) };
}

/// The cord bound to the current thread.
///
/// # Panics
/// Panics when the thread has no cord; start one with [`run_main`] or
/// [`Cord::start`].
pub(crate) fn cord() -> Rc<Cord> {
    try_cord().expect("no cord is bound to this thread; enter one via cord::run_main or Cord::start")
}

pub(crate) fn try_cord() -> Option<Rc<Cord>> {
    CURRENT_CORD.with(|c| c.borrow().clone())
}

/// The cord bound to the current thread, for inspection.
///
/// # Panics
/// Panics when the thread has no cord.
pub fn current() -> Rc<Cord> {
    cord()
}

/// True when the current thread runs the process's main cord.
pub fn is_main() -> bool {
    cord().is_main
}

/// Name of the current cord.
pub fn name() -> String {
    cord().name.clone()
}

// on_exit slot states for the cojoin handshake.
const EXIT_EMPTY: u8 = 0;
const EXIT_ARMED: u8 = 1;
const EXIT_WONT_RUN: u8 = 2;

/// The part of a cord other threads may see.
struct CordShared {
    /// Single-writer slot: either a joiner arms a handler (EMPTY→ARMED)
    /// or the exiting thread seals it (EMPTY→WONT_RUN).
    on_exit_state: AtomicU8,
    on_exit_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// The cord's final diagnostic, moved to whoever joins.
    result: Mutex<Option<Result<()>>>,
}

impl CordShared {
    fn new() -> Self {
        Self {
            on_exit_state: AtomicU8::new(EXIT_EMPTY),
            on_exit_cb: Mutex::new(None),
            result: Mutex::new(None),
        }
    }

    /// Called by the cord's thread right before it terminates.
    fn run_exit_handshake(&self) {
        let sealed = self.on_exit_state.compare_exchange(
            EXIT_EMPTY,
            EXIT_WONT_RUN,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if sealed.is_err() {
            // A joiner got there first; run its handler.
            if let Some(cb) = self.on_exit_cb.lock().take() {
                cb();
            }
        }
    }
}

/// One OS thread's scheduler state.
pub struct Cord {
    name: String,
    is_main: bool,
    config: RuntimeConfig,
    ev: EvLoop,
    stacks: StackArena,
    sched: Rc<Fiber>,
    current: RefCell<Rc<Fiber>>,
    alive: RefCell<Vec<Rc<Fiber>>>,
    ready: RefCell<VecDeque<Rc<Fiber>>>,
    /// Recycled default-stack fibers, parked in the trampoline.
    dead: RefCell<Vec<Rc<Fiber>>>,
    /// Self-recycled custom-stack fibers awaiting destruction.
    graveyard: RefCell<Vec<Rc<Fiber>>>,
    registry: RefCell<HashMap<u32, Rc<Fiber>>>,
    max_fid: Cell<u32>,
}

impl Cord {
    /// Build a cord and bind it to the current thread.
    fn create(name: &str, config: RuntimeConfig, is_main: bool) -> Result<Rc<Cord>> {
        // Probe process-wide state early so a fiber never pays for it.
        crate::stack::page_size();
        crate::stack::stack_direction();

        let ev = EvLoop::new()?;
        let stacks = StackArena::new(config.stack_size, config.stack_watermark_window);
        let sched = Rc::new(Fiber::raw(FID_SCHED, "sched", config.region_gc_threshold));
        let max_fid = config.reserved_fid_count;
        let cord = Rc::new(Cord {
            name: name.to_string(),
            is_main,
            config,
            ev,
            stacks,
            current: RefCell::new(sched.clone()),
            sched,
            alive: RefCell::new(Vec::new()),
            ready: RefCell::new(VecDeque::new()),
            dead: RefCell::new(Vec::new()),
            graveyard: RefCell::new(Vec::new()),
            registry: RefCell::new(HashMap::new()),
            max_fid: Cell::new(max_fid),
        });
        CURRENT_CORD.with(|c| *c.borrow_mut() = Some(cord.clone()));
        tracing::debug!(cord = name, "cord created");
        Ok(cord)
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn ev(&self) -> &EvLoop {
        &self.ev
    }

    /// The cord's stack arena (counters are useful in tests).
    pub fn stack_arena(&self) -> &StackArena {
        &self.stacks
    }

    pub(crate) fn sched(&self) -> Rc<Fiber> {
        self.sched.clone()
    }

    pub(crate) fn current(&self) -> Rc<Fiber> {
        self.current.borrow().clone()
    }

    pub(crate) fn set_current(&self, f: &Rc<Fiber>) {
        *self.current.borrow_mut() = f.clone();
    }

    pub(crate) fn find(&self, fid: u32) -> Option<Rc<Fiber>> {
        self.registry.borrow().get(&fid).cloned()
    }

    pub(crate) fn push_ready(&self, f: &Rc<Fiber>) {
        self.ready.borrow_mut().push_back(f.clone());
    }

    pub(crate) fn remove_ready(&self, f: &Rc<Fiber>) {
        self.ready.borrow_mut().retain(|r| !Rc::ptr_eq(r, f));
    }

    pub(crate) fn alive_snapshot(&self) -> Vec<Rc<Fiber>> {
        self.alive.borrow().clone()
    }

    /// Allocate or recycle a fiber (see `Fiber::new`).
    pub(crate) fn fiber_new(
        &self,
        name: &str,
        attr: &FiberAttr,
        body: FiberBody,
    ) -> Result<Rc<Fiber>> {
        let custom = attr.custom_stack;
        let fiber = if !custom && !self.dead.borrow().is_empty() {
            let f = self.dead.borrow_mut().remove(0);
            self.alive.borrow_mut().push(f.clone());
            f
        } else {
            let size = if custom {
                attr.stack_size
            } else {
                self.config.stack_size
            };
            let stack = self.stacks.alloc(size)?;
            let f = Rc::new(Fiber::raw(0, "", self.config.region_gc_threshold));
            if let Err(e) = f.ctx.make(stack.lo(), stack.size(), fiber_trampoline) {
                self.stacks.destroy(&stack);
                return Err(e);
            }
            *f.stack.borrow_mut() = Some(stack);
            if custom {
                f.set_flag(FiberFlags::CUSTOM_STACK);
            }
            self.alive.borrow_mut().push(f.clone());
            f
        };

        *fiber.body.borrow_mut() = Some(body);
        // Skip the reserved id range; fids are never reused in a cord.
        let mut next = self.max_fid.get().wrapping_add(1);
        if next <= self.config.reserved_fid_count {
            next = self.config.reserved_fid_count + 1;
        }
        self.max_fid.set(next);
        fiber.fid.set(next);
        fiber.set_name(name);
        self.registry.borrow_mut().insert(next, fiber.clone());
        // Scratch policy runs between the scheduler resuming and reuse.
        fiber.region().gc();
        Ok(fiber)
    }

    /// Return a dead fiber to the pool, or destroy a custom-stack one.
    pub(crate) fn recycle(&self, f: &Rc<Fiber>) {
        debug_assert!(f.diag.is_empty());
        let custom = f.flags().contains(FiberFlags::CUSTOM_STACK);
        if !custom {
            if let Some(stack) = &*f.stack.borrow() {
                self.stacks.recycle(stack);
            }
        }
        f.reset();
        f.name.borrow_mut().clear();
        f.wake.borrow_mut().clear();
        f.storage.borrow_mut().clear();
        *f.body.borrow_mut() = None;
        f.f_ret.set(0);
        self.registry.borrow_mut().remove(&f.fid());
        f.fid.set(0);
        f.region().free();
        self.alive.borrow_mut().retain(|a| !Rc::ptr_eq(a, f));
        if !custom {
            self.dead.borrow_mut().push(f.clone());
        } else if Rc::ptr_eq(f, &self.current()) {
            // Can't unmap the stack we are standing on; the scheduler
            // destroys it after the final switch away.
            self.graveyard.borrow_mut().push(f.clone());
        } else {
            self.destroy_fiber(f);
        }
    }

    fn destroy_fiber(&self, f: &Rc<Fiber>) {
        if let Some(stack) = f.stack.borrow_mut().take() {
            self.stacks.destroy(&stack);
        }
    }

    fn drain_graveyard(&self) {
        let doomed = std::mem::take(&mut *self.graveyard.borrow_mut());
        for f in doomed {
            self.destroy_fiber(&f);
        }
    }

    /// Transfer control into `callee` from the current fiber.
    pub(crate) fn call_impl(&self, callee: &Rc<Fiber>) {
        let caller = self.current();
        debug_assert!(
            callee.flags().contains(FiberFlags::READY) || callee.fid() == FID_SCHED,
            "switching to a fiber that was not scheduled"
        );
        debug_assert!(!callee.is_dead());
        debug_assert!(!Rc::ptr_eq(&caller, callee));
        self.set_current(callee);
        callee.clear_flag(FiberFlags::READY);
        callee.csw.set(callee.csw.get() + 1);
        Context::transfer(&caller.ctx, &callee.ctx);
    }

    /// Dispatch the ready list as one caller chain.
    fn dispatch_ready(&self) {
        let mut list = std::mem::take(&mut *self.ready.borrow_mut());
        let Some(first) = list.pop_front() else {
            return;
        };
        debug_assert!(first.flags().contains(FiberFlags::READY));
        let mut last = first.clone();
        for next in list {
            debug_assert!(next.flags().contains(FiberFlags::READY));
            *last.caller.borrow_mut() = Some(next.clone());
            last = next;
        }
        *last.caller.borrow_mut() = Some(self.sched());
        self.call_impl(&first);
    }

    /// Drive the event loop until `brk` is requested. Runs on the
    /// scheduler fiber.
    pub fn run(&self) {
        debug_assert_eq!(self.current().fid(), FID_SCHED);
        while !self.ev.brk_requested() {
            let ready_pending = !self.ready.borrow().is_empty();
            let wakes = self.ev.turn(ready_pending);
            for fid in wakes {
                if let Some(f) = self.find(fid) {
                    fiber::wakeup(&f);
                }
            }
            self.dispatch_ready();
            self.drain_graveyard();
        }
        self.ev.clear_brk();
    }

    /// Destroy every fiber and unbind the cord from the thread.
    fn teardown(&self) {
        let alive = std::mem::take(&mut *self.alive.borrow_mut());
        for f in alive {
            tracing::warn!(fiber = %f.name(), fid = f.fid(), "fiber leaked at cord shutdown");
            self.destroy_fiber(&f);
        }
        let dead = std::mem::take(&mut *self.dead.borrow_mut());
        for f in dead {
            self.destroy_fiber(&f);
        }
        self.drain_graveyard();
        self.registry.borrow_mut().clear();
        self.ready.borrow_mut().clear();
        CURRENT_CORD.with(|c| *c.borrow_mut() = None);
        tracing::debug!(cord = %self.name, "cord destroyed");
    }

    /// Spawn an OS thread running `entry` on a fresh cord. Returns once
    /// the cord is initialized; initialization failure is returned here
    /// instead.
    pub fn start<F>(name: &str, entry: F) -> Result<CordHandle>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self::start_with_config(name, RuntimeConfig::from_env(), entry)
    }

    /// Like [`Cord::start`] with an explicit configuration.
    pub fn start_with_config<F>(name: &str, config: RuntimeConfig, entry: F) -> Result<CordHandle>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let shared = Arc::new(CordShared::new());
        let started: Arc<(Mutex<Option<Result<()>>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));

        let thread_shared = shared.clone();
        let thread_started = started.clone();
        let cord_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(cord_name.clone())
            .spawn(move || {
                let cord = match Cord::create(&cord_name, config, false) {
                    Ok(cord) => {
                        let mut lock = thread_started.0.lock();
                        *lock = Some(Ok(()));
                        thread_started.1.notify_one();
                        drop(lock);
                        cord
                    }
                    Err(e) => {
                        let mut lock = thread_started.0.lock();
                        *lock = Some(Err(e));
                        thread_started.1.notify_one();
                        return;
                    }
                };
                let res = entry();
                if let Err(e) = &res {
                    tracing::error!(cord = %cord.name, err = %e, "cord entry failed");
                }
                *thread_shared.result.lock() = Some(res);
                cord.teardown();
                // The slot is change-once: either a joiner already armed
                // a handler (run it) or seal it so no handler can be
                // installed after this thread is gone.
                thread_shared.run_exit_handshake();
            })
            .map_err(|e| CoreError::system("clone", e))?;

        // Wait for the start condition.
        let mut lock = started.0.lock();
        while lock.is_none() {
            started.1.wait(&mut lock);
        }
        let startup = lock.take().expect("start condition signalled");
        drop(lock);
        match startup {
            Ok(()) => Ok(CordHandle {
                thread: Some(thread),
                shared,
            }),
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    /// Spawn a cord whose entry runs `body` as the cord's main fiber
    /// with the event loop around it.
    pub fn costart<F>(name: &str, body: F) -> Result<CordHandle>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self::start(name, move || run_main_fiber(Box::new(body)))
    }
}

/// Create a "main" fiber around `body` on the current cord, run the
/// scheduler loop until it dies, and return its result.
fn run_main_fiber(body: FiberBody) -> Result<()> {
    let main = Fiber::new("main", body)?;
    main.set_joinable(true);
    // A trigger, so the loop breaks even when the fiber fails.
    let brk = Trigger::new(|_: &()| {
        cord().ev().brk();
        Ok(())
    });
    main.on_stop.add(&brk);
    fiber::start(&main);
    if !main.is_dead() {
        cord().run();
    }
    debug_assert!(main.is_dead());
    fiber::join(&main)
}

/// Bootstrap a cord on the current thread, run `body` as its main
/// fiber, and tear the cord down again. The entry point for tests and
/// for the process's main thread.
pub fn run_main<F>(name: &str, body: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + 'static,
{
    let cord = Cord::create(name, RuntimeConfig::from_env(), true)?;
    let res = run_main_fiber(Box::new(body));
    cord.teardown();
    res
}

/// Like [`run_main`] with an explicit configuration.
pub fn run_main_with_config<F>(name: &str, config: RuntimeConfig, body: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + 'static,
{
    let cord = Cord::create(name, config, true)?;
    let res = run_main_fiber(Box::new(body));
    cord.teardown();
    res
}

/// Owner handle of a started cord.
pub struct CordHandle {
    thread: Option<std::thread::JoinHandle<()>>,
    shared: Arc<CordShared>,
}

impl CordHandle {
    /// OS-thread join; propagates the cord's last diagnostic.
    pub fn join(mut self) -> Result<()> {
        let thread = self.thread.take().expect("handle joined once");
        thread
            .join()
            .map_err(|_| CoreError::FiberPanic("cord thread panicked".into()))?;
        self.shared.result.lock().take().unwrap_or(Ok(()))
    }

    /// Fiber-aware join: parks the calling fiber (not its thread) until
    /// the target cord's thread is about to exit, then joins it.
    ///
    /// The rendezvous is one compare-and-swap on the target's `on_exit`
    /// slot. Losing the race means the target already sealed the slot
    /// with its "won't run" marker — it is gone, fall through to a plain
    /// join. Winning it parks this fiber; the exiting thread runs the
    /// armed handler, which posts a wake through this cord's loop
    /// remote.
    pub fn cojoin(self) -> Result<()> {
        let cord = cord();
        let remote: Arc<LoopRemote> = cord.ev().remote();
        let fid = cord.current().fid();
        let complete = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let cb_complete = complete.clone();
        let cb = Box::new(move || {
            cb_complete.store(true, Ordering::Release);
            remote.post_wake(fid);
        });
        // Install the handler before publishing it through the CAS.
        *self.shared.on_exit_cb.lock() = Some(cb);
        let armed = self.shared.on_exit_state.compare_exchange(
            EXIT_EMPTY,
            EXIT_ARMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match armed {
            Ok(_) => {
                // Non-cancellable across the yield: a cancel-driven early
                // return would drop `complete` while the exiting thread
                // still holds the handler.
                let was_cancellable = fiber::set_cancellable(false);
                while !complete.load(Ordering::Acquire) {
                    fiber::yield_now();
                }
                fiber::set_cancellable(was_cancellable);
            }
            Err(state) => {
                debug_assert_eq!(state, EXIT_WONT_RUN);
                *self.shared.on_exit_cb.lock() = None;
            }
        }
        self.join()
    }
}

impl std::fmt::Debug for CordHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CordHandle")
    }
}
