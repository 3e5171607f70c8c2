//! The per-cord event loop.
//!
//! One `mio::Poll` per cord, driven by the scheduler fiber. Everything a
//! watcher can do reduces to "wake fiber N": readiness events, one-shot
//! timers and cross-thread posts all surface as fiber ids which the
//! scheduler feeds into the ready list.
//!
//! The pieces map onto the classic watcher set: the waker token is the
//! async watcher (the only cross-thread entry point), the timer heap
//! provides one-shot timers folded into the poll timeout, and the idle
//! counter forces zero-timeout polls so a `sleep(0)` turns around without
//! waiting for the backend's minimum sleep.

use crate::error::{CoreError, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAKER_TOKEN: Token = Token(0);

/// Cross-thread wake endpoint of a cord's loop. The only part of the
/// loop other threads may touch.
pub(crate) struct LoopRemote {
    waker: Waker,
    inbox: Mutex<Vec<u32>>,
}

impl LoopRemote {
    /// Post "wake fiber `fid`" to the owning cord and interrupt its poll.
    pub(crate) fn post_wake(&self, fid: u32) {
        self.inbox.lock().push(fid);
        if let Err(e) = self.waker.wake() {
            tracing::error!(err = %e, "loop waker failed");
        }
    }
}

/// Armed state of one one-shot timer, shared with the waiting fiber.
pub(crate) struct TimerToken {
    fired: Rc<Cell<bool>>,
    armed: Rc<Cell<bool>>,
}

impl TimerToken {
    pub(crate) fn fired(&self) -> bool {
        self.fired.get()
    }

    pub(crate) fn disarm(&self) {
        self.armed.set(false);
    }
}

struct TimerEnt {
    deadline: Instant,
    seq: u64,
    fid: u32,
    fired: Rc<Cell<bool>>,
    armed: Rc<Cell<bool>>,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline is
// the maximum.
impl PartialEq for TimerEnt {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEnt {}
impl PartialOrd for TimerEnt {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEnt {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct IoState {
    fid: u32,
    readable: bool,
    writable: bool,
}

/// Readiness reported by an [`IoWatcher`] wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// The descriptor became readable.
    pub readable: bool,
    /// The descriptor became writable.
    pub writable: bool,
}

/// The event loop proper. Owned by a cord, driven by its scheduler.
pub(crate) struct EvLoop {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    remote: Arc<LoopRemote>,
    timers: RefCell<BinaryHeap<TimerEnt>>,
    timer_seq: Cell<u64>,
    io: RefCell<HashMap<usize, IoState>>,
    next_token: Cell<usize>,
    idle: Cell<u32>,
    brk: Cell<bool>,
    epoch: Instant,
}

impl EvLoop {
    pub(crate) fn new() -> Result<Self> {
        let poll = Poll::new().map_err(|e| CoreError::system("epoll_create", e))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|e| CoreError::system("eventfd", e))?;
        Ok(Self {
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(256)),
            remote: Arc::new(LoopRemote {
                waker,
                inbox: Mutex::new(Vec::new()),
            }),
            timers: RefCell::new(BinaryHeap::new()),
            timer_seq: Cell::new(0),
            io: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            idle: Cell::new(0),
            brk: Cell::new(false),
            epoch: Instant::now(),
        })
    }

    pub(crate) fn remote(&self) -> Arc<LoopRemote> {
        self.remote.clone()
    }

    /// Monotonic loop clock.
    pub(crate) fn clock(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Request the scheduler loop to stop after the current iteration.
    pub(crate) fn brk(&self) {
        self.brk.set(true);
    }

    pub(crate) fn brk_requested(&self) -> bool {
        self.brk.get()
    }

    pub(crate) fn clear_brk(&self) {
        self.brk.set(false);
    }

    /// Arm a one-shot timer waking `fid` after `delay`.
    pub(crate) fn arm_timer(&self, delay: Duration, fid: u32) -> TimerToken {
        let fired = Rc::new(Cell::new(false));
        let armed = Rc::new(Cell::new(true));
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        self.timers.borrow_mut().push(TimerEnt {
            deadline: Instant::now() + delay,
            seq,
            fid,
            fired: fired.clone(),
            armed: armed.clone(),
        });
        TimerToken { fired, armed }
    }

    /// Arm the idle watcher: the next polls use a zero timeout.
    pub(crate) fn idle_start(&self) {
        self.idle.set(self.idle.get() + 1);
    }

    pub(crate) fn idle_stop(&self) {
        let n = self.idle.get();
        debug_assert!(n > 0);
        self.idle.set(n.saturating_sub(1));
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self.timers.borrow_mut();
        // Drop disarmed entries so they cannot shorten the poll.
        while let Some(top) = timers.peek() {
            if top.armed.get() {
                return Some(top.deadline);
            }
            timers.pop();
        }
        None
    }

    /// Run one poll turn; returns the fiber ids to wake.
    pub(crate) fn turn(&self, force_zero_timeout: bool) -> Vec<u32> {
        let now = Instant::now();
        let timeout = if force_zero_timeout || self.idle.get() > 0 || self.brk.get() {
            Some(Duration::ZERO)
        } else {
            self.next_deadline()
                .map(|d| d.saturating_duration_since(now))
        };

        {
            let mut events = self.events.borrow_mut();
            let mut poll = self.poll.borrow_mut();
            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    tracing::error!(err = %e, "event poll failed");
                }
            }
        }

        let mut wakes = Vec::new();
        {
            let events = self.events.borrow();
            let mut io_states = self.io.borrow_mut();
            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => wakes.append(&mut self.remote.inbox.lock()),
                    Token(t) => {
                        if let Some(state) = io_states.get_mut(&t) {
                            state.readable |= event.is_readable();
                            state.writable |= event.is_writable();
                            if state.fid != 0 {
                                wakes.push(state.fid);
                            }
                        }
                    }
                }
            }
        }

        let now = Instant::now();
        let mut timers = self.timers.borrow_mut();
        while let Some(top) = timers.peek() {
            if top.armed.get() && top.deadline > now {
                break;
            }
            let ent = timers.pop().expect("peeked entry");
            if ent.armed.get() {
                ent.fired.set(true);
                wakes.push(ent.fid);
            }
        }
        wakes
    }

    fn register_fd(&self, fd: RawFd, interest: Interest) -> Result<usize> {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        self.poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), Token(token), interest)
            .map_err(|e| CoreError::system("epoll_ctl", e))?;
        self.io.borrow_mut().insert(
            token,
            IoState {
                fid: 0,
                readable: false,
                writable: false,
            },
        );
        Ok(token)
    }

    fn deregister_fd(&self, fd: RawFd, token: usize) {
        self.io.borrow_mut().remove(&token);
        if let Err(e) = self.poll.borrow().registry().deregister(&mut SourceFd(&fd)) {
            tracing::warn!(err = %e, "fd deregister failed");
        }
    }
}

/// A readiness watcher: parks the calling fiber until a file descriptor
/// becomes ready or a timeout expires.
pub struct IoWatcher {
    fd: RawFd,
    token: usize,
}

impl IoWatcher {
    /// Register `fd` with the current cord's loop for `interest`.
    pub fn new(fd: RawFd, interest: Interest) -> Result<Self> {
        let cord = crate::cord::cord();
        let token = cord.ev().register_fd(fd, interest)?;
        Ok(Self { fd, token })
    }

    /// Wait until the descriptor is ready. `None` waits forever.
    ///
    /// Readiness observed since the previous wait is consumed first, so
    /// edge bursts between waits are not lost.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Readiness> {
        let cord = crate::cord::cord();
        loop {
            {
                let mut io = cord.ev().io.borrow_mut();
                let state = io
                    .get_mut(&self.token)
                    .expect("watcher registered on this loop");
                if state.readable || state.writable {
                    let ready = Readiness {
                        readable: state.readable,
                        writable: state.writable,
                    };
                    state.readable = false;
                    state.writable = false;
                    state.fid = 0;
                    return Ok(ready);
                }
                state.fid = crate::fiber::self_fid();
            }
            let timed_out = match timeout {
                Some(d) => crate::fiber::yield_timeout(d),
                None => {
                    crate::fiber::yield_now();
                    false
                }
            };
            if timed_out {
                let mut io = cord.ev().io.borrow_mut();
                if let Some(state) = io.get_mut(&self.token) {
                    state.fid = 0;
                }
                return Err(CoreError::Timeout);
            }
        }
    }
}

impl Drop for IoWatcher {
    fn drop(&mut self) {
        if let Some(cord) = crate::cord::try_cord() {
            cord.ev().deregister_fd(self.fd, self.token);
        }
    }
}

// Re-export the interest type so callers do not name mio directly.
pub use mio::Interest as IoInterest;
