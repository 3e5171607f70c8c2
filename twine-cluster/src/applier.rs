//! Appliers: the inbound half of a replication link.
//!
//! The transport is out of scope here; what the control plane consumes
//! is the state machine and its observation points. Every transition
//! runs the `on_state` trigger list synchronously in the applier's
//! fiber, and `pause`/`resume` park the applier fiber on a condition
//! variable so the control plane can hold replication back.

use crate::error::Result;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use twine_core::{fiber, CoreError, FiberCond, Trigger, TriggerList};
use uuid::Uuid;

/// States of an applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    /// Not started.
    Off,
    /// Dialing the master.
    Connect,
    /// Authenticating.
    Auth,
    /// Handshake done, idle.
    Ready,
    /// Initial or final join in progress.
    Sync,
    /// Streaming rows.
    Follow,
    /// Stopped by the control plane.
    Stopped,
    /// Connection lost, waiting to retry.
    Disconnected,
}

impl ApplierState {
    /// States counting towards the connect quorum.
    pub fn is_connected(self) -> bool {
        matches!(self, ApplierState::Sync | ApplierState::Follow)
    }
}

/// One inbound replication link.
pub struct Applier {
    /// UUID of the remote instance.
    pub uuid: Uuid,
    state: Cell<ApplierState>,
    /// Fired on every state change with the new state.
    pub on_state: TriggerList<ApplierState>,
    pause_cond: FiberCond,
    paused: Cell<bool>,
}

impl Applier {
    /// Create an applier for the given remote instance.
    pub fn new(uuid: Uuid) -> Rc<Self> {
        Rc::new(Self {
            uuid,
            state: Cell::new(ApplierState::Off),
            on_state: TriggerList::new(),
            pause_cond: FiberCond::new(),
            paused: Cell::new(false),
        })
    }

    /// The current state.
    pub fn state(&self) -> ApplierState {
        self.state.get()
    }

    /// Transition and fire the `on_state` triggers. Trigger failures
    /// are logged, not propagated: observers must not kill the link.
    pub fn set_state(&self, state: ApplierState) {
        if self.state.get() == state {
            return;
        }
        tracing::debug!(applier = %self.uuid, ?state, "applier state change");
        self.state.set(state);
        if let Err(e) = self.on_state.run(&state) {
            tracing::warn!(applier = %self.uuid, err = %e, "on_state trigger failed");
        }
    }

    /// Ask the applier fiber to park at its next pause point.
    pub fn pause(&self) {
        self.paused.set(true);
    }

    /// Release a paused applier fiber.
    pub fn resume(&self) {
        self.paused.set(false);
        self.pause_cond.broadcast();
    }

    /// Pause point: the applier fiber calls this between batches; it
    /// parks while the control plane holds the link paused.
    pub fn pause_point(&self, check_interval: Duration) -> Result<()> {
        while self.paused.get() {
            fiber::testcancel()?;
            match self.pause_cond.wait_timeout(check_interval) {
                Ok(()) | Err(CoreError::Timeout) => {}
                Err(e) => return Err(e.into()),
            }
        }
        fiber::testcancel()?;
        Ok(())
    }

    /// Register an observer for state changes.
    pub fn observe(&self, t: &Rc<Trigger<ApplierState>>) {
        self.on_state.add(t);
    }
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Applier({}, {:?})", self.uuid, self.state.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use twine_core::cord;

    #[test]
    fn state_changes_fire_triggers_in_order() {
        cord::run_main("applier-triggers", || {
            let applier = Applier::new(Uuid::new_v4());
            let log: Rc<RefCell<Vec<ApplierState>>> = Rc::new(RefCell::new(Vec::new()));
            let seen = log.clone();
            applier.observe(&Trigger::new(move |s: &ApplierState| {
                seen.borrow_mut().push(*s);
                Ok(())
            }));
            applier.set_state(ApplierState::Connect);
            applier.set_state(ApplierState::Connect); // no-op
            applier.set_state(ApplierState::Follow);
            assert_eq!(
                *log.borrow(),
                vec![ApplierState::Connect, ApplierState::Follow]
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn pause_point_parks_until_resume() {
        cord::run_main("applier-pause", || {
            let applier = Applier::new(Uuid::new_v4());
            applier.pause();

            let worker_applier = applier.clone();
            let rounds = Rc::new(Cell::new(0u32));
            let worker_rounds = rounds.clone();
            let worker = twine_core::Fiber::new(
                "applier",
                Box::new(move || {
                    worker_applier
                        .pause_point(Duration::from_millis(5))
                        .map_err(|_| twine_core::CoreError::Cancelled)?;
                    worker_rounds.set(worker_rounds.get() + 1);
                    Ok(())
                }),
            )?;
            worker.set_joinable(true);
            fiber::start(&worker);
            assert_eq!(rounds.get(), 0);

            fiber::sleep(Duration::from_millis(10));
            assert_eq!(rounds.get(), 0);

            applier.resume();
            fiber::join(&worker)?;
            assert_eq!(rounds.get(), 1);
            Ok(())
        })
        .unwrap();
    }
}
