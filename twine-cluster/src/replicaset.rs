//! The replica registry and the connect-quorum rendezvous.
//!
//! A replica is a remote member of the set, keyed by UUID, optionally
//! holding an applier for its inbound link. Attaching an applier
//! installs a relay trigger: every applier state change pokes the
//! replica set's shared condition variable, which is what
//! `wait_connected` blocks on — the consumed shape of the bootstrap
//! "connect quorum" phase.

use crate::applier::{Applier, ApplierState};
use crate::error::{ClusterError, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use twine_core::{fiber, CoreError, FiberCond, Trigger};
use uuid::Uuid;

/// One remote member of the replica set.
pub struct Replica {
    /// The member's instance UUID.
    pub uuid: Uuid,
    /// Numeric id once the member is registered in the cluster space.
    id: RefCell<Option<u32>>,
    applier: RefCell<Option<Rc<Applier>>>,
    relay_trigger: RefCell<Option<Rc<Trigger<ApplierState>>>>,
}

impl Replica {
    fn new(uuid: Uuid) -> Rc<Self> {
        Rc::new(Self {
            uuid,
            id: RefCell::new(None),
            applier: RefCell::new(None),
            relay_trigger: RefCell::new(None),
        })
    }

    /// The registered numeric id, if any.
    pub fn id(&self) -> Option<u32> {
        *self.id.borrow()
    }

    /// Assign the numeric id.
    pub fn set_id(&self, id: u32) {
        *self.id.borrow_mut() = Some(id);
    }

    /// The attached applier, if any.
    pub fn applier(&self) -> Option<Rc<Applier>> {
        self.applier.borrow().clone()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Replica({})", self.uuid)
    }
}

/// The set of known replicas of one cord.
#[derive(Default)]
pub struct Replicaset {
    replicas: RefCell<HashMap<Uuid, Rc<Replica>>>,
    /// Poked by every applier state change; quorum waiters sleep here.
    applier_cond: Rc<FiberCond>,
}

impl Replicaset {
    /// Create an empty replica set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member. Fails on a duplicate UUID.
    pub fn add(&self, uuid: Uuid) -> Result<Rc<Replica>> {
        let mut replicas = self.replicas.borrow_mut();
        if replicas.contains_key(&uuid) {
            return Err(ClusterError::DuplicateReplica(uuid));
        }
        let replica = Replica::new(uuid);
        replicas.insert(uuid, replica.clone());
        Ok(replica)
    }

    /// Look a member up by UUID.
    pub fn by_uuid(&self, uuid: &Uuid) -> Option<Rc<Replica>> {
        self.replicas.borrow().get(uuid).cloned()
    }

    /// Number of registered members.
    pub fn len(&self) -> usize {
        self.replicas.borrow().len()
    }

    /// True when no members are registered.
    pub fn is_empty(&self) -> bool {
        self.replicas.borrow().is_empty()
    }

    /// Visit every member.
    pub fn foreach(&self, mut f: impl FnMut(&Rc<Replica>)) {
        for replica in self.replicas.borrow().values() {
            f(replica);
        }
    }

    /// Attach an applier to a member, installing the state relay.
    pub fn set_applier(&self, replica: &Rc<Replica>, applier: Rc<Applier>) {
        self.clear_applier(replica);
        let cond = self.applier_cond.clone();
        let relay = Trigger::new(move |_state: &ApplierState| {
            // Any transition may complete (or break) the quorum; let
            // the waiters re-count.
            cond.broadcast();
            Ok(())
        });
        applier.observe(&relay);
        *replica.relay_trigger.borrow_mut() = Some(relay);
        *replica.applier.borrow_mut() = Some(applier);
    }

    /// Detach a member's applier and its relay.
    pub fn clear_applier(&self, replica: &Rc<Replica>) {
        if let Some(t) = replica.relay_trigger.borrow_mut().take() {
            t.clear();
        }
        *replica.applier.borrow_mut() = None;
    }

    fn connected_count(&self) -> usize {
        self.replicas
            .borrow()
            .values()
            .filter(|r| {
                r.applier
                    .borrow()
                    .as_ref()
                    .is_some_and(|a| a.state().is_connected())
            })
            .count()
    }

    /// Block the calling fiber until `quorum` appliers report a
    /// connected state (`Sync`/`Follow`) or the timeout expires.
    pub fn wait_connected(&self, quorum: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            fiber::testcancel()?;
            let connected = self.connected_count();
            if connected >= quorum {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClusterError::QuorumTimeout {
                    quorum,
                    missing: quorum - connected,
                });
            }
            match self.applier_cond.wait_timeout(deadline - now) {
                Ok(()) | Err(CoreError::Timeout) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for Replicaset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Replicaset(len={})", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twine_core::cord;
    use twine_core::Fiber;

    #[test]
    fn duplicate_uuid_is_rejected() {
        let set = Replicaset::new();
        let uuid = Uuid::new_v4();
        set.add(uuid).unwrap();
        assert!(matches!(
            set.add(uuid),
            Err(ClusterError::DuplicateReplica(_))
        ));
    }

    #[test]
    fn wait_connected_completes_on_quorum() {
        cord::run_main("quorum", || {
            let set = Rc::new(Replicaset::new());
            let mut appliers = Vec::new();
            for _ in 0..2 {
                let uuid = Uuid::new_v4();
                let replica = set.add(uuid).map_err(|e| {
                    twine_core::CoreError::IllegalParams(e.to_string())
                })?;
                let applier = Applier::new(uuid);
                set.set_applier(&replica, applier.clone());
                appliers.push(applier);
            }

            // A connector fiber brings the links up one by one.
            let connector_appliers = appliers.clone();
            let connector = Fiber::new(
                "connector",
                Box::new(move || {
                    for a in &connector_appliers {
                        fiber::sleep(Duration::from_millis(5));
                        a.set_state(ApplierState::Connect);
                        a.set_state(ApplierState::Follow);
                    }
                    Ok(())
                }),
            )?;
            connector.set_joinable(true);
            fiber::start(&connector);

            set.wait_connected(2, Duration::from_secs(5))
                .map_err(|e| twine_core::CoreError::IllegalParams(e.to_string()))?;
            fiber::join(&connector)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn wait_connected_times_out_without_quorum() {
        cord::run_main("quorum-timeout", || {
            let set = Replicaset::new();
            let uuid = Uuid::new_v4();
            let replica = set.add(uuid).map_err(|e| {
                twine_core::CoreError::IllegalParams(e.to_string())
            })?;
            set.set_applier(&replica, Applier::new(uuid));

            let err = set
                .wait_connected(1, Duration::from_millis(20))
                .unwrap_err();
            assert!(matches!(
                err,
                ClusterError::QuorumTimeout { quorum: 1, missing: 1 }
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn detached_applier_stops_relaying() {
        cord::run_main("relay-detach", || {
            let set = Replicaset::new();
            let uuid = Uuid::new_v4();
            let replica = set.add(uuid).map_err(|e| {
                twine_core::CoreError::IllegalParams(e.to_string())
            })?;
            let applier = Applier::new(uuid);
            set.set_applier(&replica, applier.clone());
            set.clear_applier(&replica);
            // The relay trigger is cleared with the applier.
            assert!(applier.on_state.is_empty());
            assert!(replica.applier().is_none());
            Ok(())
        })
        .unwrap();
    }
}
