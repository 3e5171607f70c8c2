//! Process-wide instance identity.
//!
//! `INSTANCE_UUID` identifies this process, `REPLICASET_UUID` the set
//! it belongs to. Both are explicitly-initialized process state with an
//! `init`/`free` lifecycle rather than ambient globals: reading them
//! before initialization is an error, and tests can tear them down.

use crate::error::{ClusterError, Result};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use uuid::Uuid;

struct Identity {
    instance: Uuid,
    replicaset: Uuid,
}

fn slot() -> &'static RwLock<Option<Identity>> {
    static SLOT: OnceCell<RwLock<Option<Identity>>> = OnceCell::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Install the identity. Fails when called twice without [`free`].
pub fn init(instance: Uuid, replicaset: Uuid) -> Result<()> {
    let mut guard = slot().write();
    if guard.is_some() {
        return Err(ClusterError::AlreadyInitialized);
    }
    *guard = Some(Identity {
        instance,
        replicaset,
    });
    tracing::info!(%instance, %replicaset, "instance identity installed");
    Ok(())
}

/// Generate and install a fresh identity.
pub fn init_new() -> Result<(Uuid, Uuid)> {
    let instance = Uuid::new_v4();
    let replicaset = Uuid::new_v4();
    init(instance, replicaset)?;
    Ok((instance, replicaset))
}

/// Tear the identity down.
pub fn free() {
    *slot().write() = None;
}

/// This process's UUID.
pub fn instance_uuid() -> Result<Uuid> {
    slot()
        .read()
        .as_ref()
        .map(|id| id.instance)
        .ok_or(ClusterError::Uninitialized)
}

/// The replica set's UUID.
pub fn replicaset_uuid() -> Result<Uuid> {
    slot()
        .read()
        .as_ref()
        .map(|id| id.replicaset)
        .ok_or(ClusterError::Uninitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Identity is process-wide; keep every check in one test so
    // parallel test threads cannot race the shared slot.
    #[test]
    fn lifecycle() {
        free();
        assert!(matches!(
            instance_uuid(),
            Err(ClusterError::Uninitialized)
        ));
        let (instance, replicaset) = init_new().unwrap();
        assert_eq!(instance_uuid().unwrap(), instance);
        assert_eq!(replicaset_uuid().unwrap(), replicaset);
        assert!(matches!(
            init(instance, replicaset),
            Err(ClusterError::AlreadyInitialized)
        ));
        free();
        assert!(instance_uuid().is_err());
    }
}
