//! Error types for cluster operations.

use thiserror::Error;

/// Result type alias using [`ClusterError`].
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors that can occur in replica-set control operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Instance identity was used before `instance::init`.
    #[error("instance identity is not initialized")]
    Uninitialized,

    /// Instance identity was initialized twice.
    #[error("instance identity is already initialized")]
    AlreadyInitialized,

    /// A replica with this UUID is already registered.
    #[error("replica {0} is already registered")]
    DuplicateReplica(uuid::Uuid),

    /// The quorum did not connect in time.
    #[error("failed to connect {missing} out of {quorum} replicas in time")]
    QuorumTimeout {
        /// Required quorum size.
        quorum: usize,
        /// Replicas still missing when the timer fired.
        missing: usize,
    },

    /// Core runtime error.
    #[error(transparent)]
    Core(#[from] twine_core::CoreError),
}
