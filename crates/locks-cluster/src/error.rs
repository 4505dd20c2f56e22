use herald_locks::LockManagerError;
use thiserror::Error;

/// Errors that can occur when using the cluster lock manager.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The cluster currently has no leader to coordinate locks.
    #[error("no cluster leader is available to coordinate locks")]
    NoLeader,

    /// Lock status is only known to the leader.
    #[error("lock status can only be checked on the leader")]
    NotLeader,
}

impl LockManagerError for Error {}
