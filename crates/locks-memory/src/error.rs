use herald_locks::LockManagerError;
use thiserror::Error;

/// Error type for the in-memory lock manager. Operations never fail.
#[derive(Clone, Debug, Error)]
#[error("memory lock manager error")]
pub struct Error;

impl LockManagerError for Error {}
