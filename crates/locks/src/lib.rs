//! Abstract interface for managing cluster-wide named locks.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for `LockManager` errors
pub trait LockManagerError: Debug + Error + Send + Sync + 'static {}

/// Represents the current status of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free.
    Free,

    /// The lock is held by another node, identified by the String.
    HeldByOther(String),

    /// The lock is held by the current node.
    HeldBySelf,
}

/// A lock manager with non-blocking acquisition.
///
/// Locks are identified by name. A lock is held until released, or until the
/// implementation's hold timeout expires.
#[async_trait]
pub trait LockManager: Clone + Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockManagerError;

    /// Checks the status of a lock.
    ///
    /// # Arguments
    /// * `resource_id`: The unique identifier for the resource.
    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error>;

    /// Attempts to acquire a lock without waiting for it to become free.
    ///
    /// Returns `Ok(true)` if the lock was acquired and `Ok(false)` if it is
    /// currently held.
    ///
    /// # Arguments
    /// * `resource_id`: A unique identifier for the resource to be locked.
    async fn try_lock(&self, resource_id: String) -> Result<bool, Self::Error>;

    /// Releases a lock. Releasing a free lock is a no-op.
    ///
    /// # Arguments
    /// * `resource_id`: The unique identifier for the resource.
    async fn release(&self, resource_id: String) -> Result<(), Self::Error>;
}
