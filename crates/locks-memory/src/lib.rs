//! In-memory (single process) implementation of locks for local development
//! and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use herald_locks::{LockManager, LockStatus};
use tokio::sync::Mutex;
use tracing::debug;

/// In-memory lock manager. Clones share the same lock table, so handing a
/// clone to every node of an in-process cluster gives them one lock space.
#[derive(Clone, Debug, Default)]
pub struct MemoryLockManager {
    map: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockManager {
    /// Creates a new instance of `MemoryLockManager`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    type Error = Error;

    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error> {
        if self.map.lock().await.contains(&resource_id) {
            Ok(LockStatus::HeldBySelf)
        } else {
            Ok(LockStatus::Free)
        }
    }

    async fn try_lock(&self, resource_id: String) -> Result<bool, Self::Error> {
        let acquired = self.map.lock().await.insert(resource_id.clone());

        if !acquired {
            debug!("Lock {} is already held", resource_id);
        }

        Ok(acquired)
    }

    async fn release(&self, resource_id: String) -> Result<(), Self::Error> {
        self.map.lock().await.remove(&resource_id);

        Ok(())
    }
}
