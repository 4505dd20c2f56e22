//! Cluster-wide locks coordinated by the cluster leader.
//!
//! The leader keeps the lock table. Other nodes ask it over the cluster bus
//! and treat a missing answer as a refusal. Locks that are never released
//! expire after the hold timeout.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use herald_cluster::{
    ClusterMessage, ClusterMessageHandler, ClusterNode, ClusterRegistry, ClusterTopic, LockAction,
    LockMessage,
};
use herald_core::{LockConfig, NodeId};
use herald_locks::{LockManager, LockStatus};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the `ClusterLockManager`.
#[derive(Clone)]
pub struct ClusterLockManagerConfig {
    /// Bus used to reach the leader.
    pub cluster: Arc<dyn ClusterNode>,

    /// Membership view used to find the leader.
    pub registry: Arc<dyn ClusterRegistry>,

    /// Request and hold timeouts.
    pub lock: LockConfig,
}

struct Grant {
    holder: NodeId,
    id: u64,
    expiry: JoinHandle<()>,
}

struct Inner {
    node_id: NodeId,
    cluster: Arc<dyn ClusterNode>,
    registry: Arc<dyn ClusterRegistry>,
    config: LockConfig,
    granted: Mutex<HashMap<String, Grant>>,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    next_grant: Mutex<u64>,
}

impl Inner {
    /// Leader side: grants `name` to `holder` unless it is already held.
    fn grant(self: &Arc<Self>, name: &str, holder: NodeId) -> bool {
        let mut granted = self.granted.lock();
        if granted.contains_key(name) {
            return false;
        }

        let id = {
            let mut next = self.next_grant.lock();
            *next += 1;
            *next
        };

        let weak = Arc::downgrade(self);
        let hold_timeout = self.config.hold_timeout;
        let lock_name = name.to_string();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(hold_timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&lock_name, id);
            }
        });

        debug!("Granted lock {} to {}", name, holder);
        granted.insert(name.to_string(), Grant { holder, id, expiry });

        true
    }

    fn expire(&self, name: &str, id: u64) {
        let mut granted = self.granted.lock();
        if granted.get(name).is_some_and(|grant| grant.id == id) {
            if let Some(grant) = granted.remove(name) {
                warn!(
                    "Lock {} held by {} was not released within {:?}, releasing it",
                    name, grant.holder, self.config.hold_timeout
                );
            }
        }
    }

    /// Leader side: releases `name` if `holder` owns it.
    fn release_local(&self, name: &str, holder: &NodeId) {
        let mut granted = self.granted.lock();
        match granted.get(name) {
            Some(grant) if &grant.holder == holder => {
                if let Some(grant) = granted.remove(name) {
                    grant.expiry.abort();
                    debug!("Released lock {} held by {}", name, holder);
                }
            }
            Some(grant) => warn!(
                "Node {} tried to release lock {} held by {}",
                holder, name, grant.holder
            ),
            None => debug!("Lock {} was not held", name),
        }
    }

    fn on_message(self: &Arc<Self>, from: &NodeId, message: LockMessage) {
        match message.action {
            LockAction::Response { locked } => {
                if let Some(waiter) = self.pending.lock().remove(&message.name) {
                    let _ = waiter.send(locked);
                } else {
                    debug!("Late lock response for {} from {}", message.name, from);
                }
            }
            LockAction::Request => {
                if !self.registry.is_leader() {
                    warn!(
                        "Node {} received a lock request for {} from {} but is not the leader",
                        self.node_id, message.name, from
                    );
                    return;
                }

                let locked = self.grant(&message.name, from.clone());
                self.cluster.send_direct(
                    from,
                    ClusterMessage::Lock(LockMessage {
                        name: message.name,
                        action: LockAction::Response { locked },
                    }),
                );
            }
            LockAction::Release => {
                if !self.registry.is_leader() {
                    warn!(
                        "Node {} received a lock release for {} from {} but is not the leader",
                        self.node_id, message.name, from
                    );
                    return;
                }

                self.release_local(&message.name, from);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for grant in self.granted.get_mut().values() {
            grant.expiry.abort();
        }
    }
}

struct LockHandler {
    inner: Weak<Inner>,
}

impl ClusterMessageHandler for LockHandler {
    fn handle(&self, from: &NodeId, message: ClusterMessage) {
        let ClusterMessage::Lock(message) = message else {
            return;
        };

        if let Some(inner) = self.inner.upgrade() {
            inner.on_message(from, message);
        }
    }
}

/// Lock manager where the cluster leader grants locks.
#[derive(Clone)]
pub struct ClusterLockManager {
    inner: Arc<Inner>,
}

impl ClusterLockManager {
    /// Creates a lock manager and subscribes it to lock traffic.
    #[must_use]
    pub fn new(config: ClusterLockManagerConfig) -> Self {
        let node_id = config.cluster.node_id().clone();

        info!("Creating cluster lock manager for node {}", node_id);

        let inner = Arc::new(Inner {
            node_id,
            cluster: config.cluster,
            registry: config.registry,
            config: config.lock,
            granted: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_grant: Mutex::new(0),
        });

        inner.cluster.subscribe(
            ClusterTopic::Lock,
            Arc::new(LockHandler {
                inner: Arc::downgrade(&inner),
            }),
        );

        Self { inner }
    }
}

#[async_trait]
impl LockManager for ClusterLockManager {
    type Error = Error;

    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error> {
        if !self.inner.registry.is_leader() {
            return Err(Error::NotLeader);
        }

        Ok(match self.inner.granted.lock().get(&resource_id) {
            None => LockStatus::Free,
            Some(grant) if grant.holder == self.inner.node_id => LockStatus::HeldBySelf,
            Some(grant) => LockStatus::HeldByOther(grant.holder.to_string()),
        })
    }

    async fn try_lock(&self, resource_id: String) -> Result<bool, Self::Error> {
        if self.inner.registry.is_leader() {
            return Ok(self.inner.grant(&resource_id, self.inner.node_id.clone()));
        }

        let leader = self.inner.registry.get_leader().ok_or(Error::NoLeader)?;

        let receiver = {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&resource_id) {
                debug!("Lock request for {} already in flight", resource_id);
                return Ok(false);
            }
            let (sender, receiver) = oneshot::channel();
            pending.insert(resource_id.clone(), sender);
            receiver
        };

        self.inner.cluster.send_direct(
            &leader,
            ClusterMessage::Lock(LockMessage {
                name: resource_id.clone(),
                action: LockAction::Request,
            }),
        );

        match tokio::time::timeout(self.inner.config.request_timeout, receiver).await {
            Ok(Ok(locked)) => Ok(locked),
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                self.inner.pending.lock().remove(&resource_id);
                warn!(
                    "Lock request for {} to leader {} timed out after {:?}",
                    resource_id, leader, self.inner.config.request_timeout
                );
                Ok(false)
            }
        }
    }

    async fn release(&self, resource_id: String) -> Result<(), Self::Error> {
        if self.inner.registry.is_leader() {
            self.inner.release_local(&resource_id, &self.inner.node_id);
            return Ok(());
        }

        let leader = self.inner.registry.get_leader().ok_or(Error::NoLeader)?;

        self.inner.cluster.send_direct(
            &leader,
            ClusterMessage::Lock(LockMessage {
                name: resource_id,
                action: LockAction::Release,
            }),
        );

        Ok(())
    }
}
