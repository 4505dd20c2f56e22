//! Test cluster utilities for replicated set tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use herald_cluster::{ClusterMessage, StateAction, StateMessage};
use herald_cluster_memory::{MemoryClusterNode, MemoryNetwork};
use herald_core::{NodeId, StateRegistryConfig, StateRegistryTopic};
use herald_state_registry::StateRegistry;
use parking_lot::Mutex;

pub const TOPIC: StateRegistryTopic = StateRegistryTopic::Custom(7);

pub const CHECK_SUM_BUFFER: Duration = Duration::from_millis(10);

pub const RECONCILIATION_TIMEOUT: Duration = Duration::from_millis(50);

pub fn config() -> StateRegistryConfig {
    StateRegistryConfig {
        check_sum_buffer: CHECK_SUM_BUFFER,
        state_reconciliation_timeout: RECONCILIATION_TIMEOUT,
    }
}

/// Lets in-flight messages and callbacks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Waits long enough for a checksum mismatch to be detected and repaired.
pub async fn reconcile() {
    tokio::time::sleep(CHECK_SUM_BUFFER * 4 + RECONCILIATION_TIMEOUT * 2).await;
}

/// A state action seen on the wire.
#[derive(Clone, Debug)]
pub struct Observed {
    pub from: NodeId,
    pub to: NodeId,
    pub action: StateAction,
}

pub struct TestCluster {
    pub network: MemoryNetwork,
    pub nodes: Vec<Arc<MemoryClusterNode>>,
    pub registries: Vec<StateRegistry>,
    observed: Arc<Mutex<Vec<Observed>>>,
    dropping: Arc<Mutex<Option<Box<dyn Fn(&Observed) -> bool + Send>>>>,
}

impl TestCluster {
    /// Joins `count` nodes named n0, n1, ... and builds a registry on each.
    pub fn new(count: usize) -> Self {
        let network = MemoryNetwork::new();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let dropping: Arc<Mutex<Option<Box<dyn Fn(&Observed) -> bool + Send>>>> =
            Arc::new(Mutex::new(None));

        let log = observed.clone();
        let drop_rule = dropping.clone();
        network.set_message_filter(Arc::new(
            move |from: &NodeId, to: &NodeId, message: &ClusterMessage| {
                let ClusterMessage::State(StateMessage { action, .. }) = message else {
                    return true;
                };

                let seen = Observed {
                    from: from.clone(),
                    to: to.clone(),
                    action: action.clone(),
                };

                let dropped = drop_rule.lock().as_ref().is_some_and(|rule| rule(&seen));
                if !dropped {
                    log.lock().push(seen);
                }
                !dropped
            },
        ));

        let nodes: Vec<Arc<MemoryClusterNode>> = (0..count)
            .map(|index| network.join(format!("n{index}")))
            .collect();

        let registries = nodes
            .iter()
            .map(|node| StateRegistry::new(TOPIC, config(), node.clone(), &**node))
            .collect();

        Self {
            network,
            nodes,
            registries,
            observed,
            dropping,
        }
    }

    /// Adds a node to a running cluster.
    pub fn add_node(&mut self) -> StateRegistry {
        let node = self.network.join(format!("n{}", self.nodes.len()));
        let registry = StateRegistry::new(TOPIC, config(), node.clone(), &*node);

        self.nodes.push(node);
        self.registries.push(registry.clone());
        registry
    }

    pub fn registry(&self, index: usize) -> &StateRegistry {
        &self.registries[index]
    }

    pub fn node_id(&self, index: usize) -> NodeId {
        NodeId::new(format!("n{index}"))
    }

    pub async fn when_ready(&self) {
        for registry in &self.registries {
            tokio::time::timeout(Duration::from_secs(5), registry.when_ready())
                .await
                .expect("registry never became ready");
        }
        settle().await;
    }

    /// Drops every delivered state message matching `rule` until cleared.
    pub fn drop_matching<F>(&self, rule: F)
    where
        F: Fn(&Observed) -> bool + Send + 'static,
    {
        *self.dropping.lock() = Some(Box::new(rule));
    }

    pub fn stop_dropping(&self) {
        self.dropping.lock().take();
    }

    pub fn clear_observed(&self) {
        self.observed.lock().clear();
    }

    /// Delivered full-state requests from `from` to `to`.
    pub fn full_state_requests(&self, from: usize, to: usize) -> usize {
        let (from, to) = (self.node_id(from), self.node_id(to));
        self.observed
            .lock()
            .iter()
            .filter(|seen| {
                seen.from == from
                    && seen.to == to
                    && matches!(seen.action, StateAction::RequestFullState)
            })
            .count()
    }

    pub fn observed(&self) -> Vec<Observed> {
        self.observed.lock().clone()
    }
}

/// Counts callback invocations on a registry.
#[derive(Clone, Default)]
pub struct Transitions {
    pub added: Arc<AtomicUsize>,
    pub removed: Arc<AtomicUsize>,
}

impl Transitions {
    pub fn watch(registry: &StateRegistry) -> Self {
        let transitions = Self::default();

        let added = transitions.added.clone();
        registry.on_add(move |_| {
            added.fetch_add(1, Ordering::SeqCst);
        });
        let removed = transitions.removed.clone();
        registry.on_remove(move |_| {
            removed.fetch_add(1, Ordering::SeqCst);
        });

        transitions
    }

    pub fn added(&self) -> usize {
        self.added.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}
