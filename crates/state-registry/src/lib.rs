//! Eventually consistent set of names replicated across the cluster.
//!
//! Every node keeps a merged view of which nodes assert which names. Changes
//! are broadcast as they happen and each node periodically publishes a
//! checksum of the names it asserts. A node whose view disagrees with a
//! checksum asks the sender for its full state, which repairs lost or
//! reordered updates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod entry;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use entry::Entry;
use herald_cluster::{
    ClusterMessage, ClusterMessageHandler, ClusterNode, ClusterRegistry, ClusterTopic,
    StateAction, StateMessage,
};
use herald_core::{NodeId, StateRegistryConfig, StateRegistryTopic};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Callback run when a name appears in or disappears from the cluster.
pub type StateCallback = Arc<dyn Fn(&str) + Send + Sync>;

enum ChecksumWaiter {
    Broadcast,
    Verify { remote: i64 },
}

struct PendingChecksum {
    waiters: Vec<ChecksumWaiter>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Entry>,
    pending_checksums: HashMap<NodeId, PendingChecksum>,
    reconciliations: HashMap<NodeId, JoinHandle<()>>,
    full_state_sent: HashMap<NodeId, Instant>,
    awaiting: HashSet<NodeId>,
}

impl RegistryState {
    fn names_of(&self, node: &NodeId) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.nodes.contains(node))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn checksum_total(&self, node: &NodeId) -> i64 {
        self.entries
            .values()
            .filter(|entry| entry.nodes.contains(node))
            .map(|entry| i64::from(entry.checksum))
            .sum()
    }

    fn cancel_reconciliation(&mut self, node: &NodeId) {
        if let Some(timer) = self.reconciliations.remove(node) {
            timer.abort();
        }
    }
}

enum Transition {
    Added(String),
    Removed(String),
}

enum Outgoing {
    Broadcast(StateAction),
    Direct(NodeId, StateAction),
}

/// Work collected under the state lock and carried out after releasing it.
#[derive(Default)]
struct Effects {
    transitions: Vec<Transition>,
    outgoing: Vec<Outgoing>,
}

impl Effects {
    fn broadcast(&mut self, action: StateAction) {
        self.outgoing.push(Outgoing::Broadcast(action));
    }

    fn direct(&mut self, node: &NodeId, action: StateAction) {
        self.outgoing.push(Outgoing::Direct(node.clone(), action));
    }
}

struct Inner {
    topic: StateRegistryTopic,
    node_id: NodeId,
    config: StateRegistryConfig,
    cluster: Arc<dyn ClusterNode>,
    state: Mutex<RegistryState>,
    on_add: RwLock<Vec<StateCallback>>,
    on_remove: RwLock<Vec<StateCallback>>,
    ready: watch::Sender<bool>,
}

impl Inner {
    fn add(self: &Arc<Self>, name: &str) {
        let mut effects = Effects::default();

        {
            let mut state = self.state.lock();
            let entry = state
                .entries
                .entry(name.to_string())
                .or_insert_with(|| Entry::new(name));

            if entry.nodes.contains(&self.node_id) {
                entry.local_count += 1;
                return;
            }

            entry.local_count = 1;
            if entry.nodes.is_empty() {
                effects.transitions.push(Transition::Added(name.to_string()));
            }
            entry.nodes.insert(self.node_id.clone());

            effects.broadcast(StateAction::Add {
                name: name.to_string(),
            });
            self.schedule_checksum(&mut state, self.node_id.clone(), ChecksumWaiter::Broadcast);
        }

        self.apply(effects);
    }

    fn remove(self: &Arc<Self>, name: &str) {
        let mut effects = Effects::default();

        {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(name) else {
                debug!("{} registry: {} is not registered", self.topic, name);
                return;
            };

            if !entry.nodes.contains(&self.node_id) {
                debug!("{} registry: {} is not claimed locally", self.topic, name);
                return;
            }

            entry.local_count = entry.local_count.saturating_sub(1);
            if entry.local_count > 0 {
                return;
            }

            let node_id = self.node_id.clone();
            Self::remove_from_server(&mut state, name, &node_id, &mut effects);

            effects.broadcast(StateAction::Remove {
                name: name.to_string(),
            });
            self.schedule_checksum(&mut state, node_id, ChecksumWaiter::Broadcast);
        }

        self.apply(effects);
    }

    fn add_to_server(state: &mut RegistryState, name: &str, node: &NodeId, effects: &mut Effects) {
        let entry = state
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Entry::new(name));

        if entry.nodes.is_empty() {
            effects.transitions.push(Transition::Added(name.to_string()));
        }
        entry.nodes.insert(node.clone());
    }

    fn remove_from_server(
        state: &mut RegistryState,
        name: &str,
        node: &NodeId,
        effects: &mut Effects,
    ) {
        let Some(entry) = state.entries.get_mut(name) else {
            return;
        };

        if entry.nodes.remove(node) && entry.nodes.is_empty() {
            state.entries.remove(name);
            effects.transitions.push(Transition::Removed(name.to_string()));
        }
    }

    fn remove_node(state: &mut RegistryState, node: &NodeId, effects: &mut Effects) {
        for name in state.names_of(node) {
            Self::remove_from_server(state, &name, node, effects);
        }
    }

    /// Coalesces checksum work for `node` into one computation after the
    /// debounce window.
    fn schedule_checksum(self: &Arc<Self>, state: &mut RegistryState, node: NodeId, waiter: ChecksumWaiter) {
        if let Some(pending) = state.pending_checksums.get_mut(&node) {
            pending.waiters.push(waiter);
            return;
        }

        let weak = Arc::downgrade(self);
        let buffer = self.config.check_sum_buffer;
        let target = node.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(buffer).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_checksum(&target);
            }
        });

        state.pending_checksums.insert(
            node,
            PendingChecksum {
                waiters: vec![waiter],
                timer,
            },
        );
    }

    fn flush_checksum(self: &Arc<Self>, node: &NodeId) {
        let mut effects = Effects::default();

        {
            let mut state = self.state.lock();
            let Some(pending) = state.pending_checksums.remove(node) else {
                return;
            };

            let total = state.checksum_total(node);
            let mut broadcast = false;
            let mut verdict = None;

            for waiter in pending.waiters {
                match waiter {
                    ChecksumWaiter::Broadcast => broadcast = true,
                    ChecksumWaiter::Verify { remote } => verdict = Some(remote == total),
                }
            }

            if broadcast {
                effects.broadcast(StateAction::Checksum { checksum: total });
            }

            match verdict {
                Some(true) => state.cancel_reconciliation(node),
                Some(false) => self.schedule_reconciliation(&mut state, node),
                None => {}
            }
        }

        self.apply(effects);
    }

    fn schedule_reconciliation(self: &Arc<Self>, state: &mut RegistryState, node: &NodeId) {
        if state.reconciliations.contains_key(node) {
            return;
        }

        debug!(
            "{} registry: checksum mismatch with {}, requesting full state in {:?}",
            self.topic, node, self.config.state_reconciliation_timeout
        );

        let weak = Arc::downgrade(self);
        let delay = self.config.state_reconciliation_timeout;
        let target = node.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.request_full_state(&target);
            }
        });

        state.reconciliations.insert(node.clone(), timer);
    }

    fn request_full_state(&self, node: &NodeId) {
        if self.state.lock().reconciliations.remove(node).is_none() {
            return;
        }

        self.send_direct(node, StateAction::RequestFullState);
    }

    fn handle(self: &Arc<Self>, from: &NodeId, action: StateAction) {
        if from == &self.node_id {
            return;
        }

        let mut effects = Effects::default();

        {
            let mut state = self.state.lock();
            state.cancel_reconciliation(from);

            match action {
                StateAction::Add { name } => {
                    Self::add_to_server(&mut state, &name, from, &mut effects);
                }
                StateAction::Remove { name } => {
                    Self::remove_from_server(&mut state, &name, from, &mut effects);
                }
                StateAction::Checksum { checksum } => {
                    self.schedule_checksum(
                        &mut state,
                        from.clone(),
                        ChecksumWaiter::Verify { remote: checksum },
                    );
                }
                StateAction::RequestFullState => {
                    self.answer_full_state_request(&mut state, from, &mut effects);
                }
                StateAction::FullState { names } => {
                    Self::apply_full_state(&mut state, from, names, &mut effects);
                }
            }
        }

        self.apply(effects);
        self.check_ready();
    }

    fn answer_full_state_request(&self, state: &mut RegistryState, from: &NodeId, effects: &mut Effects) {
        let now = Instant::now();
        let recently_sent = state.full_state_sent.get(from).is_some_and(|sent| {
            now.duration_since(*sent) < self.config.state_reconciliation_timeout
        });

        if recently_sent {
            debug!(
                "{} registry: ignoring a request for full state from {}, it was sent recently",
                self.topic, from
            );
        } else {
            state.full_state_sent.insert(from.clone(), now);
            effects.direct(
                from,
                StateAction::FullState {
                    names: state.names_of(&self.node_id),
                },
            );
        }

        // The requester's registry is evidently up; ask again if its answer is
        // still outstanding.
        if state.awaiting.contains(from) {
            effects.direct(from, StateAction::RequestFullState);
        }
    }

    fn apply_full_state(
        state: &mut RegistryState,
        from: &NodeId,
        names: Vec<String>,
        effects: &mut Effects,
    ) {
        let incoming: HashSet<&str> = names.iter().map(String::as_str).collect();
        let stale: Vec<String> = state
            .names_of(from)
            .into_iter()
            .filter(|name| !incoming.contains(name.as_str()))
            .collect();

        for name in stale {
            Self::remove_from_server(state, &name, from, effects);
        }

        for name in &names {
            Self::add_to_server(state, name, from, effects);
        }

        state.awaiting.remove(from);
    }

    fn server_added(&self, node: &NodeId) {
        if node == &self.node_id {
            return;
        }

        debug!("{} registry: {} joined, requesting its state", self.topic, node);
        self.send_direct(node, StateAction::RequestFullState);
    }

    fn server_removed(&self, node: &NodeId) {
        if node == &self.node_id {
            return;
        }

        let mut effects = Effects::default();

        {
            let mut state = self.state.lock();
            Self::remove_node(&mut state, node, &mut effects);
            state.cancel_reconciliation(node);
            if let Some(pending) = state.pending_checksums.remove(node) {
                pending.timer.abort();
            }
            state.full_state_sent.remove(node);
            state.awaiting.remove(node);
        }

        debug!(
            "{} registry: {} left, dropped {} names",
            self.topic,
            node,
            effects.transitions.len()
        );

        self.apply(effects);
        self.check_ready();
    }

    fn check_ready(&self) {
        if !self.state.lock().awaiting.is_empty() {
            return;
        }

        let became_ready = self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });

        if became_ready {
            info!("{} registry on {} is ready", self.topic, self.node_id);
        }
    }

    fn send_direct(&self, node: &NodeId, action: StateAction) {
        self.cluster.send_direct(
            node,
            ClusterMessage::State(StateMessage {
                registry: self.topic,
                action,
            }),
        );
    }

    fn apply(&self, effects: Effects) {
        for outgoing in effects.outgoing {
            match outgoing {
                Outgoing::Broadcast(action) => self.cluster.send(ClusterMessage::State(StateMessage {
                    registry: self.topic,
                    action,
                })),
                Outgoing::Direct(node, action) => self.send_direct(&node, action),
            }
        }

        if effects.transitions.is_empty() {
            return;
        }

        let on_add = self.on_add.read().clone();
        let on_remove = self.on_remove.read().clone();

        for transition in effects.transitions {
            match transition {
                Transition::Added(name) => {
                    for callback in &on_add {
                        callback(&name);
                    }
                }
                Transition::Removed(name) => {
                    for callback in &on_remove {
                        callback(&name);
                    }
                }
            }
        }
    }

    fn abort_timers(state: &mut RegistryState) {
        for (_, pending) in state.pending_checksums.drain() {
            pending.timer.abort();
        }
        for (_, timer) in state.reconciliations.drain() {
            timer.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        Self::abort_timers(self.state.get_mut());
    }
}

struct StateHandler {
    inner: Weak<Inner>,
}

impl ClusterMessageHandler for StateHandler {
    fn handle(&self, from: &NodeId, message: ClusterMessage) {
        let ClusterMessage::State(message) = message else {
            return;
        };

        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        if message.registry == inner.topic {
            inner.handle(from, message.action);
        }
    }
}

/// A replicated set of names.
///
/// Cloning yields another handle to the same set.
#[derive(Clone)]
pub struct StateRegistry {
    inner: Arc<Inner>,
}

impl StateRegistry {
    /// Creates the set, subscribes to its traffic and asks every current
    /// member for its state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        topic: StateRegistryTopic,
        config: StateRegistryConfig,
        cluster: Arc<dyn ClusterNode>,
        registry: &dyn ClusterRegistry,
    ) -> Self {
        let node_id = cluster.node_id().clone();
        let (ready, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            topic,
            node_id: node_id.clone(),
            config,
            cluster: cluster.clone(),
            state: Mutex::new(RegistryState::default()),
            on_add: RwLock::new(Vec::new()),
            on_remove: RwLock::new(Vec::new()),
            ready,
        });

        cluster.subscribe(
            ClusterTopic::StateRegistry,
            Arc::new(StateHandler {
                inner: Arc::downgrade(&inner),
            }),
        );

        let weak = Arc::downgrade(&inner);
        registry.on_server_added(Arc::new(move |node: &NodeId| {
            if let Some(inner) = weak.upgrade() {
                inner.server_added(node);
            }
        }));

        let weak = Arc::downgrade(&inner);
        registry.on_server_removed(Arc::new(move |node: &NodeId| {
            if let Some(inner) = weak.upgrade() {
                inner.server_removed(node);
            }
        }));

        let peers: Vec<NodeId> = registry
            .get_all()
            .into_iter()
            .filter(|node| node != &node_id)
            .collect();

        info!(
            "Creating {} registry on {} with {} peers",
            topic,
            node_id,
            peers.len()
        );

        inner.state.lock().awaiting = peers.iter().cloned().collect();

        for peer in &peers {
            inner.send_direct(peer, StateAction::RequestFullState);
        }

        inner.check_ready();

        Self { inner }
    }

    /// The set this registry replicates.
    #[must_use]
    pub fn topic(&self) -> StateRegistryTopic {
        self.inner.topic
    }

    /// Claims `name` for this node, or bumps its local reference count if
    /// already claimed.
    pub fn add(&self, name: &str) {
        self.inner.add(name);
    }

    /// Drops one local reference to `name`. The last reference un-claims it.
    pub fn remove(&self, name: &str) {
        self.inner.remove(name);
    }

    /// Whether any node claims `name`.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.inner.state.lock().entries.contains_key(name)
    }

    /// Every name claimed by any node.
    #[must_use]
    pub fn get_all(&self) -> Vec<String> {
        self.inner.state.lock().entries.keys().cloned().collect()
    }

    /// Every name claimed by `node`.
    #[must_use]
    pub fn get_all_for(&self, node: &NodeId) -> Vec<String> {
        self.inner.state.lock().names_of(node)
    }

    /// Every node claiming `name`.
    #[must_use]
    pub fn get_all_servers(&self, name: &str) -> Vec<NodeId> {
        self.inner
            .state
            .lock()
            .entries
            .get(name)
            .map(|entry| entry.nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers a callback for names appearing cluster-wide.
    pub fn on_add<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.on_add.write().push(Arc::new(callback));
    }

    /// Registers a callback for names disappearing cluster-wide.
    pub fn on_remove<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.on_remove.write().push(Arc::new(callback));
    }

    /// Removes every name attributed to a remote `node`, as when it leaves
    /// the cluster.
    pub fn remove_all(&self, node: &NodeId) {
        if node == &self.inner.node_id {
            warn!(
                "{} registry: refusing to drop the local node's names wholesale",
                self.inner.topic
            );
            return;
        }

        let mut effects = Effects::default();
        Inner::remove_node(&mut self.inner.state.lock(), node, &mut effects);
        self.inner.apply(effects);
    }

    /// Whether the initial state exchange has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Resolves once every node that was a member at construction has sent
    /// its state or left.
    pub async fn when_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Cancels pending checksum and reconciliation work.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        Inner::abort_timers(&mut state);
        state.full_state_sent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use herald_cluster_memory::MemoryNetwork;

    fn single_node() -> StateRegistry {
        let network = MemoryNetwork::new();
        let node = network.join("solo");

        StateRegistry::new(
            StateRegistryTopic::Custom(1),
            StateRegistryConfig::default(),
            node.clone(),
            &*node,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_is_ready_immediately() {
        let registry = single_node();

        assert!(registry.is_ready());
        tokio::time::timeout(Duration::from_millis(10), registry.when_ready())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_then_remove_restores_absence() {
        let registry = single_node();

        registry.add("a/1");
        assert!(registry.has("a/1"));

        registry.remove("a/1");
        assert!(!registry.has("a/1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_reference_count() {
        let registry = single_node();

        registry.add("a/1");
        registry.add("a/1");
        registry.remove("a/1");
        assert!(registry.has("a/1"));

        registry.remove("a/1");
        assert!(!registry.has("a/1"));

        // Removing an unclaimed name is a no-op.
        registry.remove("a/1");
        assert!(!registry.has("a/1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callbacks_fire_on_transitions_only() {
        let registry = single_node();
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));

        let counter = added.clone();
        registry.on_add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = removed.clone();
        registry.on_remove(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.add("x");
        registry.add("x");
        registry.remove("x");
        registry.remove("x");

        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callbacks_may_reenter() {
        let registry = single_node();
        let seen = Arc::new(AtomicUsize::new(0));

        let handle = registry.clone();
        let counter = seen.clone();
        registry.on_add(move |name| {
            if handle.has(name) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        registry.add("x");

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
