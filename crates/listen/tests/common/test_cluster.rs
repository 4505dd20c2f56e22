//! Test cluster utilities for provider discovery tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use herald_cluster::{ClusterMessage, ClusterNode, ListenMessage};
use herald_cluster_memory::{MemoryClusterNode, MemoryNetwork};
use herald_core::test_support::MockConnection;
use herald_core::{Action, ListenConfig, LockConfig, Message, NodeId, StateRegistryConfig, Topic};
use herald_listen::{ListenerRegistry, ListenerRegistryConfig};
use herald_locks::LockManager;
use herald_locks_cluster::{ClusterLockManager, ClusterLockManagerConfig};
use herald_locks_memory::MemoryLockManager;
use herald_state_registry::StateRegistry;
use herald_subscriptions::{DefaultSubscriptionRegistry, SubscriptionActions, SubscriptionRegistry};
use parking_lot::Mutex;

pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

pub const MATCH_COOLDOWN: Duration = Duration::from_secs(1);

pub fn listen_config() -> ListenConfig {
    ListenConfig {
        response_timeout: RESPONSE_TIMEOUT,
        rematch_interval: Duration::from_secs(600),
        shuffle_providers: false,
        match_cooldown: MATCH_COOLDOWN,
    }
}

pub fn state_config() -> StateRegistryConfig {
    StateRegistryConfig {
        check_sum_buffer: Duration::from_millis(10),
        state_reconciliation_timeout: Duration::from_millis(50),
    }
}

/// Lets in-flight messages, lock requests and callbacks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Waits until the current candidate's response timer has fired.
pub async fn time_out() {
    tokio::time::sleep(RESPONSE_TIMEOUT + Duration::from_millis(1)).await;
}

/// A node with subscriber bookkeeping and a listener registry.
pub struct TestNode {
    pub topic: Topic,
    pub node: Arc<MemoryClusterNode>,
    pub subscriptions: Arc<DefaultSubscriptionRegistry>,
    pub listener: ListenerRegistry,
}

impl TestNode {
    fn new<L: LockManager>(
        topic: Topic,
        listen: ListenConfig,
        node: Arc<MemoryClusterNode>,
        lock_manager: L,
    ) -> Self {
        let subscriptions = DefaultSubscriptionRegistry::new(
            topic,
            SubscriptionActions::SUBSCRIBE,
            StateRegistry::new(
                topic.profile().subscriptions,
                state_config(),
                node.clone(),
                &*node,
            ),
        );

        let listener = ListenerRegistry::new(ListenerRegistryConfig {
            topic,
            listen,
            state_registry: state_config(),
            cluster: node.clone(),
            registry: node.clone(),
            subscriptions: subscriptions.clone(),
            lock_manager,
        });

        Self {
            topic,
            node,
            subscriptions,
            listener,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node.node_id().clone()
    }

    /// A new connection subscribed to `name`.
    pub fn subscribe(&self, name: &str) -> Arc<MockConnection> {
        let connection = MockConnection::new();
        self.subscribe_with(&connection, name);
        connection
    }

    pub fn subscribe_with(&self, connection: &Arc<MockConnection>, name: &str) {
        self.subscriptions.subscribe(name, &connection.handle());
    }

    pub fn unsubscribe(&self, connection: &Arc<MockConnection>, name: &str) {
        self.subscriptions.unsubscribe(name, &connection.handle());
    }

    /// A new provider connection listening to `pattern`.
    pub fn listen(&self, pattern: &str) -> Arc<MockConnection> {
        let connection = MockConnection::new();
        self.listen_with(&connection, pattern);
        connection
    }

    pub fn listen_with(&self, connection: &Arc<MockConnection>, pattern: &str) {
        self.send(connection, Message::new(self.topic, Action::Listen, pattern));
    }

    pub fn unlisten(&self, connection: &Arc<MockConnection>, pattern: &str) {
        self.send(connection, Message::new(self.topic, Action::Unlisten, pattern));
    }

    pub fn accept(&self, connection: &Arc<MockConnection>, pattern: &str, name: &str) {
        self.send(
            connection,
            Message::listen(self.topic, Action::ListenAccept, pattern, name),
        );
    }

    pub fn reject(&self, connection: &Arc<MockConnection>, pattern: &str, name: &str) {
        self.send(
            connection,
            Message::listen(self.topic, Action::ListenReject, pattern, name),
        );
    }

    fn send(&self, connection: &Arc<MockConnection>, message: Message) {
        self.listener.handle(&connection.handle(), message);
    }
}

pub struct TestCluster {
    pub network: MemoryNetwork,
    pub nodes: Vec<TestNode>,
    unsuccessful: Arc<Mutex<Vec<(NodeId, NodeId, String)>>>,
}

impl TestCluster {
    /// Record topic, one shared in-memory lock table.
    pub fn new(count: usize) -> Self {
        Self::with_options(count, Topic::Record, listen_config())
    }

    pub fn with_options(count: usize, topic: Topic, listen: ListenConfig) -> Self {
        let locks = MemoryLockManager::new();
        Self::build(count, topic, listen, |_| locks.clone())
    }

    /// Record topic, locks coordinated by the cluster leader.
    pub fn with_cluster_locks(count: usize) -> Self {
        Self::build(count, Topic::Record, listen_config(), |node| {
            ClusterLockManager::new(ClusterLockManagerConfig {
                cluster: node.clone(),
                registry: node.clone(),
                lock: LockConfig::default(),
            })
        })
    }

    /// Record topic, `locks` cloned to every node.
    pub fn with_lock_manager<L: LockManager>(count: usize, locks: L) -> Self {
        Self::build(count, Topic::Record, listen_config(), |_| locks.clone())
    }

    fn build<F, L>(count: usize, topic: Topic, listen: ListenConfig, locks: F) -> Self
    where
        F: Fn(&Arc<MemoryClusterNode>) -> L,
        L: LockManager,
    {
        let network = MemoryNetwork::new();
        let unsuccessful = Arc::new(Mutex::new(Vec::new()));

        let log = unsuccessful.clone();
        network.set_message_filter(Arc::new(
            move |from: &NodeId, to: &NodeId, message: &ClusterMessage| {
                if let ClusterMessage::Listen(ListenMessage::Unsuccessful { name, .. }) = message {
                    log.lock().push((from.clone(), to.clone(), name.clone()));
                }
                true
            },
        ));

        let nodes = (0..count)
            .map(|index| {
                let node = network.join(format!("n{index}"));
                let lock_manager = locks(&node);
                TestNode::new(topic, listen.clone(), node, lock_manager)
            })
            .collect();

        Self {
            network,
            nodes,
            unsuccessful,
        }
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub async fn when_ready(&self) {
        for node in &self.nodes {
            tokio::time::timeout(Duration::from_secs(5), node.listener.when_ready())
                .await
                .expect("listener registry never became ready");
        }
        settle().await;
    }

    /// LISTEN_UNSUCCESSFUL broadcasts for `name` sent by node `from`, counted
    /// at one receiving peer.
    pub fn unsuccessful_broadcasts(&self, from: usize, name: &str) -> usize {
        let sender = self.nodes[from].node_id();
        let Some(witness) = self
            .nodes
            .iter()
            .map(TestNode::node_id)
            .find(|node| node != &sender)
        else {
            return 0;
        };

        self.unsuccessful
            .lock()
            .iter()
            .filter(|(seen_from, seen_to, seen_name)| {
                seen_from == &sender && seen_to == &witness && seen_name == name
            })
            .count()
    }
}
