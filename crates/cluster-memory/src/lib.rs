//! In-memory implementation of the cluster bus and membership for tests and
//! single-process deployments.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use herald_cluster::{
    ClusterMessage, ClusterMessageHandler, ClusterNode, ClusterRegistry, ClusterTopic,
    MembershipCallback,
};
use herald_core::NodeId;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Decides whether a message from the first node to the second is delivered.
///
/// Returning `false` drops the message. Filters see every message, so they
/// double as a way to observe traffic in tests.
pub type MessageFilter = Arc<dyn Fn(&NodeId, &NodeId, &ClusterMessage) -> bool + Send + Sync>;

enum Envelope {
    Message { from: NodeId, payload: Bytes },
    ServerAdded(NodeId),
    ServerRemoved(NodeId),
}

type HandlerMap = HashMap<ClusterTopic, Vec<Arc<dyn ClusterMessageHandler>>>;

struct Peer {
    node_id: NodeId,
    inbox: mpsc::UnboundedSender<Envelope>,
    handlers: RwLock<HandlerMap>,
    added: RwLock<Vec<MembershipCallback>>,
    removed: RwLock<Vec<MembershipCallback>>,
}

#[derive(Default)]
struct NetworkState {
    members: RwLock<IndexMap<NodeId, Arc<Peer>>>,
    filter: RwLock<Option<MessageFilter>>,
}

/// Hub connecting in-process cluster nodes.
///
/// Every message is encoded to bytes on send and decoded on delivery. Each
/// node delivers messages and membership events in order on its own task.
/// The earliest joined member is the leader.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the network. Existing members are told about it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn join(&self, node_id: impl Into<NodeId>) -> Arc<MemoryClusterNode> {
        let node_id = node_id.into();
        let (inbox, receiver) = mpsc::unbounded_channel();

        let peer = Arc::new(Peer {
            node_id: node_id.clone(),
            inbox,
            handlers: RwLock::new(HashMap::new()),
            added: RwLock::new(Vec::new()),
            removed: RwLock::new(Vec::new()),
        });

        let dispatch = tokio::spawn(dispatch(peer.clone(), receiver));

        let existing: Vec<Arc<Peer>> = {
            let mut members = self.state.members.write();
            let existing = members.values().cloned().collect();
            members.insert(node_id.clone(), peer.clone());
            existing
        };

        for other in existing {
            let _ = other.inbox.send(Envelope::ServerAdded(node_id.clone()));
        }

        info!("Node {} joined the memory network", node_id);

        Arc::new(MemoryClusterNode {
            peer,
            state: self.state.clone(),
            dispatch,
        })
    }

    /// Installs a filter applied to every message.
    pub fn set_message_filter(&self, filter: MessageFilter) {
        *self.state.filter.write() = Some(filter);
    }

    /// Removes the message filter.
    pub fn clear_message_filter(&self) {
        self.state.filter.write().take();
    }

    /// Current members in join order.
    #[must_use]
    pub fn members(&self) -> Vec<NodeId> {
        self.state.members.read().keys().cloned().collect()
    }
}

async fn dispatch(peer: Arc<Peer>, mut receiver: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = receiver.recv().await {
        match envelope {
            Envelope::Message { from, payload } => {
                let message = match ClusterMessage::try_from(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Node {} dropped a message from {}: {}", peer.node_id, from, e);
                        continue;
                    }
                };

                let handlers = peer
                    .handlers
                    .read()
                    .get(&message.topic())
                    .cloned()
                    .unwrap_or_default();

                if handlers.is_empty() {
                    debug!(
                        "Node {} has no handler for {:?} traffic from {}",
                        peer.node_id,
                        message.topic(),
                        from
                    );
                }

                for handler in handlers {
                    handler.handle(&from, message.clone());
                }
            }
            Envelope::ServerAdded(node_id) => {
                let callbacks = peer.added.read().clone();
                for callback in callbacks {
                    callback(&node_id);
                }
            }
            Envelope::ServerRemoved(node_id) => {
                let callbacks = peer.removed.read().clone();
                for callback in callbacks {
                    callback(&node_id);
                }
            }
        }
    }
}

/// A node attached to a [`MemoryNetwork`].
///
/// Implements both the message bus and the membership view.
pub struct MemoryClusterNode {
    peer: Arc<Peer>,
    state: Arc<NetworkState>,
    dispatch: JoinHandle<()>,
}

impl MemoryClusterNode {
    /// Removes this node from the network. Remaining members are told about it
    /// and nothing more is delivered to or from this node.
    pub fn leave(&self) {
        let remaining: Vec<Arc<Peer>> = {
            let mut members = self.state.members.write();
            if members.shift_remove(&self.peer.node_id).is_none() {
                return;
            }
            members.values().cloned().collect()
        };

        for other in remaining {
            let _ = other
                .inbox
                .send(Envelope::ServerRemoved(self.peer.node_id.clone()));
        }

        self.dispatch.abort();

        info!("Node {} left the memory network", self.peer.node_id);
    }

    fn deliver(&self, to: &Peer, message: &ClusterMessage, payload: Bytes) {
        let filter = self.state.filter.read().clone();
        if let Some(filter) = filter {
            if !filter(&self.peer.node_id, &to.node_id, message) {
                debug!(
                    "Dropped {:?} message from {} to {}",
                    message.topic(),
                    self.peer.node_id,
                    to.node_id
                );
                return;
            }
        }

        let _ = to.inbox.send(Envelope::Message {
            from: self.peer.node_id.clone(),
            payload,
        });
    }

    fn encode(message: &ClusterMessage) -> Option<Bytes> {
        match TryInto::<Bytes>::try_into(message.clone()) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("Failed to encode cluster message: {}", e);
                None
            }
        }
    }

    fn is_member(&self) -> bool {
        self.state.members.read().contains_key(&self.peer.node_id)
    }
}

impl ClusterNode for MemoryClusterNode {
    fn node_id(&self) -> &NodeId {
        &self.peer.node_id
    }

    fn subscribe(&self, topic: ClusterTopic, handler: Arc<dyn ClusterMessageHandler>) {
        self.peer
            .handlers
            .write()
            .entry(topic)
            .or_default()
            .push(handler);
    }

    fn send(&self, message: ClusterMessage) {
        if !self.is_member() {
            debug!("Node {} is not a member, dropping broadcast", self.peer.node_id);
            return;
        }

        let Some(payload) = Self::encode(&message) else {
            return;
        };

        let others: Vec<Arc<Peer>> = self
            .state
            .members
            .read()
            .values()
            .filter(|peer| peer.node_id != self.peer.node_id)
            .cloned()
            .collect();

        for other in others {
            self.deliver(&other, &message, payload.clone());
        }
    }

    fn send_direct(&self, to: &NodeId, message: ClusterMessage) {
        if !self.is_member() {
            debug!("Node {} is not a member, dropping message", self.peer.node_id);
            return;
        }

        let Some(target) = self.state.members.read().get(to).cloned() else {
            debug!("Node {} is not a member, dropping message to it", to);
            return;
        };

        if let Some(payload) = Self::encode(&message) {
            self.deliver(&target, &message, payload);
        }
    }
}

impl ClusterRegistry for MemoryClusterNode {
    fn get_all(&self) -> Vec<NodeId> {
        self.state.members.read().keys().cloned().collect()
    }

    fn on_server_added(&self, callback: MembershipCallback) {
        self.peer.added.write().push(callback);
    }

    fn on_server_removed(&self, callback: MembershipCallback) {
        self.peer.removed.write().push(callback);
    }

    fn is_leader(&self) -> bool {
        self.get_leader().as_ref() == Some(&self.peer.node_id)
    }

    fn get_leader(&self) -> Option<NodeId> {
        self.state.members.read().keys().next().cloned()
    }
}

impl Drop for MemoryClusterNode {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}
