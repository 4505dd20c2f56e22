//! Abstract interfaces for the cluster message bus and cluster membership.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod message;

pub use error::CodecError;
pub use message::{
    ClusterMessage, ClusterTopic, ListenMessage, LockAction, LockMessage, StateAction,
    StateMessage,
};

use std::sync::Arc;

use herald_core::NodeId;

/// Receives cluster messages delivered for a subscribed topic.
///
/// Handlers run on the transport's delivery task and must not block.
pub trait ClusterMessageHandler: Send + Sync + 'static {
    /// Handles a message sent by `from`.
    fn handle(&self, from: &NodeId, message: ClusterMessage);
}

impl<F> ClusterMessageHandler for F
where
    F: Fn(&NodeId, ClusterMessage) + Send + Sync + 'static,
{
    fn handle(&self, from: &NodeId, message: ClusterMessage) {
        self(from, message);
    }
}

/// Message bus connecting this node to its peers.
pub trait ClusterNode: Send + Sync + 'static {
    /// Identity of the local node.
    fn node_id(&self) -> &NodeId;

    /// Registers a handler for messages on `topic` sent by other nodes.
    fn subscribe(&self, topic: ClusterTopic, handler: Arc<dyn ClusterMessageHandler>);

    /// Broadcasts a message to every other node.
    fn send(&self, message: ClusterMessage);

    /// Sends a message to a single node.
    fn send_direct(&self, to: &NodeId, message: ClusterMessage);
}

/// Callback for membership changes.
pub type MembershipCallback = Arc<dyn Fn(&NodeId) + Send + Sync>;

/// View of the current cluster membership.
pub trait ClusterRegistry: Send + Sync + 'static {
    /// All current members, including the local node.
    fn get_all(&self) -> Vec<NodeId>;

    /// Registers a callback run when a node joins.
    fn on_server_added(&self, callback: MembershipCallback);

    /// Registers a callback run when a node leaves.
    fn on_server_removed(&self, callback: MembershipCallback);

    /// Whether the local node is the current leader.
    fn is_leader(&self) -> bool;

    /// The current leader, if any.
    fn get_leader(&self) -> Option<NodeId>;
}
