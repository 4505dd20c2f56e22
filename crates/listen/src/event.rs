//! Inputs processed by the discovery task.

use herald_core::{ConnectionId, ConnectionRef, Message, NodeId};
use tokio::sync::{mpsc, oneshot};

pub type EventSender = mpsc::UnboundedSender<Event>;

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub enum Event {
    /// A provider sent a listen protocol message.
    Message {
        connection: ConnectionRef,
        message: Message,
    },

    /// A local connection subscribed to a name.
    SubscriptionMade {
        name: String,
        connection: ConnectionRef,
    },

    /// A name gained its first subscriber anywhere in the cluster.
    FirstSubscription(String),

    /// A name lost its last subscriber anywhere in the cluster.
    LastSubscriptionRemoved(String),

    /// A local provider stopped listening to a pattern, or closed.
    ProviderRemoved {
        pattern: String,
        connection: ConnectionRef,
    },

    /// An active provider's connection closed.
    ProviderClosed {
        pattern: String,
        connection: ConnectionId,
    },

    /// Some node published a provider for a name.
    ProviderStarted(String),

    /// No node publishes a provider for a name any more.
    ProviderStopped(String),

    ResponseTimeout {
        name: String,
        token: u64,
    },

    LockResult {
        name: String,
        acquired: bool,
    },

    /// A peer ran out of candidates for a name.
    Unsuccessful {
        from: NodeId,
        name: String,
    },

    Flush(oneshot::Sender<()>),

    Shutdown,
}
