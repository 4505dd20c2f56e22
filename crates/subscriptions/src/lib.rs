//! Bookkeeping of which connections subscribe to which names or patterns.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod registry;

pub use registry::{DefaultSubscriptionRegistry, SubscriptionActions};

use std::sync::Arc;

use herald_core::{ConnectionId, ConnectionRef, Message, NodeId};

/// Observer of subscription changes.
///
/// First/last hooks follow cluster-wide presence of a name. The per
/// connection hooks only fire for local connections.
pub trait SubscriptionListener: Send + Sync + 'static {
    /// `name` gained its first subscriber anywhere in the cluster.
    fn on_first_subscription_made(&self, name: &str);

    /// `name` lost its last subscriber anywhere in the cluster.
    fn on_last_subscription_removed(&self, name: &str);

    /// A local connection subscribed to `name`.
    fn on_subscription_made(&self, name: &str, connection: &ConnectionRef);

    /// A local connection unsubscribed from `name` or closed.
    fn on_subscription_removed(&self, name: &str, connection: &ConnectionRef);
}

/// Generic name or pattern subscription registry.
pub trait SubscriptionRegistry: Send + Sync + 'static {
    /// Subscribes a connection. Returns `false` if it was already subscribed.
    fn subscribe(&self, name: &str, connection: &ConnectionRef) -> bool;

    /// Unsubscribes a connection. Returns `false` if it was not subscribed.
    fn unsubscribe(&self, name: &str, connection: &ConnectionRef) -> bool;

    /// Local subscribers of `name`, in subscription order.
    fn get_local_subscribers(&self, name: &str) -> Vec<ConnectionRef>;

    /// Whether `name` has local subscribers.
    fn has_local_subscribers(&self, name: &str) -> bool;

    /// Every name subscribed anywhere in the cluster.
    fn get_names(&self) -> Vec<String>;

    /// Whether `name` is subscribed anywhere in the cluster.
    fn has_name(&self, name: &str) -> bool;

    /// Nodes with subscribers for `name`.
    fn get_all_servers(&self, name: &str) -> Vec<NodeId>;

    /// Sends `message` to every local subscriber of `name` except `exclude`.
    fn send_to_subscribers(&self, name: &str, message: &Message, exclude: Option<ConnectionId>);

    /// Installs the listener. Call once, before subscriptions are made.
    fn set_subscription_listener(&self, listener: Arc<dyn SubscriptionListener>);
}
