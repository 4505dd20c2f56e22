//! Default subscription registry backed by a replicated set.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use herald_core::{Action, CloseHookId, ConnectionId, ConnectionRef, Message, NodeId, Topic};
use herald_state_registry::StateRegistry;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{SubscriptionListener, SubscriptionRegistry};

/// Actions acknowledged by a registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscriptionActions {
    /// Action acknowledged on subscribe.
    pub subscribe: Action,

    /// Action acknowledged on unsubscribe.
    pub unsubscribe: Action,
}

impl SubscriptionActions {
    /// Subscriber bookkeeping.
    pub const SUBSCRIBE: Self = Self {
        subscribe: Action::Subscribe,
        unsubscribe: Action::Unsubscribe,
    };

    /// Provider pattern bookkeeping.
    pub const LISTEN: Self = Self {
        subscribe: Action::Listen,
        unsubscribe: Action::Unlisten,
    };
}

struct ConnectionEntry {
    connection: ConnectionRef,
    names: HashSet<String>,
    close_hook: Option<CloseHookId>,
}

#[derive(Default)]
struct Subscriptions {
    names: HashMap<String, IndexMap<ConnectionId, ConnectionRef>>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

/// Subscription registry whose cluster-wide view of names is a replicated set.
///
/// Each subscribed name holds one local reference in the set per local
/// subscriber. Closing a connection removes all of its subscriptions.
pub struct DefaultSubscriptionRegistry {
    topic: Topic,
    actions: SubscriptionActions,
    cluster_names: StateRegistry,
    state: Mutex<Subscriptions>,
    listener: RwLock<Option<Arc<dyn SubscriptionListener>>>,
    me: Weak<Self>,
}

impl DefaultSubscriptionRegistry {
    /// Creates a registry mirroring its names into `cluster_names`.
    pub fn new(
        topic: Topic,
        actions: SubscriptionActions,
        cluster_names: StateRegistry,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            topic,
            actions,
            cluster_names,
            state: Mutex::new(Subscriptions::default()),
            listener: RwLock::new(None),
            me: me.clone(),
        })
    }

    /// The replicated set holding the cluster-wide names.
    #[must_use]
    pub const fn cluster_names(&self) -> &StateRegistry {
        &self.cluster_names
    }

    /// Names `connection` is subscribed to.
    #[must_use]
    pub fn names_of(&self, connection: ConnectionId) -> Vec<String> {
        self.state
            .lock()
            .connections
            .get(&connection)
            .map(|entry| entry.names.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn listener(&self) -> Option<Arc<dyn SubscriptionListener>> {
        self.listener.read().clone()
    }

    fn watch_close(&self, connection: &ConnectionRef) {
        let me = self.me.clone();
        let hook = connection.on_close(Box::new(move |id| {
            if let Some(registry) = me.upgrade() {
                registry.on_connection_closed(id);
            }
        }));

        let mut state = self.state.lock();
        match state.connections.get_mut(&connection.id()) {
            Some(entry) => entry.close_hook = Some(hook),
            None => {
                drop(state);
                connection.remove_on_close(hook);
            }
        }
    }

    fn on_connection_closed(&self, id: ConnectionId) {
        let (connection, names) = {
            let mut state = self.state.lock();
            let Some(entry) = state.connections.remove(&id) else {
                return;
            };

            for name in &entry.names {
                if let Some(subscribers) = state.names.get_mut(name) {
                    subscribers.shift_remove(&id);
                    if subscribers.is_empty() {
                        state.names.remove(name);
                    }
                }
            }

            (entry.connection, entry.names)
        };

        debug!(
            "{} registry: {} closed with {} subscriptions",
            self.topic,
            id,
            names.len()
        );

        let listener = self.listener();
        for name in names {
            if let Some(listener) = &listener {
                listener.on_subscription_removed(&name, &connection);
            }
            self.cluster_names.remove(&name);
        }
    }
}

impl SubscriptionRegistry for DefaultSubscriptionRegistry {
    fn subscribe(&self, name: &str, connection: &ConnectionRef) -> bool {
        let id = connection.id();

        let first_for_connection = {
            let mut state = self.state.lock();
            let subscribers = state.names.entry(name.to_string()).or_default();

            if subscribers.contains_key(&id) {
                drop(state);
                warn!(
                    "{} registry: repeat {} to {} by {}",
                    self.topic, self.actions.subscribe, name, id
                );
                connection.send_message(Message::error(
                    self.topic,
                    Action::MultipleSubscriptions,
                    name,
                ));
                return false;
            }

            subscribers.insert(id, connection.clone());

            match state.connections.get_mut(&id) {
                Some(entry) => {
                    entry.names.insert(name.to_string());
                    false
                }
                None => {
                    state.connections.insert(
                        id,
                        ConnectionEntry {
                            connection: connection.clone(),
                            names: HashSet::from([name.to_string()]),
                            close_hook: None,
                        },
                    );
                    true
                }
            }
        };

        if first_for_connection {
            self.watch_close(connection);
        }

        self.cluster_names.add(name);

        if let Some(listener) = self.listener() {
            listener.on_subscription_made(name, connection);
        }

        connection.send_ack_message(Message::ack(self.topic, self.actions.subscribe, name));

        debug!("{} registry: {} subscribed to {}", self.topic, id, name);

        true
    }

    fn unsubscribe(&self, name: &str, connection: &ConnectionRef) -> bool {
        let id = connection.id();

        let released_hook = {
            let mut state = self.state.lock();
            let removed = state
                .names
                .get_mut(name)
                .and_then(|subscribers| subscribers.shift_remove(&id));

            if removed.is_none() {
                drop(state);
                warn!(
                    "{} registry: {} from {} by {} which is not subscribed",
                    self.topic, self.actions.unsubscribe, name, id
                );
                connection.send_message(Message::error(self.topic, Action::NotSubscribed, name));
                return false;
            }

            if state.names.get(name).is_some_and(IndexMap::is_empty) {
                state.names.remove(name);
            }

            let now_idle = state.connections.get_mut(&id).is_some_and(|entry| {
                entry.names.remove(name);
                entry.names.is_empty()
            });

            if now_idle {
                state
                    .connections
                    .remove(&id)
                    .and_then(|entry| entry.close_hook)
            } else {
                None
            }
        };

        if let Some(hook) = released_hook {
            connection.remove_on_close(hook);
        }

        if let Some(listener) = self.listener() {
            listener.on_subscription_removed(name, connection);
        }

        self.cluster_names.remove(name);

        connection.send_ack_message(Message::ack(self.topic, self.actions.unsubscribe, name));

        debug!("{} registry: {} unsubscribed from {}", self.topic, id, name);

        true
    }

    fn get_local_subscribers(&self, name: &str) -> Vec<ConnectionRef> {
        self.state
            .lock()
            .names
            .get(name)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn has_local_subscribers(&self, name: &str) -> bool {
        self.state
            .lock()
            .names
            .get(name)
            .is_some_and(|subscribers| !subscribers.is_empty())
    }

    fn get_names(&self) -> Vec<String> {
        self.cluster_names.get_all()
    }

    fn has_name(&self, name: &str) -> bool {
        self.cluster_names.has(name)
    }

    fn get_all_servers(&self, name: &str) -> Vec<NodeId> {
        self.cluster_names.get_all_servers(name)
    }

    fn send_to_subscribers(&self, name: &str, message: &Message, exclude: Option<ConnectionId>) {
        for subscriber in self.get_local_subscribers(name) {
            if Some(subscriber.id()) != exclude {
                subscriber.send_message(message.clone());
            }
        }
    }

    fn set_subscription_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        *self.listener.write() = Some(listener.clone());

        let first = listener.clone();
        self.cluster_names
            .on_add(move |name| first.on_first_subscription_made(name));
        self.cluster_names
            .on_remove(move |name| listener.on_last_subscription_removed(name));
    }
}
