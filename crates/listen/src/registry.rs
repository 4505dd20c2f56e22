//! Public handle of the discovery task and the wiring of its inputs.

use std::sync::Arc;
use std::time::Duration;

use herald_cluster::{ClusterMessage, ClusterNode, ClusterRegistry, ClusterTopic, ListenMessage};
use herald_core::{
    ConnectionRef, ListenConfig, Message, NodeId, StateRegistryConfig, Topic,
};
use herald_locks::LockManager;
use herald_state_registry::StateRegistry;
use herald_subscriptions::{
    DefaultSubscriptionRegistry, SubscriptionActions, SubscriptionListener, SubscriptionRegistry,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::Error;
use crate::actor::{self, Listener};
use crate::event::{Event, EventSender};

/// Shortest accepted rematch interval. Shorter intervals disable rematching.
pub const MIN_REMATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a [`ListenerRegistry`] needs.
pub struct ListenerRegistryConfig<L>
where
    L: LockManager,
{
    /// Topic whose names are provided.
    pub topic: Topic,

    /// Discovery settings.
    pub listen: ListenConfig,

    /// Settings of the replicated sets the registry creates.
    pub state_registry: StateRegistryConfig,

    /// Cluster message bus.
    pub cluster: Arc<dyn ClusterNode>,

    /// Cluster membership.
    pub registry: Arc<dyn ClusterRegistry>,

    /// Subscriber bookkeeping of the topic. The listener registry installs
    /// itself as its subscription listener.
    pub subscriptions: Arc<dyn SubscriptionRegistry>,

    /// Lock service guarding discovery rounds.
    pub lock_manager: L,
}

/// Elects one active provider per subscribed name.
///
/// All state lives in a single task; the handle only forwards messages.
/// Dropping the handle stops the task like [`shutdown`](Self::shutdown).
pub struct ListenerRegistry {
    topic: Topic,
    events: EventSender,
    providers: Arc<DefaultSubscriptionRegistry>,
    published: StateRegistry,
    actor: JoinHandle<()>,
}

impl ListenerRegistry {
    /// Creates the registry and starts its task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<L>(config: ListenerRegistryConfig<L>) -> Self
    where
        L: LockManager,
    {
        let ListenerRegistryConfig {
            topic,
            listen,
            state_registry,
            cluster,
            registry,
            subscriptions,
            lock_manager,
        } = config;

        let profile = topic.profile();

        let providers = DefaultSubscriptionRegistry::new(
            topic,
            SubscriptionActions::LISTEN,
            StateRegistry::new(
                profile.listen_patterns,
                state_registry.clone(),
                cluster.clone(),
                registry.as_ref(),
            ),
        );

        let published = StateRegistry::new(
            profile.published_subscriptions,
            state_registry,
            cluster.clone(),
            registry.as_ref(),
        );

        let (listener, receiver) = Listener::new(
            profile,
            listen,
            cluster.clone(),
            providers.clone(),
            subscriptions.clone(),
            published.clone(),
            lock_manager,
        );
        let events = listener.sender();

        providers.set_subscription_listener(Arc::new(ProviderHooks {
            events: events.clone(),
        }));
        subscriptions.set_subscription_listener(Arc::new(SubscriberHooks {
            events: events.clone(),
        }));

        let started = events.clone();
        published.on_add(move |name: &str| {
            let _ = started.send(Event::ProviderStarted(name.to_string()));
        });
        let stopped = events.clone();
        published.on_remove(move |name: &str| {
            let _ = stopped.send(Event::ProviderStopped(name.to_string()));
        });

        let unsuccessful = events.clone();
        cluster.subscribe(
            ClusterTopic::Listen,
            Arc::new(move |from: &NodeId, message: ClusterMessage| {
                let ClusterMessage::Listen(ListenMessage::Unsuccessful {
                    topic: message_topic,
                    name,
                }) = message
                else {
                    return;
                };

                if message_topic == topic {
                    let _ = unsuccessful.send(Event::Unsuccessful {
                        from: from.clone(),
                        name,
                    });
                }
            }),
        );

        let actor = tokio::spawn(actor::run(listener, receiver));

        info!("Created {} listener registry on {}", topic, cluster.node_id());

        Self {
            topic,
            events,
            providers,
            published,
            actor,
        }
    }

    /// Topic whose names this registry provides.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }

    /// Handles a LISTEN, UNLISTEN, LISTEN_ACCEPT or LISTEN_REJECT message
    /// from a provider connection.
    pub fn handle(&self, connection: &ConnectionRef, message: Message) {
        let event = Event::Message {
            connection: connection.clone(),
            message,
        };

        if self.events.send(event).is_err() {
            warn!(
                "{} listener registry has stopped, dropping message from {}",
                self.topic,
                connection.id()
            );
        }
    }

    /// Whether any node in the cluster has an active provider for `name`.
    #[must_use]
    pub fn has_active_provider(&self, name: &str) -> bool {
        self.published.has(name)
    }

    /// Whether any node in the cluster has a provider listening to `pattern`.
    #[must_use]
    pub fn has_pattern(&self, pattern: &str) -> bool {
        self.providers.has_name(pattern)
    }

    /// Resolves once the replicated sets owned by this registry have
    /// received the state of every peer.
    pub async fn when_ready(&self) {
        self.providers.cluster_names().when_ready().await;
        self.published.when_ready().await;
    }

    /// Resolves once every event sent before this call has been handled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] if the registry has shut down.
    pub async fn flush(&self) -> Result<(), Error> {
        let (done, finished) = oneshot::channel();

        self.events
            .send(Event::Flush(done))
            .map_err(|_| Error::Stopped)?;

        finished.await.map_err(|_| Error::Stopped)
    }

    /// Stops the registry. Rounds in progress are abandoned and their locks
    /// released.
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        // Let the task wind down so the locks of running rounds are released.
        if self.events.send(Event::Shutdown).is_err() {
            self.actor.abort();
        }
    }
}

/// Feeds subscriber bookkeeping changes into the discovery task.
struct SubscriberHooks {
    events: EventSender,
}

impl SubscriptionListener for SubscriberHooks {
    fn on_first_subscription_made(&self, name: &str) {
        let _ = self.events.send(Event::FirstSubscription(name.to_string()));
    }

    fn on_last_subscription_removed(&self, name: &str) {
        let _ = self
            .events
            .send(Event::LastSubscriptionRemoved(name.to_string()));
    }

    fn on_subscription_made(&self, name: &str, connection: &ConnectionRef) {
        let _ = self.events.send(Event::SubscriptionMade {
            name: name.to_string(),
            connection: connection.clone(),
        });
    }

    fn on_subscription_removed(&self, _name: &str, _connection: &ConnectionRef) {}
}

/// Feeds provider pattern removals into the discovery task.
struct ProviderHooks {
    events: EventSender,
}

impl SubscriptionListener for ProviderHooks {
    fn on_first_subscription_made(&self, _pattern: &str) {}

    fn on_last_subscription_removed(&self, _pattern: &str) {}

    fn on_subscription_made(&self, _pattern: &str, _connection: &ConnectionRef) {}

    fn on_subscription_removed(&self, pattern: &str, connection: &ConnectionRef) {
        let _ = self.events.send(Event::ProviderRemoved {
            pattern: pattern.to_string(),
            connection: connection.clone(),
        });
    }
}
