//! The discovery task. Owns every pattern, round and active provider of one
//! topic and processes its events strictly in order.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use herald_cluster::{ClusterMessage, ClusterNode, ListenMessage};
use herald_core::{
    Action, CloseHookId, ConnectionId, ConnectionRef, ListenConfig, Message, NodeId, Topic,
    TopicProfile,
};
use herald_locks::LockManager;
use herald_state_registry::StateRegistry;
use herald_subscriptions::{DefaultSubscriptionRegistry, SubscriptionRegistry};
use indexmap::IndexMap;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::MIN_REMATCH_INTERVAL;
use crate::event::{Event, EventReceiver, EventSender};
use crate::provider::{self, Provider};
use crate::round::{LateResponse, Round};

struct ActiveProvider {
    provider: Provider,
    close_hook: CloseHookId,
}

pub struct Listener<L: LockManager> {
    topic: Topic,
    profile: TopicProfile,
    config: ListenConfig,
    cluster: Arc<dyn ClusterNode>,
    providers: Arc<DefaultSubscriptionRegistry>,
    subscriptions: Arc<dyn SubscriptionRegistry>,
    published: StateRegistry,
    lock_manager: L,
    events: EventSender,
    patterns: IndexMap<String, Regex>,
    rounds: HashMap<String, Round>,
    pending_locks: HashSet<String>,
    active: HashMap<String, ActiveProvider>,
    unsuccessful: HashMap<String, Instant>,
    next_token: u64,
}

/// Processes events until shutdown.
pub async fn run<L: LockManager>(mut listener: Listener<L>, mut events: EventReceiver) {
    let mut rematch = listener.rematch_timer();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };

                if listener.handle(event).is_break() {
                    break;
                }
            }
            () = next_rematch(&mut rematch) => listener.rematch(),
        }
    }

    listener.stop();

    // Lock requests that complete from here on release their own grant.
    events.close();
    while let Ok(event) = events.try_recv() {
        if let Event::LockResult {
            name,
            acquired: true,
        } = event
        {
            listener.release_lock(&name);
        }
    }
}

async fn next_rematch(rematch: &mut Option<Interval>) {
    match rematch {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn spawn_response_timer(
    events: &EventSender,
    timeout: Duration,
    name: &str,
    token: u64,
) -> tokio::task::JoinHandle<()> {
    let events = events.clone();
    let name = name.to_string();

    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let _ = events.send(Event::ResponseTimeout { name, token });
    })
}

impl<L: LockManager> Listener<L> {
    pub fn new(
        profile: TopicProfile,
        config: ListenConfig,
        cluster: Arc<dyn ClusterNode>,
        providers: Arc<DefaultSubscriptionRegistry>,
        subscriptions: Arc<dyn SubscriptionRegistry>,
        published: StateRegistry,
        lock_manager: L,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();

        let listener = Self {
            topic: profile.topic,
            profile,
            config,
            cluster,
            providers,
            subscriptions,
            published,
            lock_manager,
            events,
            patterns: IndexMap::new(),
            rounds: HashMap::new(),
            pending_locks: HashSet::new(),
            active: HashMap::new(),
            unsuccessful: HashMap::new(),
            next_token: 0,
        };

        (listener, receiver)
    }

    pub fn sender(&self) -> EventSender {
        self.events.clone()
    }

    fn rematch_timer(&self) -> Option<Interval> {
        let period = self.config.rematch_interval;

        if period < MIN_REMATCH_INTERVAL {
            warn!(
                "{} listener: rematch interval of {:?} is below the minimum of {:?}, rematching is disabled",
                self.topic, period, MIN_REMATCH_INTERVAL
            );
            return None;
        }

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Some(interval)
    }

    fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Message {
                connection,
                message,
            } => self.on_message(&connection, &message),
            Event::SubscriptionMade { name, connection } => {
                self.on_subscription_made(&name, &connection);
            }
            Event::FirstSubscription(name) => self.start_discovery(&name),
            Event::LastSubscriptionRemoved(name) => self.on_last_subscription_removed(&name),
            Event::ProviderRemoved {
                pattern,
                connection,
            } => self.remove_provider(&pattern, &connection),
            Event::ProviderClosed {
                pattern,
                connection,
            } => self.remove_if_active(&pattern, connection),
            Event::ProviderStarted(name) => self.on_provider_started(&name),
            Event::ProviderStopped(name) => self.on_provider_stopped(&name),
            Event::ResponseTimeout { name, token } => self.on_response_timeout(&name, token),
            Event::LockResult { name, acquired } => self.on_lock_result(name, acquired),
            Event::Unsuccessful { from, name } => self.on_remote_unsuccessful(&from, &name),
            Event::Flush(done) => {
                let _ = done.send(());
            }
            Event::Shutdown => return ControlFlow::Break(()),
        }

        ControlFlow::Continue(())
    }

    fn on_message(&mut self, connection: &ConnectionRef, message: &Message) {
        let pattern = message.name();

        let incomplete = pattern.is_empty()
            || (matches!(message.action, Action::ListenAccept | Action::ListenReject)
                && message.subscription().is_empty());

        if message.topic != self.topic || incomplete {
            warn!(
                "{} listener: invalid {} {} message from {}",
                self.topic,
                message.topic,
                message.action,
                connection.id()
            );
            connection.send_message(Message::error(
                self.topic,
                Action::InvalidMessageData,
                pattern,
            ));
            return;
        }

        match message.action {
            Action::Listen => self.add_listener(connection, pattern),
            Action::Unlisten => {
                // The provider registry reports the removal back as an event.
                self.providers.unsubscribe(pattern, connection);
            }
            Action::ListenAccept => self.on_accept(connection, pattern, message.subscription()),
            Action::ListenReject => self.on_reject(connection, pattern, message.subscription()),
            action => warn!(
                "{} listener: unexpected {} from {}",
                self.topic,
                action,
                connection.id()
            ),
        }
    }

    fn add_listener(&mut self, connection: &ConnectionRef, pattern: &str) {
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                error!(
                    "{} listener: invalid listen pattern {:?} from {}: {}",
                    self.topic,
                    pattern,
                    connection.id(),
                    e
                );
                connection.send_message(Message::error(
                    self.topic,
                    Action::InvalidListenRegex,
                    pattern,
                ));
                return;
            }
        };

        if !self.providers.subscribe(pattern, connection) {
            return;
        }

        self.patterns.entry(pattern.to_string()).or_insert(regex);

        let provider = Provider::new(connection.clone(), pattern);
        self.reconcile_pattern(pattern, Some(&provider));
    }

    /// Starts discovery for every subscribed name `pattern` matches that has
    /// no provider. A `joining` provider is added to rounds already running.
    fn reconcile_pattern(&mut self, pattern: &str, joining: Option<&Provider>) {
        let Some(regex) = self.patterns.get(pattern).cloned() else {
            return;
        };

        for name in self.subscriptions.get_names() {
            if !regex.is_match(&name) || self.has_provider(&name) {
                continue;
            }

            if let Some(round) = self.rounds.get_mut(&name) {
                if let Some(provider) = joining {
                    if round.enqueue(provider.clone()) {
                        debug!(
                            "{} listener: queued {:?} for the running discovery of {}",
                            self.topic, provider, name
                        );
                    }
                }
                continue;
            }

            if joining.is_none() && self.in_cooldown(&name) {
                continue;
            }

            self.start_discovery(&name);
        }
    }

    fn rematch(&mut self) {
        let cooldown = self.config.match_cooldown;
        self.unsuccessful
            .retain(|_, failed| failed.elapsed() < cooldown);

        let patterns: Vec<String> = self.patterns.keys().cloned().collect();

        debug!("{} listener: rematching {} patterns", self.topic, patterns.len());

        for pattern in patterns {
            self.reconcile_pattern(&pattern, None);
        }
    }

    fn has_provider(&self, name: &str) -> bool {
        self.active.contains_key(name) || self.published.has(name)
    }

    fn has_candidates(&self, name: &str) -> bool {
        self.patterns.iter().any(|(pattern, regex)| {
            regex.is_match(name) && self.providers.has_local_subscribers(pattern)
        })
    }

    fn candidates(&self, name: &str) -> Vec<Provider> {
        provider::candidates(
            &self.patterns,
            name,
            self.config.shuffle_providers,
            |pattern| self.providers.get_local_subscribers(pattern),
        )
    }

    fn in_cooldown(&self, name: &str) -> bool {
        self.unsuccessful
            .get(name)
            .is_some_and(|failed| failed.elapsed() < self.config.match_cooldown)
    }

    fn start_discovery(&mut self, name: &str) {
        if self.rounds.contains_key(name) || self.pending_locks.contains(name) {
            debug!("{} listener: discovery for {} is already running", self.topic, name);
            return;
        }

        if self.has_provider(name) || !self.has_candidates(name) {
            return;
        }

        self.pending_locks.insert(name.to_string());

        let lock_manager = self.lock_manager.clone();
        let lock = self.profile.lock_name(name);
        let events = self.events.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            let acquired = match lock_manager.try_lock(lock.clone()).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    warn!("Failed to acquire {}: {}", lock, e);
                    false
                }
            };

            if events.send(Event::LockResult { name, acquired }).is_err() && acquired {
                if let Err(e) = lock_manager.release(lock.clone()).await {
                    warn!("Failed to release {}: {}", lock, e);
                }
            }
        });
    }

    fn on_lock_result(&mut self, name: String, acquired: bool) {
        self.pending_locks.remove(&name);

        if !acquired {
            debug!(
                "{} listener: discovery lock for {} is held elsewhere",
                self.topic, name
            );
            return;
        }

        if self.has_provider(&name) || !self.subscriptions.has_name(&name) {
            debug!(
                "{} listener: {} no longer needs a provider",
                self.topic, name
            );
            self.release_lock(&name);
            return;
        }

        let candidates = self.candidates(&name);
        if candidates.is_empty() {
            self.release_lock(&name);
            return;
        }

        debug!(
            "{} listener: discovery for {} started with {} candidates",
            self.topic,
            name,
            candidates.len()
        );

        self.rounds.insert(name.clone(), Round::new(candidates));
        self.offer_next(&name);
    }

    fn offer_next(&mut self, name: &str) {
        let subscribers: HashSet<ConnectionId> = self
            .subscriptions
            .get_local_subscribers(name)
            .iter()
            .map(|subscriber| subscriber.id())
            .collect();

        let Some(round) = self.rounds.get_mut(name) else {
            return;
        };

        let next = round.next_candidate(|candidate| {
            let subscribed = subscribers.contains(&candidate.connection.id());
            if subscribed {
                debug!(
                    "{} listener: skipping {:?}, it subscribes to {}",
                    self.topic, candidate, name
                );
            }
            subscribed
        });

        let Some(provider) = next else {
            self.finish_unsuccessful(name);
            return;
        };

        self.next_token += 1;
        let token = self.next_token;
        let timer = spawn_response_timer(&self.events, self.config.response_timeout, name, token);

        debug!("{} listener: offering {} to {:?}", self.topic, name, provider);

        provider.connection.send_message(Message::listen(
            self.topic,
            Action::SubscriptionForPatternFound,
            provider.pattern.as_str(),
            name,
        ));
        round.offer(provider, token, timer);
    }

    fn on_accept(&mut self, connection: &ConnectionRef, pattern: &str, name: &str) {
        let id = connection.id();

        let Some(round) = self.rounds.get_mut(name) else {
            self.refuse_accept(connection, pattern, name);
            return;
        };

        if round.is_current(id, pattern) {
            let provider = round.take_current();
            if let Some(late) = round.take_late_acceptor() {
                self.send_pattern_removed(&late, name);
            }

            if let Some(provider) = provider {
                self.finish_accepted(name, provider);
            }
            return;
        }

        match round.late_response(id, pattern, true) {
            LateResponse::Remembered => debug!(
                "{} listener: {} accepted {} late, keeping it in reserve",
                self.topic, id, name
            ),
            LateResponse::Superseded(provider) => self.send_pattern_removed(&provider, name),
            LateResponse::Unknown | LateResponse::Forgotten => {
                self.refuse_accept(connection, pattern, name);
            }
        }
    }

    fn on_reject(&mut self, connection: &ConnectionRef, pattern: &str, name: &str) {
        let id = connection.id();

        let Some(round) = self.rounds.get_mut(name) else {
            debug!(
                "{} listener: ignoring reject of {} by {}, no discovery is running",
                self.topic, name, id
            );
            return;
        };

        if round.is_current(id, pattern) {
            round.take_current();
            self.conclude_turn(name);
            return;
        }

        if matches!(
            round.late_response(id, pattern, false),
            LateResponse::Unknown
        ) {
            debug!(
                "{} listener: ignoring reject of {} by {}, it was not asked",
                self.topic, name, id
            );
        }
    }

    fn on_response_timeout(&mut self, name: &str, token: u64) {
        let Some(round) = self.rounds.get_mut(name) else {
            return;
        };

        let Some(provider) = round.time_out(token) else {
            return;
        };

        debug!(
            "{} listener: {:?} did not answer for {} in time",
            self.topic, provider, name
        );

        provider.connection.send_message(Message::listen(
            self.topic,
            Action::ListenResponseTimeout,
            provider.pattern.as_str(),
            name,
        ));

        self.conclude_turn(name);
    }

    /// After a candidate declined or timed out: commit a late acceptor if
    /// there is one, otherwise ask the next candidate.
    fn conclude_turn(&mut self, name: &str) {
        let late = self
            .rounds
            .get_mut(name)
            .and_then(Round::take_late_acceptor);

        match late {
            Some(provider) => self.finish_accepted(name, provider),
            None => self.offer_next(name),
        }
    }

    fn finish_accepted(&mut self, name: &str, provider: Provider) {
        self.rounds.remove(name);
        self.commit(name, provider);
        self.release_lock(name);
    }

    fn finish_unsuccessful(&mut self, name: &str) {
        self.rounds.remove(name);
        self.unsuccessful.insert(name.to_string(), Instant::now());

        debug!("{} listener: no local provider accepted {}", self.topic, name);

        // Peers react to the broadcast by taking the lock themselves.
        let cluster = self.cluster.clone();
        let unsuccessful = ClusterMessage::Listen(ListenMessage::Unsuccessful {
            topic: self.topic,
            name: name.to_string(),
        });
        self.release_lock_then(name, move || cluster.send(unsuccessful));
    }

    fn commit(&mut self, name: &str, provider: Provider) {
        let events = self.events.clone();
        let pattern = provider.pattern.clone();
        let close_hook = provider.connection.on_close(Box::new(move |connection| {
            let _ = events.send(Event::ProviderClosed {
                pattern,
                connection,
            });
        }));

        debug!("{} listener: {:?} now provides {}", self.topic, provider, name);

        self.unsuccessful.remove(name);
        self.active.insert(
            name.to_string(),
            ActiveProvider {
                provider,
                close_hook,
            },
        );
        self.published.add(name);
    }

    fn refuse_accept(&self, connection: &ConnectionRef, pattern: &str, name: &str) {
        debug!(
            "{} listener: {} accepted {} which it was not offered",
            self.topic,
            connection.id(),
            name
        );

        connection.send_message(Message {
            subscription: Some(name.to_string()),
            ..Message::error(self.topic, Action::MultipleAccept, pattern)
        });
    }

    fn remove_provider(&mut self, pattern: &str, connection: &ConnectionRef) {
        let id = connection.id();

        if !self.providers.has_local_subscribers(pattern) {
            self.patterns.shift_remove(pattern);
        }

        let interrupted: Vec<String> = self
            .rounds
            .iter_mut()
            .filter_map(|(name, round)| round.remove_provider(id, pattern).then(|| name.clone()))
            .collect();

        for name in interrupted {
            self.conclude_turn(&name);
        }

        self.remove_if_active(pattern, id);
    }

    fn remove_if_active(&mut self, pattern: &str, connection: ConnectionId) {
        let names: Vec<String> = self
            .active
            .iter()
            .filter(|(_, active)| active.provider.is(connection, pattern))
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            self.remove_active(&name);

            debug!(
                "{} listener: provider of {} went away",
                self.topic, name
            );

            if self.subscriptions.has_name(&name) {
                self.start_discovery(&name);
            }
        }
    }

    fn remove_active(&mut self, name: &str) -> Option<Provider> {
        let active = self.active.remove(name)?;
        active.provider.connection.remove_on_close(active.close_hook);
        self.published.remove(name);
        Some(active.provider)
    }

    fn on_subscription_made(&self, name: &str, connection: &ConnectionRef) {
        if self.profile.notifies_provider_status && self.published.has(name) {
            connection.send_message(Message::new(
                self.topic,
                Action::SubscriptionHasProvider,
                name,
            ));
        }
    }

    fn on_last_subscription_removed(&mut self, name: &str) {
        self.unsuccessful.remove(name);

        if let Some(round) = self.rounds.remove(name) {
            debug!(
                "{} listener: {} lost its subscribers during discovery",
                self.topic, name
            );

            for provider in round.cancel() {
                self.send_pattern_removed(&provider, name);
            }
            self.release_lock(name);
        }

        if let Some(provider) = self.remove_active(name) {
            self.send_pattern_removed(&provider, name);
        }
    }

    fn on_provider_started(&self, name: &str) {
        if self.profile.notifies_provider_status {
            self.subscriptions.send_to_subscribers(
                name,
                &Message::new(self.topic, Action::SubscriptionHasProvider, name),
                None,
            );
        }
    }

    fn on_provider_stopped(&mut self, name: &str) {
        if self.profile.notifies_provider_status {
            self.subscriptions.send_to_subscribers(
                name,
                &Message::new(self.topic, Action::SubscriptionHasNoProvider, name),
                None,
            );
        }

        if !self.has_provider(name) && self.subscriptions.has_name(name) {
            self.start_discovery(name);
        }
    }

    fn on_remote_unsuccessful(&mut self, from: &NodeId, name: &str) {
        if self.has_provider(name) || !self.subscriptions.has_name(name) {
            return;
        }

        if self.in_cooldown(name) {
            debug!(
                "{} listener: {} found no provider for {}, not retrying during cooldown",
                self.topic, from, name
            );
            return;
        }

        debug!(
            "{} listener: {} found no provider for {}, trying local providers",
            self.topic, from, name
        );
        self.start_discovery(name);
    }

    fn send_pattern_removed(&self, provider: &Provider, name: &str) {
        provider.connection.send_message(Message::listen(
            self.topic,
            Action::SubscriptionForPatternRemoved,
            provider.pattern.as_str(),
            name,
        ));
    }

    fn release_lock(&self, name: &str) {
        self.release_lock_then(name, || {});
    }

    /// Releases the discovery lock of `name`, running `then` once the lock
    /// service has confirmed or refused the release.
    fn release_lock_then<F>(&self, name: &str, then: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let lock_manager = self.lock_manager.clone();
        let lock = self.profile.lock_name(name);

        tokio::spawn(async move {
            if let Err(e) = lock_manager.release(lock.clone()).await {
                warn!("Failed to release {}: {}", lock, e);
            }
            then();
        });
    }

    fn stop(&mut self) {
        let names: Vec<String> = self.rounds.keys().cloned().collect();
        for name in names {
            self.rounds.remove(&name);
            self.release_lock(&name);
        }

        self.published.shutdown();
        self.providers.cluster_names().shutdown();

        debug!("{} listener stopped", self.topic);
    }
}
