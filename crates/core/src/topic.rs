//! Topics and the per-topic behaviour table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A message topic that supports listening.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Topic {
    /// Stateful records.
    Record,

    /// Fire-and-forget events.
    Event,
}

impl Topic {
    /// Resolves the behaviour table for this topic.
    #[must_use]
    pub const fn profile(self) -> TopicProfile {
        match self {
            Self::Record => TopicProfile {
                topic: self,
                notifies_provider_status: true,
                subscriptions: StateRegistryTopic::RecordSubscriptions,
                listen_patterns: StateRegistryTopic::RecordListenPatterns,
                published_subscriptions: StateRegistryTopic::RecordPublishedSubscriptions,
            },
            Self::Event => TopicProfile {
                topic: self,
                notifies_provider_status: false,
                subscriptions: StateRegistryTopic::EventSubscriptions,
                listen_patterns: StateRegistryTopic::EventListenPatterns,
                published_subscriptions: StateRegistryTopic::EventPublishedSubscriptions,
            },
        }
    }

    /// Upper-case name used in lock names and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Record => "RECORD",
            Self::Event => "EVENT",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour that differs between topics, resolved once at construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TopicProfile {
    /// The topic this profile belongs to.
    pub topic: Topic,

    /// Whether subscribers are told when a provider appears or disappears.
    pub notifies_provider_status: bool,

    /// Replicated set holding names with subscribers.
    pub subscriptions: StateRegistryTopic,

    /// Replicated set holding patterns with listening providers.
    pub listen_patterns: StateRegistryTopic,

    /// Replicated set holding names with an active provider.
    pub published_subscriptions: StateRegistryTopic,
}

impl TopicProfile {
    /// Name of the cluster-wide lock guarding discovery for `name`.
    #[must_use]
    pub fn lock_name(&self, name: &str) -> String {
        format!("{}_LISTEN_LOCK_{name}", self.topic)
    }
}

/// Identifies one replicated set instance on the cluster bus.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum StateRegistryTopic {
    /// Record names with subscribers.
    RecordSubscriptions,

    /// Event names with subscribers.
    EventSubscriptions,

    /// Record patterns with listening providers.
    RecordListenPatterns,

    /// Event patterns with listening providers.
    EventListenPatterns,

    /// Record names with an active provider.
    RecordPublishedSubscriptions,

    /// Event names with an active provider.
    EventPublishedSubscriptions,

    /// Free-form registry, used by tests and embedders.
    Custom(u16),
}

impl fmt::Display for StateRegistryTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecordSubscriptions => f.write_str("RECORD_SUBSCRIPTIONS"),
            Self::EventSubscriptions => f.write_str("EVENT_SUBSCRIPTIONS"),
            Self::RecordListenPatterns => f.write_str("RECORD_LISTEN_PATTERNS"),
            Self::EventListenPatterns => f.write_str("EVENT_LISTEN_PATTERNS"),
            Self::RecordPublishedSubscriptions => f.write_str("RECORD_PUBLISHED_SUBSCRIPTIONS"),
            Self::EventPublishedSubscriptions => f.write_str("EVENT_PUBLISHED_SUBSCRIPTIONS"),
            Self::Custom(id) => write!(f, "CUSTOM_{id}"),
        }
    }
}
