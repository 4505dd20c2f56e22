use std::fmt;

use serde::{Deserialize, Serialize};

/// Topic-qualified action carried by a client [`Message`](crate::Message).
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Action {
    /// Subscribe to a name.
    Subscribe,

    /// Unsubscribe from a name.
    Unsubscribe,

    /// Register as a provider for a pattern.
    Listen,

    /// Withdraw as a provider for a pattern.
    Unlisten,

    /// Provider agrees to provide a name.
    ListenAccept,

    /// Provider declines to provide a name.
    ListenReject,

    /// Provider did not answer an offer in time.
    ListenResponseTimeout,

    /// A name matching a provider's pattern is being offered.
    SubscriptionForPatternFound,

    /// A provider should stop providing a name.
    SubscriptionForPatternRemoved,

    /// A name now has an active provider.
    SubscriptionHasProvider,

    /// A name no longer has an active provider.
    SubscriptionHasNoProvider,

    /// No provider could be found for a name.
    ListenUnsuccessful,

    /// A listen pattern failed to compile.
    InvalidListenRegex,

    /// A provider accepted a name that already has a provider.
    MultipleAccept,

    /// Connection is already subscribed to the name.
    MultipleSubscriptions,

    /// Connection is not subscribed to the name.
    NotSubscribed,

    /// A message is missing data its action requires or was routed to the
    /// wrong topic.
    InvalidMessageData,
}

impl Action {
    /// Wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Listen => "LISTEN",
            Self::Unlisten => "UNLISTEN",
            Self::ListenAccept => "LISTEN_ACCEPT",
            Self::ListenReject => "LISTEN_REJECT",
            Self::ListenResponseTimeout => "LISTEN_RESPONSE_TIMEOUT",
            Self::SubscriptionForPatternFound => "SUBSCRIPTION_FOR_PATTERN_FOUND",
            Self::SubscriptionForPatternRemoved => "SUBSCRIPTION_FOR_PATTERN_REMOVED",
            Self::SubscriptionHasProvider => "SUBSCRIPTION_HAS_PROVIDER",
            Self::SubscriptionHasNoProvider => "SUBSCRIPTION_HAS_NO_PROVIDER",
            Self::ListenUnsuccessful => "LISTEN_UNSUCCESSFUL",
            Self::InvalidListenRegex => "INVALID_LISTEN_REGEX",
            Self::MultipleAccept => "MULTIPLE_ACCEPT",
            Self::MultipleSubscriptions => "MULTIPLE_SUBSCRIPTIONS",
            Self::NotSubscribed => "NOT_SUBSCRIBED",
            Self::InvalidMessageData => "INVALID_MESSAGE_DATA",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
