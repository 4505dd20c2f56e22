//! Client-facing messages.

use serde::{Deserialize, Serialize};

use crate::{Action, Topic};

/// A decoded message exchanged with a client connection.
///
/// `name` carries the subscription name or, for listen traffic, the pattern.
/// `subscription` carries the concrete name a listen message refers to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Message {
    /// Topic the message belongs to.
    pub topic: Topic,

    /// Action of the message.
    pub action: Action,

    /// Name or pattern.
    pub name: Option<String>,

    /// Concrete subscription name for listen traffic.
    pub subscription: Option<String>,

    /// Whether this acknowledges a client request.
    pub is_ack: bool,

    /// Whether this reports a protocol error.
    pub is_error: bool,
}

impl Message {
    /// Creates a message about a single name.
    pub fn new(topic: Topic, action: Action, name: impl Into<String>) -> Self {
        Self {
            topic,
            action,
            name: Some(name.into()),
            subscription: None,
            is_ack: false,
            is_error: false,
        }
    }

    /// Creates a listen message about `subscription` matched by `pattern`.
    pub fn listen(
        topic: Topic,
        action: Action,
        pattern: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Self {
        Self {
            subscription: Some(subscription.into()),
            ..Self::new(topic, action, pattern)
        }
    }

    /// Creates an acknowledgement for `action` on `name`.
    pub fn ack(topic: Topic, action: Action, name: impl Into<String>) -> Self {
        Self {
            is_ack: true,
            ..Self::new(topic, action, name)
        }
    }

    /// Creates an error report with `action` as the error code.
    pub fn error(topic: Topic, action: Action, name: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(topic, action, name)
        }
    }

    /// The name or pattern, or an empty string when absent.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    /// The concrete subscription name, or an empty string when absent.
    #[must_use]
    pub fn subscription(&self) -> &str {
        self.subscription.as_deref().unwrap_or_default()
    }
}
