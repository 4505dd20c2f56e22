//! Messages exchanged between nodes.

use bytes::Bytes;
use herald_core::{StateRegistryTopic, Topic};
use serde::{Deserialize, Serialize};

use crate::CodecError;

/// Bus topic a handler subscribes to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ClusterTopic {
    /// Replicated set traffic.
    StateRegistry,

    /// Provider discovery traffic.
    Listen,

    /// Lock service traffic.
    Lock,
}

/// A message sent over the cluster bus.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ClusterMessage {
    /// Replicated set update.
    State(StateMessage),

    /// Provider discovery notice.
    Listen(ListenMessage),

    /// Lock service request or reply.
    Lock(LockMessage),
}

impl ClusterMessage {
    /// The bus topic this message is delivered on.
    #[must_use]
    pub const fn topic(&self) -> ClusterTopic {
        match self {
            Self::State(_) => ClusterTopic::StateRegistry,
            Self::Listen(_) => ClusterTopic::Listen,
            Self::Lock(_) => ClusterTopic::Lock,
        }
    }
}

/// Update for one replicated set.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StateMessage {
    /// Replicated set the update belongs to.
    pub registry: StateRegistryTopic,

    /// The update itself.
    pub action: StateAction,
}

/// Replicated set actions.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum StateAction {
    /// The sender now claims `name`.
    Add {
        /// The claimed name.
        name: String,
    },

    /// The sender no longer claims `name`.
    Remove {
        /// The released name.
        name: String,
    },

    /// Sum of the checksums of every name the sender claims.
    Checksum {
        /// The total.
        checksum: i64,
    },

    /// Asks the receiver for every name it claims.
    RequestFullState,

    /// Every name the sender claims.
    FullState {
        /// The claimed names.
        names: Vec<String>,
    },
}

/// Provider discovery notice.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ListenMessage {
    /// The sender ran out of local candidates for `name`.
    Unsuccessful {
        /// Topic of the discovery registry.
        topic: Topic,

        /// The name nobody accepted.
        name: String,
    },
}

/// Lock service message.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LockMessage {
    /// Name of the lock.
    pub name: String,

    /// What is being asked or answered.
    pub action: LockAction,
}

/// Lock service actions.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum LockAction {
    /// Follower asks the leader for the lock.
    Request,

    /// Leader answers a request.
    Response {
        /// Whether the lock was granted.
        locked: bool,
    },

    /// Holder gives the lock back.
    Release,
}

impl TryFrom<Bytes> for ClusterMessage {
    type Error = CodecError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let reader = bytes.as_ref();
        ciborium::de::from_reader(reader).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl TryInto<Bytes> for ClusterMessage {
    type Error = CodecError;

    fn try_into(self) -> Result<Bytes, Self::Error> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(&self, &mut payload)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(payload))
    }
}
