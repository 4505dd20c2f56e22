//! Shared vocabulary for the herald broker: topics, actions, client messages,
//! node identifiers, the connection handle and configuration.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod action;
mod config;
mod connection;
mod error;
mod message;
mod node_id;
mod topic;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;

pub use action::Action;
pub use config::{HeraldConfig, ListenConfig, LockConfig, StateRegistryConfig};
pub use connection::{CloseCallback, CloseHookId, Connection, ConnectionId, ConnectionRef};
pub use error::ConfigError;
pub use message::Message;
pub use node_id::NodeId;
pub use topic::{StateRegistryTopic, Topic, TopicProfile};
