//! Active-provider discovery.
//!
//! Providers register regular expression patterns. When a name matching a
//! pattern gains subscribers somewhere in the cluster, the node holding the
//! discovery lock for that name offers it to its local providers one at a
//! time until one accepts. The accepted provider is published through a
//! replicated set so every node knows the name is provided.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod actor;
mod error;
mod event;
mod provider;
mod registry;
mod round;

pub use error::Error;
pub use registry::{ListenerRegistry, ListenerRegistryConfig, MIN_REMATCH_INTERVAL};
