//! Node identifier type

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a node (server) in the cluster.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from its server name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The server name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}
