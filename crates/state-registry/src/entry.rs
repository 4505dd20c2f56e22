use std::collections::HashSet;

use herald_core::NodeId;

/// Merged view of one name.
pub struct Entry {
    /// Local reference count, meaningful while this node claims the name.
    pub local_count: usize,

    /// Nodes asserting the name. Never empty while the entry exists.
    pub nodes: HashSet<NodeId>,

    /// Precomputed hash of the name.
    pub checksum: i32,
}

impl Entry {
    pub fn new(name: &str) -> Self {
        Self {
            local_count: 0,
            nodes: HashSet::new(),
            checksum: checksum(name),
        }
    }
}

/// String hash folded over UTF-16 code units with 32-bit wraparound.
pub fn checksum(name: &str) -> i32 {
    name.encode_utf16().fold(0i32, |hash, unit| {
        (hash << 5).wrapping_sub(hash).wrapping_add(i32::from(unit))
    })
}
