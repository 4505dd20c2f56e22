//! Providers and candidate selection.

use std::fmt;

use herald_core::{ConnectionId, ConnectionRef};
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use regex::Regex;

/// A connection listening to one pattern.
///
/// Identity is the pair of connection and pattern: one connection listening
/// to two matching patterns is two candidates.
#[derive(Clone)]
pub struct Provider {
    pub connection: ConnectionRef,
    pub pattern: String,
}

impl Provider {
    pub fn new(connection: ConnectionRef, pattern: impl Into<String>) -> Self {
        Self {
            connection,
            pattern: pattern.into(),
        }
    }

    pub fn is(&self, connection: ConnectionId, pattern: &str) -> bool {
        self.connection.id() == connection && self.pattern == pattern
    }

    pub fn same(&self, other: &Self) -> bool {
        self.is(other.connection.id(), &other.pattern)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.connection.id(), self.pattern)
    }
}

/// Local providers whose pattern matches `name`, in pattern registration
/// order and then listen order, without duplicates.
///
/// `listeners` returns the local connections listening to a pattern.
pub fn candidates<F>(
    patterns: &IndexMap<String, Regex>,
    name: &str,
    shuffle: bool,
    listeners: F,
) -> Vec<Provider>
where
    F: Fn(&str) -> Vec<ConnectionRef>,
{
    let mut candidates: Vec<Provider> = Vec::new();

    for (pattern, regex) in patterns {
        if !regex.is_match(name) {
            continue;
        }

        for connection in listeners(pattern) {
            let candidate = Provider::new(connection, pattern.as_str());
            if !candidates.iter().any(|existing| existing.same(&candidate)) {
                candidates.push(candidate);
            }
        }
    }

    if shuffle {
        candidates.shuffle(&mut rand::thread_rng());
    }

    candidates
}
