//! The connection handle consumed by the registries.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Message;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a client connection.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates a fresh id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle returned by [`Connection::on_close`], used to unregister the hook.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CloseHookId(u64);

impl CloseHookId {
    /// Wraps a connection-local hook counter.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Callback run once when a connection closes.
pub type CloseCallback = Box<dyn FnOnce(ConnectionId) + Send>;

/// A client connection as seen by the registries.
///
/// Sends are fire-and-forget. Close hooks run once, in registration order,
/// when the connection goes away.
pub trait Connection: Send + Sync + 'static {
    /// Identity of the connection.
    fn id(&self) -> ConnectionId;

    /// Sends a message to the client.
    fn send_message(&self, message: Message);

    /// Sends an acknowledgement to the client.
    fn send_ack_message(&self, message: Message);

    /// Registers a callback for when the connection closes.
    fn on_close(&self, callback: CloseCallback) -> CloseHookId;

    /// Unregisters a close callback. Unknown hooks are ignored.
    fn remove_on_close(&self, hook: CloseHookId);
}

/// Shared connection handle.
pub type ConnectionRef = Arc<dyn Connection>;
