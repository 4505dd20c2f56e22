//! Test helpers: a recording in-memory connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{Action, CloseCallback, CloseHookId, Connection, ConnectionId, ConnectionRef, Message};

/// Connection that records everything sent to it.
pub struct MockConnection {
    id: ConnectionId,
    messages: Mutex<Vec<Message>>,
    hooks: Mutex<Vec<(CloseHookId, CloseCallback)>>,
    next_hook: AtomicU64,
    closed: AtomicBool,
}

impl MockConnection {
    /// Creates an open connection.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            messages: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// The connection as a shared handle.
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> ConnectionRef {
        self.clone()
    }

    /// Every message and ack sent so far, in order.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Drains the recorded messages.
    pub fn take_messages(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// Number of non-ack messages with `action`.
    pub fn count(&self, action: Action) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|message| message.action == action && !message.is_ack)
            .count()
    }

    /// Number of non-ack messages with `action` about `name`.
    pub fn count_for(&self, action: Action, name: &str) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|message| {
                message.action == action
                    && !message.is_ack
                    && (message.name() == name || message.subscription() == name)
            })
            .count()
    }

    /// Whether a non-ack message with `action` about `name` was received.
    pub fn received(&self, action: Action, name: &str) -> bool {
        self.count_for(action, name) > 0
    }

    /// Number of registered close hooks.
    pub fn close_hook_count(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the connection, running its close hooks once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let hooks = std::mem::take(&mut *self.hooks.lock());
        for (_, callback) in hooks {
            callback(self.id);
        }
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_message(&self, message: Message) {
        self.messages.lock().push(message);
    }

    fn send_ack_message(&self, message: Message) {
        self.messages.lock().push(message);
    }

    fn on_close(&self, callback: CloseCallback) -> CloseHookId {
        let hook = CloseHookId::new(self.next_hook.fetch_add(1, Ordering::Relaxed));
        self.hooks.lock().push((hook, callback));
        hook
    }

    fn remove_on_close(&self, hook: CloseHookId) {
        self.hooks.lock().retain(|(id, _)| *id != hook);
    }
}
