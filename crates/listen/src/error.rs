use thiserror::Error;

/// Errors that can occur when talking to a listener registry.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The registry was shut down or its task ended.
    #[error("the listener registry has stopped")]
    Stopped,
}
