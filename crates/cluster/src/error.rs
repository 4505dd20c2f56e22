use thiserror::Error;

/// Errors raised while encoding or decoding cluster messages.
#[derive(Clone, Debug, Error)]
pub enum CodecError {
    /// The message could not be serialized.
    #[error("failed to encode cluster message: {0}")]
    Encode(String),

    /// The bytes did not contain a valid message.
    #[error("failed to decode cluster message: {0}")]
    Decode(String),
}
