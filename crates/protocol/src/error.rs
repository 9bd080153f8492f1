use thiserror::Error;

/// A frame from a backend stream could not be turned into a message.
///
/// Never fatal to the stream: the offending frame is dropped and decoding continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("invalid JSON-RPC message: {0}")]
    InvalidMessage(String),

    #[error("frame exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}
