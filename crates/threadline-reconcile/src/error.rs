use thiserror::Error;

/// Transcript store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    /// Message ids must be unique within a session.
    #[error("duplicate message id: {0}")]
    DuplicateMessageId(String),

    #[error("unknown message: {0}")]
    UnknownMessage(String),
}
