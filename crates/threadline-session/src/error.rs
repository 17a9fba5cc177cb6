use thiserror::Error;
use threadline_contract::ClientError;
use threadline_reconcile::TranscriptError;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    #[error("no thread is open")]
    NoActiveThread,

    /// A newer open for the session replaced this one.
    #[error("superseded by a newer open")]
    Superseded,

    #[error("turn already active: {0}")]
    TurnAlreadyActive(String),
}
