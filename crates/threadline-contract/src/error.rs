use thiserror::Error;

/// A remote payload that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Required field is absent or null.
    #[error("missing field: {0}")]
    MissingField(String),

    /// Field is present but has the wrong shape.
    #[error("invalid field {field}: expected {expected}")]
    InvalidField {
        field: String,
        expected: &'static str,
    },
}

impl ProtocolError {
    pub(crate) fn missing(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    pub(crate) fn invalid(field: impl Into<String>, expected: &'static str) -> Self {
        Self::InvalidField {
            field: field.into(),
            expected,
        }
    }
}

/// Remote thread client errors.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The RPC failed in flight.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection is gone.
    #[error("disconnected")]
    Disconnected,

    /// The remote answered with something undecodable.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Thread not known to the remote.
    #[error("thread not found: {0}")]
    NotFound(String),
}

impl ClientError {
    /// Whether the failure means the connection itself is unusable.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}
