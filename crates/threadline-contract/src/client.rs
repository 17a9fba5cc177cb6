use crate::error::ClientError;
use crate::transcript::Attachment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User input for a new turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnInput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl TurnInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// Remote thread operations.
///
/// Snapshot-returning calls hand back the raw result payload; decoding is the
/// caller's job so a malformed payload can be told apart from a failed call.
/// Implementations do not retry.
#[async_trait]
pub trait ThreadClient: Send + Sync {
    /// Resume a thread that is not loaded server-side.
    async fn resume_thread(&self, thread_id: &str) -> Result<Value, ClientError>;

    /// Read the current state of a loaded thread.
    async fn read_thread(&self, thread_id: &str) -> Result<Value, ClientError>;

    /// Ids of the threads currently loaded server-side.
    async fn list_loaded_threads(&self) -> Result<Vec<String>, ClientError>;

    /// Subscribe this connection to a loaded thread's live events.
    async fn attach_listener(&self, thread_id: &str) -> Result<(), ClientError>;

    /// Start a turn and return its id.
    async fn start_turn(&self, thread_id: &str, input: &TurnInput) -> Result<String, ClientError>;

    /// Request interruption of a running turn.
    async fn interrupt_turn(&self, thread_id: &str, turn_id: &str) -> Result<(), ClientError>;

    /// Archive a thread.
    async fn archive_thread(&self, thread_id: &str) -> Result<(), ClientError>;

    /// Whether the underlying connection is currently up.
    fn is_connected(&self) -> bool {
        true
    }
}
