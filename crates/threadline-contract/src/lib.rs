//! Shared conversation contracts: transcript model, remote thread items and
//! snapshots, live events, wire decoding, and the remote client seam.

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub mod client;
pub mod error;
pub mod event;
pub mod item;
pub mod snapshot;
pub mod transcript;
pub mod wire;

// transcript
pub use transcript::{
    gen_message_id, Attachment, Message, MessageId, Role, Segment, ToolCallKind, ToolCallSegment,
    ToolCallStatus,
};

// items + snapshots
pub use item::{classify, Item, ItemKind};
pub use snapshot::{Snapshot, Turn, TurnStatus};

// events
pub use event::{render_plan, PlanStep, PlanStepStatus, ThreadEvent, ThreadNotification};

// wire
pub use wire::{decode_notification, decode_snapshot};

// client
pub use client::{ThreadClient, TurnInput};
pub use error::{ClientError, ProtocolError};
