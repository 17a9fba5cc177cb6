//! Session layer: open/resume coordination, background refresh, and a
//! multi-thread host exposing the observable transcript.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod refresh;
mod session;

pub use config::{RefreshBudget, SessionConfig};
pub use coordinator::{OpenCoordinator, OpenToken};
pub use error::SessionError;
pub use refresh::{attempt_budget, RefreshStop};
pub use session::{OpenMode, OpenOutcome, ThreadSessions, TranscriptView};
