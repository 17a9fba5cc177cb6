//! Open/resume sequencing across session switches.

use tokio_util::sync::CancellationToken;

/// Handle for one open (and the refresh loop that follows it).
#[derive(Debug, Clone)]
pub struct OpenToken {
    thread_id: String,
    generation: u64,
    cancel: CancellationToken,
}

impl OpenToken {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancelled once a newer open starts.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Hands out monotonically increasing open tokens. Only the newest token
/// may mutate shared state; older continuations abort quietly.
#[derive(Debug, Default)]
pub struct OpenCoordinator {
    generation: u64,
    current: Option<OpenToken>,
}

impl OpenCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new open for `thread_id`, superseding any previous one.
    pub fn begin(&mut self, thread_id: &str) -> OpenToken {
        self.cancel_current();
        self.generation = self.generation.wrapping_add(1);
        let token = OpenToken {
            thread_id: thread_id.to_string(),
            generation: self.generation,
            cancel: CancellationToken::new(),
        };
        self.current = Some(token.clone());
        token
    }

    pub fn is_current(&self, token: &OpenToken) -> bool {
        self.current.as_ref().is_some_and(|current| {
            current.generation == token.generation && current.thread_id == token.thread_id
        })
    }

    pub fn current_thread(&self) -> Option<&str> {
        self.current.as_ref().map(|t| t.thread_id.as_str())
    }

    /// Cancel the current open without starting another.
    pub fn cancel_current(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.cancel.cancel();
        }
    }
}
