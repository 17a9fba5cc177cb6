//! Shared test fixtures for crates that depend on `threadline-contract`.
//!
//! Gated behind the `test-support` cargo feature so production builds are
//! unaffected.  Enable via `[dev-dependencies] threadline-contract = { ..., features = ["test-support"] }`.

use crate::client::{ThreadClient, TurnInput};
use crate::error::ClientError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One recorded client invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    Resume(String),
    Read(String),
    ListLoaded,
    Attach(String),
    StartTurn(String, TurnInput),
    Interrupt(String, String),
    Archive(String),
}

struct Scripted<T> {
    delay: Duration,
    result: Result<T, ClientError>,
}

struct Queue<T> {
    pending: VecDeque<Scripted<T>>,
    last: Option<Result<T, ClientError>>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            last: None,
        }
    }
}

impl<T: Clone> Queue<T> {
    /// Next scripted response; once drained, the last one repeats.
    fn next(&mut self, method: &str) -> (Duration, Result<T, ClientError>) {
        match self.pending.pop_front() {
            Some(entry) => {
                self.last = Some(entry.result.clone());
                (entry.delay, entry.result)
            }
            None => (
                Duration::ZERO,
                self.last.clone().unwrap_or_else(|| {
                    Err(ClientError::Transport(format!("no scripted {method} response")))
                }),
            ),
        }
    }
}

/// In-memory `ThreadClient` that replays queued responses and records calls.
#[derive(Default)]
pub struct ScriptedThreadClient {
    resume: Mutex<Queue<Value>>,
    read: Mutex<Queue<Value>>,
    turns: Mutex<Queue<String>>,
    loaded: Mutex<Vec<String>>,
    calls: Mutex<Vec<ClientCall>>,
    disconnected: AtomicBool,
}

fn push<T>(queue: &Mutex<Queue<T>>, delay: Duration, result: Result<T, ClientError>) {
    queue
        .lock()
        .unwrap()
        .pending
        .push_back(Scripted { delay, result });
}

impl ScriptedThreadClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_resume(&self, result: Result<Value, ClientError>) {
        push(&self.resume, Duration::ZERO, result);
    }

    pub fn push_resume_delayed(&self, delay: Duration, result: Result<Value, ClientError>) {
        push(&self.resume, delay, result);
    }

    pub fn push_read(&self, result: Result<Value, ClientError>) {
        push(&self.read, Duration::ZERO, result);
    }

    pub fn push_read_delayed(&self, delay: Duration, result: Result<Value, ClientError>) {
        push(&self.read, delay, result);
    }

    pub fn push_turn(&self, result: Result<String, ClientError>) {
        push(&self.turns, Duration::ZERO, result);
    }

    pub fn set_loaded(&self, ids: &[&str]) {
        *self.loaded.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&ClientCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ClientCall) {
        self.calls.lock().unwrap().push(call);
    }

    async fn respond<T: Clone>(
        &self,
        queue: &Mutex<Queue<T>>,
        method: &str,
    ) -> Result<T, ClientError> {
        let (delay, result) = queue.lock().unwrap().next(method);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

#[async_trait]
impl ThreadClient for ScriptedThreadClient {
    async fn resume_thread(&self, thread_id: &str) -> Result<Value, ClientError> {
        self.record(ClientCall::Resume(thread_id.to_string()));
        self.respond(&self.resume, "resume").await
    }

    async fn read_thread(&self, thread_id: &str) -> Result<Value, ClientError> {
        self.record(ClientCall::Read(thread_id.to_string()));
        self.respond(&self.read, "read").await
    }

    async fn list_loaded_threads(&self) -> Result<Vec<String>, ClientError> {
        self.record(ClientCall::ListLoaded);
        Ok(self.loaded.lock().unwrap().clone())
    }

    async fn attach_listener(&self, thread_id: &str) -> Result<(), ClientError> {
        self.record(ClientCall::Attach(thread_id.to_string()));
        Ok(())
    }

    async fn start_turn(&self, thread_id: &str, input: &TurnInput) -> Result<String, ClientError> {
        self.record(ClientCall::StartTurn(thread_id.to_string(), input.clone()));
        self.respond(&self.turns, "start_turn").await
    }

    async fn interrupt_turn(&self, thread_id: &str, turn_id: &str) -> Result<(), ClientError> {
        self.record(ClientCall::Interrupt(
            thread_id.to_string(),
            turn_id.to_string(),
        ));
        Ok(())
    }

    async fn archive_thread(&self, thread_id: &str) -> Result<(), ClientError> {
        self.record(ClientCall::Archive(thread_id.to_string()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}

/// `{ "thread": { id, activeTurnId, turns } }` payload.
pub fn snapshot_json(thread_id: &str, active_turn_id: Option<&str>, turns: Vec<Value>) -> Value {
    json!({
        "thread": {
            "id": thread_id,
            "cwd": "/workspace",
            "createdAt": 1_700_000_000,
            "activeTurnId": active_turn_id,
            "turns": turns,
        }
    })
}

pub fn turn_json(id: &str, status: &str, items: Vec<Value>) -> Value {
    json!({ "id": id, "status": status, "items": items })
}

pub fn user_item(id: &str, text: &str) -> Value {
    json!({ "type": "userMessage", "id": id, "content": [{ "type": "text", "text": text }] })
}

pub fn agent_item(id: &str, text: &str) -> Value {
    json!({ "type": "agentMessage", "id": id, "text": text })
}

pub fn reasoning_item(id: &str, text: &str) -> Value {
    json!({ "type": "reasoning", "id": id, "summary": [text] })
}

pub fn command_item(id: &str, command: &str, status: &str) -> Value {
    json!({ "type": "commandExecution", "id": id, "command": command, "status": status })
}

pub fn tool_item(id: &str, tool: &str, status: &str) -> Value {
    json!({ "type": "mcpToolCall", "id": id, "server": "local", "tool": tool, "status": status })
}
