//! Multi-thread session host: open/resume, background refresh, live event
//! feed, and the presentation surface.

use crate::config::SessionConfig;
use crate::coordinator::{OpenCoordinator, OpenToken};
use crate::error::SessionError;
use crate::refresh::{attempt_budget, RefreshStop, StallDetector};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use threadline_contract::{
    decode_notification, decode_snapshot, Attachment, ClientError, Message, Snapshot,
    ThreadClient, ThreadNotification, TurnInput,
};
use threadline_reconcile::{ConversationState, EventOutcome, MergeOutcome};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// How an open treats local state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Plain open; the snapshot order wins unless the remote visibly lags.
    #[default]
    Open,
    /// Reopen after a dropped connection; local-only rows are preserved.
    Reconnect,
}

/// Result of [`ThreadSessions::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened {
        /// `None` when the snapshot was discarded as stale.
        merge: Option<MergeOutcome>,
        stale_resume_missing_active_turn: bool,
        refresh_attempts: u32,
    },
    /// The fetch failed; the last local transcript stays in place.
    Fallback { reason: String },
    /// A newer open replaced this one before it finished.
    Superseded,
}

/// Snapshot of what the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranscriptView {
    pub thread_id: Option<String>,
    pub messages: Vec<Message>,
    pub active_turn_id: Option<String>,
}

impl TranscriptView {
    pub fn has_active_turn(&self) -> bool {
        self.active_turn_id.is_some()
    }
}

struct HostState {
    current: Option<String>,
    threads: HashMap<String, ConversationState>,
    coordinator: OpenCoordinator,
    /// Token of the open whose refresh loop is running.
    refresh: Option<OpenToken>,
}

struct Inner {
    client: Arc<dyn ThreadClient>,
    config: SessionConfig,
    host: Mutex<HostState>,
    view_tx: watch::Sender<TranscriptView>,
}

/// Hosts one reconciled conversation per thread id and drives them from
/// remote fetches and live notifications.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ThreadSessions {
    inner: Arc<Inner>,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl ThreadSessions {
    pub fn new(client: Arc<dyn ThreadClient>, config: SessionConfig) -> Self {
        let (view_tx, _) = watch::channel(TranscriptView::default());
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                host: Mutex::new(HostState {
                    current: None,
                    threads: HashMap::new(),
                    coordinator: OpenCoordinator::new(),
                    refresh: None,
                }),
                view_tx,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Observe the current transcript.
    pub fn subscribe(&self) -> watch::Receiver<TranscriptView> {
        self.inner.view_tx.subscribe()
    }

    pub fn view(&self) -> TranscriptView {
        self.inner.view_tx.borrow().clone()
    }

    pub async fn current_thread(&self) -> Option<String> {
        self.inner.host.lock().await.current.clone()
    }

    /// Open (or reopen) `thread_id` and make it current.
    ///
    /// Loaded threads are attached and read; others are resumed. Either way
    /// the snapshot goes through the same merge, followed by a background
    /// refresh loop.
    pub async fn open(&self, thread_id: &str, mode: OpenMode) -> OpenOutcome {
        let token = {
            let mut host = self.inner.host.lock().await;
            if let Some(refresh) = host.refresh.take() {
                refresh.cancellation().cancel();
            }
            host.current = Some(thread_id.to_string());
            let reconcile = self.inner.config.reconcile.clone();
            host.threads
                .entry(thread_id.to_string())
                .or_insert_with(|| ConversationState::new(thread_id, reconcile));
            let token = host.coordinator.begin(thread_id);
            self.inner.publish(&host);
            token
        };

        let fetched = tokio::select! {
            _ = token.cancellation().cancelled() => {
                debug!(thread_id, generation = token.generation(), "open cancelled");
                return OpenOutcome::Superseded;
            }
            fetched = self.inner.fetch(thread_id) => fetched,
        };

        let mut host = self.inner.host.lock().await;
        if !host.coordinator.is_current(&token) {
            debug!(thread_id, generation = token.generation(), "dropping superseded open");
            return OpenOutcome::Superseded;
        }
        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(thread_id, error = %e, "open failed; keeping local transcript");
                return OpenOutcome::Fallback {
                    reason: e.to_string(),
                };
            }
        };
        let Some(state) = host.threads.get_mut(thread_id) else {
            return OpenOutcome::Superseded;
        };

        let now = now();
        let attempts = attempt_budget(&self.inner.config.refresh, &snapshot, state, now);
        let applied = state.apply_snapshot(&snapshot, mode == OpenMode::Reconnect, now);
        self.inner.publish(&host);

        host.refresh = Some(token.clone());
        tokio::spawn(Inner::refresh_loop(
            Arc::clone(&self.inner),
            token,
            attempts,
            snapshot.item_count(),
        ));

        OpenOutcome::Opened {
            merge: applied.outcome,
            stale_resume_missing_active_turn: applied.stale_resume_missing_active_turn,
            refresh_attempts: attempts,
        }
    }

    /// Send a prompt on the current thread and return the new turn id.
    pub async fn send(
        &self,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<String, SessionError> {
        let thread_id = {
            let mut host = self.inner.host.lock().await;
            let thread_id = host.current.clone().ok_or(SessionError::NoActiveThread)?;
            let state = host
                .threads
                .get_mut(&thread_id)
                .ok_or(SessionError::NoActiveThread)?;
            if let Some(turn_id) = state.active_turn_id() {
                return Err(SessionError::TurnAlreadyActive(turn_id.to_string()));
            }
            if state.tracker().pending_message().is_some() {
                return Err(SessionError::TurnAlreadyActive("pending".to_string()));
            }
            state.begin_local_turn(text, attachments.clone())?;
            self.inner.publish(&host);
            thread_id
        };

        let input = TurnInput {
            text: text.to_string(),
            attachments,
        };
        let started = self.inner.client.start_turn(&thread_id, &input).await;

        let mut host = self.inner.host.lock().await;
        let Some(state) = host.threads.get_mut(&thread_id) else {
            return Err(SessionError::Superseded);
        };
        match started {
            Ok(turn_id) => {
                state.bind_started_turn(&turn_id, now());
                self.inner.publish(&host);
                Ok(turn_id)
            }
            Err(e) => {
                warn!(%thread_id, error = %e, "start turn failed");
                state.abandon_local_turn(&e.to_string());
                self.inner.publish(&host);
                Err(e.into())
            }
        }
    }

    /// Ask the remote to interrupt the running turn. Returns `false` when
    /// nothing is running. The turn ends when its completion event arrives.
    pub async fn interrupt(&self) -> Result<bool, SessionError> {
        let (thread_id, turn_id) = {
            let host = self.inner.host.lock().await;
            let thread_id = host.current.clone().ok_or(SessionError::NoActiveThread)?;
            let turn_id = host
                .threads
                .get(&thread_id)
                .and_then(|s| s.active_turn_id())
                .map(str::to_string);
            (thread_id, turn_id)
        };
        let Some(turn_id) = turn_id else {
            return Ok(false);
        };
        self.inner
            .client
            .interrupt_turn(&thread_id, &turn_id)
            .await?;
        Ok(true)
    }

    /// Archive the current thread remotely and forget it locally.
    pub async fn archive(&self) -> Result<(), SessionError> {
        let thread_id = self
            .current_thread()
            .await
            .ok_or(SessionError::NoActiveThread)?;
        self.inner.client.archive_thread(&thread_id).await?;
        self.reset(&thread_id).await;
        Ok(())
    }

    /// Drop all local state for `thread_id`.
    pub async fn reset(&self, thread_id: &str) {
        let mut host = self.inner.host.lock().await;
        host.threads.remove(thread_id);
        if host.current.as_deref() == Some(thread_id) {
            host.current = None;
            host.coordinator.cancel_current();
            if let Some(refresh) = host.refresh.take() {
                refresh.cancellation().cancel();
            }
        }
        self.inner.publish(&host);
    }

    /// Apply one live notification. Notifications for any thread other
    /// than the current one are dropped.
    pub async fn apply_notification(
        &self,
        notification: &ThreadNotification,
    ) -> Option<EventOutcome> {
        let mut host = self.inner.host.lock().await;
        if host.current.as_deref() != Some(notification.thread_id.as_str()) {
            debug!(thread_id = %notification.thread_id, "dropping notification for another thread");
            return None;
        }
        let state = host.threads.get_mut(&notification.thread_id)?;
        let outcome = state.apply_event(&notification.event, now());
        self.inner.publish(&host);
        Some(outcome)
    }

    /// Decode and apply a raw wire notification.
    pub async fn apply_wire_notification(
        &self,
        method: &str,
        params: &Value,
    ) -> Option<EventOutcome> {
        match decode_notification(method, params) {
            Ok(Some(notification)) => self.apply_notification(&notification).await,
            Ok(None) => None,
            Err(e) => {
                warn!(method, error = %e, "dropping malformed notification");
                None
            }
        }
    }

    /// Apply a notification stream strictly in arrival order until it ends.
    pub async fn run_event_feed<S>(&self, feed: S)
    where
        S: Stream<Item = ThreadNotification> + Send,
    {
        futures::pin_mut!(feed);
        while let Some(notification) = feed.next().await {
            self.apply_notification(&notification).await;
        }
    }
}

impl Inner {
    async fn fetch(&self, thread_id: &str) -> Result<Snapshot, ClientError> {
        let loaded = self.client.list_loaded_threads().await?;
        let raw = if loaded.iter().any(|id| id == thread_id) {
            self.client.attach_listener(thread_id).await?;
            self.client.read_thread(thread_id).await?
        } else {
            self.client.resume_thread(thread_id).await?
        };
        Ok(decode_snapshot(&raw)?)
    }

    fn publish(&self, host: &HostState) {
        let view = match host.current.as_ref() {
            Some(thread_id) => match host.threads.get(thread_id) {
                Some(state) => TranscriptView {
                    thread_id: Some(thread_id.clone()),
                    messages: state.messages().to_vec(),
                    active_turn_id: state.active_turn_id().map(str::to_string),
                },
                None => TranscriptView {
                    thread_id: Some(thread_id.clone()),
                    ..TranscriptView::default()
                },
            },
            None => TranscriptView::default(),
        };
        self.view_tx.send_replace(view);
    }

    async fn refresh_loop(
        self: Arc<Self>,
        token: OpenToken,
        attempts: u32,
        items: usize,
    ) -> RefreshStop {
        let thread_id = token.thread_id().to_string();
        let mut stalls = StallDetector::new(&self.config, items);
        for attempt in 1..=attempts {
            let stop = self.refresh_once(&token, &mut stalls).await;
            if let Some(stop) = stop {
                debug!(%thread_id, attempt, ?stop, "refresh loop stopped");
                return stop;
            }
        }
        debug!(%thread_id, attempts, "refresh budget exhausted");
        RefreshStop::Exhausted
    }

    async fn refresh_once(
        &self,
        token: &OpenToken,
        stalls: &mut StallDetector,
    ) -> Option<RefreshStop> {
        let cancel = token.cancellation();
        tokio::select! {
            _ = cancel.cancelled() => return Some(RefreshStop::Cancelled),
            _ = tokio::time::sleep(self.config.refresh_interval) => {}
        }
        if !self.client.is_connected() {
            return Some(RefreshStop::Disconnected);
        }
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Some(RefreshStop::Cancelled),
            fetched = self.client.read_thread(token.thread_id()) => fetched,
        };
        let decoded =
            fetched.and_then(|raw| decode_snapshot(&raw).map_err(ClientError::from));
        let snapshot = match decoded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let stop = RefreshStop::for_fetch_error(&e);
                if stop == RefreshStop::Disconnected {
                    debug!(thread_id = token.thread_id(), "connection dropped during refresh");
                } else {
                    warn!(thread_id = token.thread_id(), error = %e, "refresh fetch failed");
                }
                return Some(stop);
            }
        };

        let mut host = self.host.lock().await;
        if !host.coordinator.is_current(token) {
            return Some(RefreshStop::Superseded);
        }
        let Some(state) = host.threads.get_mut(token.thread_id()) else {
            return Some(RefreshStop::Superseded);
        };
        state.apply_snapshot(&snapshot, true, now());
        self.publish(&host);

        if snapshot.active_turn_id.is_some() {
            return Some(RefreshStop::TurnActive);
        }
        if stalls.observe(snapshot.item_count()) {
            return Some(RefreshStop::Stalled);
        }
        None
    }
}
