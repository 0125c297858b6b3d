//! # Event Reconciliation
//!
//! Consumes the `session-updated` feed and decides what to tell the user:
//!
//! - new approval requests, diffed per session against the last seen set
//! - task completion (thinking → idle while active with nothing pending)
//! - new messages, fetched in debounced batches and filtered by
//!   [`OutputLevel`]
//!
//! Per-session cursors (`last_seq`) and the pending-approval table live under
//! one mutex shared by the ingestion loop and the debounce task. The lock is
//! never held across an await.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_client::SseEventStream;
use relay_core::api::HapiApi;
use relay_core::errors::RelayError;
use relay_core::ids::{RequestId, SessionId};
use relay_core::output::OutputLevel;
use relay_core::session::{Field, Message, RequestSet, Role, SessionEvent, SessionPatch};

use crate::backoff::{Backoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::cache::SessionCache;
use crate::format::{
    approval_notice, completion_notice, flatten_pending, format_agent_line, format_request_detail,
    message_notice,
};
use crate::notifier::NotificationSink;
use crate::preview::{extract_preview, PreviewMode};

/// Tunables for the reconciliation engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Coalescing window for message refreshes.
    pub debounce: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Message window fetched per refresh in `detail` mode.
    pub detail_fetch_limit: u32,
    /// Message window fetched per refresh in `simple` mode.
    pub simple_fetch_limit: u32,
    /// Preview length for `detail` lines, in characters.
    pub preview_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            backoff_base: DEFAULT_BASE_DELAY,
            backoff_max: DEFAULT_MAX_DELAY,
            detail_fetch_limit: 20,
            simple_fetch_limit: 50,
            preview_len: 500,
        }
    }
}

/// Counters since the engine was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub events_handled: u64,
    pub notifications: u64,
    pub connects: u64,
    pub refreshes: u64,
}

/// Result of one approve/deny call from a bulk decision.
#[derive(Debug)]
pub struct DecisionOutcome {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub tool: String,
    pub result: Result<(), RelayError>,
}

#[derive(Clone, Copy, Debug)]
enum Verdict {
    Approve,
    Deny,
}

#[derive(Clone, Copy, Debug, Default)]
struct SessionTrack {
    active: bool,
    thinking: bool,
    last_seq: u64,
}

#[derive(Default)]
struct EngineState {
    sessions: HashMap<SessionId, SessionTrack>,
    pending: BTreeMap<SessionId, RequestSet>,
}

#[derive(Default)]
struct RefreshQueue {
    sessions: BTreeSet<SessionId>,
    scheduled: bool,
}

#[derive(Default)]
struct Counters {
    events_handled: AtomicU64,
    notifications: AtomicU64,
    connects: AtomicU64,
    refreshes: AtomicU64,
}

struct Shared {
    api: Arc<dyn HapiApi>,
    cache: SessionCache,
    sink: Arc<dyn NotificationSink>,
    config: EngineConfig,
    level: RwLock<OutputLevel>,
    state: Mutex<EngineState>,
    queue: Mutex<RefreshQueue>,
    /// Token of the current run; debounce tasks stop with it.
    cancel: Mutex<CancellationToken>,
    counters: Counters,
}

/// Reconciles the session event feed into notifications.
pub struct ReconcileEngine {
    shared: Arc<Shared>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ReconcileEngine {
    pub fn new(
        api: Arc<dyn HapiApi>,
        cache: SessionCache,
        sink: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                cache,
                sink,
                config,
                level: RwLock::new(OutputLevel::default()),
                state: Mutex::new(EngineState::default()),
                queue: Mutex::new(RefreshQueue::default()),
                cancel: Mutex::new(CancellationToken::new()),
                counters: Counters::default(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &SessionCache {
        &self.shared.cache
    }

    pub fn output_level(&self) -> OutputLevel {
        *self.shared.level.read()
    }

    pub fn set_output_level(&self, level: OutputLevel) {
        let previous = std::mem::replace(&mut *self.shared.level.write(), level);
        if previous != level {
            info!(from = %previous, to = %level, "output level changed");
        }
    }

    /// Process one decoded stream event.
    pub async fn handle_event(&self, event: SessionEvent) {
        self.shared.handle_event(event).await;
    }

    /// Deep copy of every pending approval, keyed by session.
    pub fn all_pending(&self) -> BTreeMap<SessionId, RequestSet> {
        self.shared.state.lock().pending.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.values().map(RequestSet::len).sum()
    }

    /// The last message sequence already surfaced for a session.
    pub fn cursor(&self, session_id: &SessionId) -> Option<u64> {
        self.shared
            .state
            .lock()
            .sessions
            .get(session_id)
            .map(|t| t.last_seq)
    }

    /// Seed pending approvals from the cached session listing.
    ///
    /// Only sessions reporting a non-zero pending count are fetched. Returns
    /// how many requests were loaded.
    pub async fn load_existing_pending(&self) -> usize {
        let candidates: Vec<SessionId> = self
            .shared
            .cache
            .snapshot()
            .into_iter()
            .filter(|s| s.pending_requests_count > 0)
            .map(|s| s.id)
            .collect();

        let mut loaded = 0;
        for session_id in candidates {
            match self.shared.api.fetch_session(&session_id).await {
                Ok(session) => {
                    let requests = session
                        .agent_state
                        .map(|state| state.requests())
                        .unwrap_or_default();
                    if requests.is_empty() {
                        continue;
                    }
                    info!(session_id = %session_id, count = requests.len(), "loaded pending approvals");
                    loaded += requests.len();
                    self.shared.state.lock().pending.insert(session_id, requests);
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "failed to load pending approvals");
                }
            }
        }
        loaded
    }

    /// Spawn the subscription loop. A second call while running is ignored.
    pub fn start(&self, level: OutputLevel) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("engine already running");
            return;
        }
        self.set_output_level(level);

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = cancel.clone();
        let handle = tokio::spawn(Arc::clone(&self.shared).run(cancel.clone()));
        *task = Some((cancel, handle));
        info!(level = %level, "engine started");
    }

    /// Cancel the loop and wait for it to wind down.
    pub async fn stop(&self) {
        let running = self.task.lock().take();
        let Some((cancel, handle)) = running else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "engine task ended abnormally");
        }
        info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub async fn approve(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        self.shared.decide(Verdict::Approve, session_id, request_id).await
    }

    pub async fn deny(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        self.shared.decide(Verdict::Deny, session_id, request_id).await
    }

    pub async fn approve_all_pending(&self) -> Vec<DecisionOutcome> {
        self.decide_all(Verdict::Approve).await
    }

    pub async fn deny_all_pending(&self) -> Vec<DecisionOutcome> {
        self.decide_all(Verdict::Deny).await
    }

    async fn decide_all(&self, verdict: Verdict) -> Vec<DecisionOutcome> {
        let snapshot = self.all_pending();
        let items: Vec<(SessionId, RequestId, String)> = flatten_pending(&snapshot)
            .into_iter()
            .map(|(sid, rid, req)| (sid.clone(), rid.clone(), req.tool_name().to_string()))
            .collect();

        let mut outcomes = Vec::with_capacity(items.len());
        for (session_id, request_id, tool) in items {
            let result = self.shared.decide(verdict, &session_id, &request_id).await;
            outcomes.push(DecisionOutcome {
                session_id,
                request_id,
                tool,
                result,
            });
        }
        outcomes
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.shared.counters;
        EngineStats {
            events_handled: c.events_handled.load(Ordering::Relaxed),
            notifications: c.notifications.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
            refreshes: c.refreshes.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        info!("event loop started");

        loop {
            let subscribed = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.api.subscribe_events() => result,
            };

            match subscribed {
                Ok(raw) => {
                    backoff.reset();
                    let _ = self.counters.connects.fetch_add(1, Ordering::Relaxed);
                    info!("event stream connected");

                    let mut events = SseEventStream::new(raw);
                    loop {
                        let next = tokio::select! {
                            () = cancel.cancelled() => {
                                info!("event loop cancelled");
                                return;
                            }
                            next = events.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => self.handle_event(event).await,
                            Some(Err(e)) => {
                                warn!(error = %e, "event stream interrupted");
                                break;
                            }
                            None => {
                                info!("event stream closed by server");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, kind = e.error_kind(), "event subscription failed");
                }
            }

            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        info!("event loop stopped");
    }

    #[instrument(skip_all)]
    async fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        let SessionEvent::SessionUpdated { session_id, data } = event else {
            return;
        };
        let _ = self.counters.events_handled.fetch_add(1, Ordering::Relaxed);
        let _ = self.cache.apply_patch(&session_id, &data);

        let known = self.state.lock().sessions.contains_key(&session_id);
        if !known {
            let last_seq = self.latest_seq(&session_id).await;
            debug!(session_id = %session_id, last_seq, "tracking new session");
            let _ = self
                .state
                .lock()
                .sessions
                .entry(session_id.clone())
                .or_insert(SessionTrack {
                    last_seq,
                    ..Default::default()
                });
        }

        let (active, thinking, was_thinking) = self.apply_flags(&session_id, &data);

        self.reconcile_requests(&session_id, &data).await;

        if self.level().pushes_messages() && (active || thinking) {
            self.schedule_refresh(session_id.clone());
        }

        if active && was_thinking && !thinking {
            let pending_here = self
                .state
                .lock()
                .pending
                .get(&session_id)
                .map_or(0, RequestSet::len);
            if pending_here == 0 {
                let label = self.cache.label_short(&session_id);
                self.notify(&completion_notice(&label), &session_id).await;
            }
        }
    }

    /// Update tracked flags; returns `(active, thinking, previous thinking)`.
    fn apply_flags(&self, session_id: &SessionId, data: &SessionPatch) -> (bool, bool, bool) {
        let mut state = self.state.lock();
        let track = state.sessions.entry(session_id.clone()).or_default();
        let was_thinking = track.thinking;
        track.active = data.active.resolve(track.active, false);
        track.thinking = data.thinking.resolve(track.thinking, false);
        (track.active, track.thinking, was_thinking)
    }

    /// Replace the session's request set and announce ids not seen before.
    async fn reconcile_requests(&self, session_id: &SessionId, data: &SessionPatch) {
        let Field::Set(agent_state) = &data.agent_state else {
            return;
        };
        let requests = agent_state.requests();

        let (new_ids, total) = {
            let mut state = self.state.lock();
            let previous = state.pending.get(session_id);
            let new_ids: Vec<RequestId> = requests
                .keys()
                .filter(|id| previous.map_or(true, |p| !p.contains_key(*id)))
                .cloned()
                .collect();
            if requests.is_empty() {
                let _ = state.pending.remove(session_id);
            } else {
                let _ = state.pending.insert(session_id.clone(), requests.clone());
            }
            let total: usize = state.pending.values().map(RequestSet::len).sum();
            (new_ids, total)
        };

        if new_ids.is_empty() {
            return;
        }
        let label = self.cache.label_short(session_id);
        for request_id in new_ids {
            let Some(request) = requests.get(&request_id) else {
                continue;
            };
            info!(
                session_id = %session_id,
                request_id = %request_id,
                tool = request.tool_name(),
                "approval requested"
            );
            let text = approval_notice(&label, &format_request_detail(request), total);
            self.notify(&text, session_id).await;
        }
    }

    fn schedule_refresh(self: &Arc<Self>, session_id: SessionId) {
        let mut queue = self.queue.lock();
        let _ = queue.sessions.insert(session_id);
        if queue.scheduled {
            return;
        }
        queue.scheduled = true;

        let shared = Arc::clone(self);
        let cancel = self.cancel.lock().clone();
        let _ = tokio::spawn(shared.debounced_refresh(cancel));
    }

    async fn debounced_refresh(self: Arc<Self>, cancel: CancellationToken) {
        tokio::select! {
            () = cancel.cancelled() => {
                let mut queue = self.queue.lock();
                queue.sessions.clear();
                queue.scheduled = false;
                return;
            }
            () = tokio::time::sleep(self.config.debounce) => {}
        }

        let batch: Vec<SessionId> = {
            let mut queue = self.queue.lock();
            queue.scheduled = false;
            std::mem::take(&mut queue.sessions).into_iter().collect()
        };
        debug!(sessions = batch.len(), "refreshing batched sessions");
        for session_id in batch {
            self.refresh_session(&session_id).await;
        }
    }

    /// Fetch recent messages and push the ones past the cursor.
    async fn refresh_session(&self, session_id: &SessionId) {
        let level = self.level();
        let limit = match level {
            OutputLevel::Silence => return,
            OutputLevel::Simple => self.config.simple_fetch_limit,
            OutputLevel::Detail => self.config.detail_fetch_limit,
        };

        let messages = match self.api.fetch_messages(session_id, limit).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "message refresh failed");
                return;
            }
        };
        let _ = self.counters.refreshes.fetch_add(1, Ordering::Relaxed);

        // Select and advance together so overlapping refreshes never
        // surface the same sequence twice.
        let mut fresh: Vec<Message> = {
            let mut state = self.state.lock();
            let Some(track) = state.sessions.get_mut(session_id) else {
                return;
            };
            let cursor = track.last_seq;
            if let Some(max_seq) = messages.iter().map(|m| m.seq).max() {
                track.last_seq = cursor.max(max_seq);
            }
            messages.into_iter().filter(|m| m.seq > cursor).collect()
        };
        fresh.sort_by_key(|m| m.seq);

        let lines = match level {
            OutputLevel::Detail => self.detail_lines(&fresh),
            OutputLevel::Simple => simple_lines(&fresh),
            OutputLevel::Silence => Vec::new(),
        };
        if lines.is_empty() {
            return;
        }
        let label = self.cache.label_short(session_id);
        self.notify(&message_notice(&label, &lines), session_id).await;
    }

    fn detail_lines(&self, messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .filter(|m| m.role() != Role::User)
            .filter_map(|m| extract_preview(&m.content, self.config.preview_len, PreviewMode::Feed))
            .map(|text| format_agent_line(&text))
            .collect()
    }

    async fn latest_seq(&self, session_id: &SessionId) -> u64 {
        match self.api.fetch_messages(session_id, 1).await {
            Ok(messages) => messages.iter().map(|m| m.seq).max().unwrap_or(0),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "could not read latest sequence, starting at 0");
                0
            }
        }
    }

    async fn decide(
        &self,
        verdict: Verdict,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        let result = match verdict {
            Verdict::Approve => self.api.approve_request(session_id, request_id).await,
            Verdict::Deny => self.api.deny_request(session_id, request_id).await,
        };
        if let Err(e) = &result {
            warn!(session_id = %session_id, request_id = %request_id, ?verdict, error = %e, "decision failed");
        }
        result?;

        // Pending sets only change when the server reports a new request set.
        info!(session_id = %session_id, request_id = %request_id, ?verdict, "decision sent");
        Ok(())
    }

    fn level(&self) -> OutputLevel {
        *self.level.read()
    }

    async fn notify(&self, text: &str, session_id: &SessionId) {
        let _ = self.counters.notifications.fetch_add(1, Ordering::Relaxed);
        self.sink.notify(text, session_id).await;
    }
}

/// Plain agent text only; tool traffic and bracketed markers are dropped.
fn simple_lines(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.role() == Role::Agent)
        .filter_map(|m| extract_preview(&m.content, 0, PreviewMode::Grouped))
        .filter(|text| !text.starts_with('['))
        .map(|text| format!("[Message]: {text}"))
        .collect()
}
