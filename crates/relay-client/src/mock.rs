use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use relay_core::api::{EventByteStream, HapiApi};
use relay_core::errors::RelayError;
use relay_core::ids::{RequestId, SessionId};
use relay_core::session::{Message, Session};

/// What the next `subscribe_events` call produces.
pub enum MockSubscription {
    /// The subscribe call itself fails.
    Fail(RelayError),
    /// Yield the chunks, then end the stream (server closed it).
    Chunks(Vec<Bytes>),
    /// Yield the chunks, then stay open forever.
    Open(Vec<Bytes>),
}

impl MockSubscription {
    /// One `data:` line per event, ending the stream afterwards.
    pub fn events(events: &[Value]) -> Self {
        Self::Chunks(events.iter().map(data_line).collect())
    }

    /// Like [`events`](Self::events) but the stream stays open.
    pub fn open_events(events: &[Value]) -> Self {
        Self::Open(events.iter().map(data_line).collect())
    }
}

fn data_line(event: &Value) -> Bytes {
    Bytes::from(format!("data: {event}\n\n"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

/// Scripted, in-memory [`HapiApi`] for deterministic tests without a server.
///
/// Once the subscription script is exhausted, further subscriptions stay
/// open without yielding anything.
#[derive(Default)]
pub struct MockApi {
    sessions: Mutex<Vec<Session>>,
    messages: Mutex<HashMap<SessionId, Vec<Message>>>,
    failing: Mutex<HashSet<SessionId>>,
    rejected_requests: Mutex<HashSet<RequestId>>,
    subscriptions: Mutex<VecDeque<MockSubscription>>,
    subscribe_count: AtomicUsize,
    message_fetches: Mutex<Vec<(SessionId, u32)>>,
    decisions: Mutex<Vec<(Decision, SessionId, RequestId)>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sessions(&self, sessions: Vec<Session>) {
        *self.sessions.lock() = sessions;
    }

    pub fn push_message(&self, session_id: &SessionId, seq: u64, content: Value) {
        self.messages
            .lock()
            .entry(session_id.clone())
            .or_default()
            .push(Message { seq, content });
    }

    /// Message and session fetches for this session fail until recovered.
    pub fn fail_session(&self, session_id: &SessionId) {
        self.failing.lock().insert(session_id.clone());
    }

    pub fn recover_session(&self, session_id: &SessionId) {
        self.failing.lock().remove(session_id);
    }

    /// Approve/deny calls for this request id fail.
    pub fn reject_request(&self, request_id: &RequestId) {
        self.rejected_requests.lock().insert(request_id.clone());
    }

    pub fn script_subscription(&self, subscription: MockSubscription) {
        self.subscriptions.lock().push_back(subscription);
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::Relaxed)
    }

    /// Every `fetch_messages` call so far, with its limit.
    pub fn message_fetches(&self) -> Vec<(SessionId, u32)> {
        self.message_fetches.lock().clone()
    }

    pub fn message_fetches_for(&self, session_id: &SessionId) -> usize {
        self.message_fetches
            .lock()
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .count()
    }

    pub fn decisions(&self) -> Vec<(Decision, SessionId, RequestId)> {
        self.decisions.lock().clone()
    }

    fn check_failing(&self, session_id: &SessionId) -> Result<(), RelayError> {
        if self.failing.lock().contains(session_id) {
            return Err(RelayError::ServerError {
                status: 503,
                body: format!("mock failure for {session_id}"),
            });
        }
        Ok(())
    }

    fn decide(
        &self,
        decision: Decision,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        if self.rejected_requests.lock().contains(request_id) {
            return Err(RelayError::NotFound(format!("request {request_id}")));
        }
        self.decisions
            .lock()
            .push((decision, session_id.clone(), request_id.clone()));
        Ok(())
    }
}

#[async_trait]
impl HapiApi for MockApi {
    async fn fetch_sessions(&self) -> Result<Vec<Session>, RelayError> {
        Ok(self.sessions.lock().clone())
    }

    async fn fetch_session(&self, session_id: &SessionId) -> Result<Session, RelayError> {
        self.check_failing(session_id)?;
        self.sessions
            .lock()
            .iter()
            .find(|s| &s.id == session_id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("session {session_id}")))
    }

    async fn fetch_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<Message>, RelayError> {
        self.message_fetches
            .lock()
            .push((session_id.clone(), limit));
        self.check_failing(session_id)?;

        let mut all = self
            .messages
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        all.sort_by_key(|m| m.seq);
        let skip = all.len().saturating_sub(limit as usize);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn subscribe_events(&self) -> Result<EventByteStream, RelayError> {
        let _ = self.subscribe_count.fetch_add(1, Ordering::Relaxed);
        let next = self.subscriptions.lock().pop_front();
        match next {
            Some(MockSubscription::Fail(e)) => Err(e),
            Some(MockSubscription::Chunks(chunks)) => Ok(Box::pin(stream::iter(
                chunks.into_iter().map(Ok::<Bytes, RelayError>),
            ))),
            Some(MockSubscription::Open(chunks)) => Ok(Box::pin(
                stream::iter(chunks.into_iter().map(Ok::<Bytes, RelayError>))
                    .chain(stream::pending()),
            )),
            None => Ok(Box::pin(stream::pending::<Result<Bytes, RelayError>>())),
        }
    }

    async fn approve_request(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        self.decide(Decision::Approve, session_id, request_id)
    }

    async fn deny_request(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        self.decide(Decision::Deny, session_id, request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn messages_return_latest_window_ascending() {
        let api = MockApi::new();
        let sid = SessionId::from("s1");
        for seq in [3, 1, 2, 5, 4] {
            api.push_message(&sid, seq, json!({"role": "agent", "content": "x"}));
        }
        let window = api.fetch_messages(&sid, 2).await.unwrap();
        let seqs: Vec<u64> = window.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(api.message_fetches(), vec![(sid, 2)]);
    }

    #[tokio::test]
    async fn failing_session_errors_until_recovered() {
        let api = MockApi::new();
        let sid = SessionId::from("s1");
        api.fail_session(&sid);
        assert!(api.fetch_messages(&sid, 1).await.is_err());
        api.recover_session(&sid);
        assert!(api.fetch_messages(&sid, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scripted_subscriptions_in_order() {
        let api = MockApi::new();
        api.script_subscription(MockSubscription::Fail(RelayError::NetworkError("down".into())));
        api.script_subscription(MockSubscription::events(&[json!({"type": "ping"})]));

        assert!(api.subscribe_events().await.is_err());
        let chunks: Vec<_> = api.subscribe_events().await.unwrap().collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].as_ref().unwrap(),
            &Bytes::from("data: {\"type\":\"ping\"}\n\n")
        );
        assert_eq!(api.subscribe_count(), 2);
    }

    #[tokio::test]
    async fn decisions_are_recorded() {
        let api = MockApi::new();
        let sid = SessionId::from("s1");
        api.approve_request(&sid, &RequestId::from("r1")).await.unwrap();
        api.reject_request(&RequestId::from("r2"));
        assert!(api.deny_request(&sid, &RequestId::from("r2")).await.is_err());
        assert_eq!(
            api.decisions(),
            vec![(Decision::Approve, sid, RequestId::from("r1"))]
        );
    }
}
