use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::errors::RelayError;
use crate::ids::{RequestId, SessionId};
use crate::session::{Message, Session};

/// Raw body chunks of the event stream, before line framing.
pub type EventByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

/// The slice of the session API the reconciliation engine depends on.
///
/// The HTTP client implements it for real traffic; tests substitute a
/// scripted double.
#[async_trait]
pub trait HapiApi: Send + Sync {
    async fn fetch_sessions(&self) -> Result<Vec<Session>, RelayError>;

    /// Single session including its agent state.
    async fn fetch_session(&self, session_id: &SessionId) -> Result<Session, RelayError>;

    /// The latest `limit` messages in ascending seq order.
    async fn fetch_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<Message>, RelayError>;

    /// Open the event stream. The returned stream ends when the server closes it.
    async fn subscribe_events(&self) -> Result<EventByteStream, RelayError>;

    async fn approve_request(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError>;

    async fn deny_request(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError>;
}
