//! Notification fan-out.
//!
//! The engine hands finished texts to a [`NotificationSink`]. The
//! [`Notifier`] sink splits long texts into chunks and delivers them to
//! every registered [`Observer`]. One failing observer never blocks the
//! others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, warn};

use relay_core::ids::SessionId;

pub const DEFAULT_CHUNK_LEN: usize = 4200;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Receives the engine's notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `text` about `session_id`. Never fails from the caller's view.
    async fn notify(&self, text: &str, session_id: &SessionId);
}

/// One delivery target (a chat, a webhook, the console).
#[async_trait]
pub trait Observer: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, chunk: &str, session_id: &SessionId) -> Result<(), NotifyError>;
}

/// Chunking fan-out over registered observers.
pub struct Notifier {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    chunk_len: usize,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Notifier {
    pub fn new(chunk_len: usize) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            chunk_len,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        debug!(observer = observer.name(), "observer registered");
        self.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Chunks delivered successfully so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Deliveries abandoned after an observer error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_LEN)
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn notify(&self, text: &str, session_id: &SessionId) {
        let chunks = split_message(text, self.chunk_len);
        // Snapshot so a slow observer never holds the lock.
        let observers: Vec<Arc<dyn Observer>> = self.observers.read().clone();

        for observer in observers {
            for chunk in &chunks {
                match observer.deliver(chunk, session_id).await {
                    Ok(()) => {
                        let _ = self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let _ = self.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            observer = observer.name(),
                            session_id = %session_id,
                            error = %e,
                            "notification delivery failed"
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Split `text` into chunks of at most `max_len` characters on line
/// boundaries. A single line longer than `max_len` is cut on character
/// boundaries. `max_len == 0` disables splitting.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current: Option<(String, usize)> = None;

    for line in text.split('\n') {
        for piece in hard_split(line, max_len) {
            let piece_len = piece.chars().count();
            current = match current.take() {
                Some((buf, len)) if len + 1 + piece_len > max_len => {
                    chunks.push(buf);
                    Some((piece, piece_len))
                }
                Some((mut buf, len)) => {
                    buf.push('\n');
                    buf.push_str(&piece);
                    Some((buf, len + 1 + piece_len))
                }
                None => Some((piece, piece_len)),
            };
        }
    }
    if let Some((buf, _)) = current {
        chunks.push(buf);
    }
    chunks
}

fn hard_split(line: &str, max_len: usize) -> Vec<String> {
    if line.chars().count() <= max_len {
        return vec![line.to_string()];
    }
    let chars: Vec<char> = line.chars().collect();
    chars.chunks(max_len).map(|c| c.iter().collect()).collect()
}

/// Prints notifications to stdout.
#[derive(Debug, Default)]
pub struct ConsoleObserver;

#[async_trait]
impl Observer for ConsoleObserver {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, chunk: &str, _session_id: &SessionId) -> Result<(), NotifyError> {
        println!("{chunk}\n");
        Ok(())
    }
}

/// POSTs `{text, sessionId}` to a URL.
pub struct WebhookObserver {
    name: String,
    url: String,
    http: reqwest::Client,
}

impl WebhookObserver {
    pub fn new(name: impl Into<String>, url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Observer for WebhookObserver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, chunk: &str, session_id: &SessionId) -> Result<(), NotifyError> {
        let resp = self
            .http
            .post(&self.url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&json!({ "text": chunk, "sessionId": session_id }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recording {
        chunks: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Observer for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, chunk: &str, _session_id: &SessionId) -> Result<(), NotifyError> {
            self.chunks.lock().push(chunk.to_string());
            if self.fail {
                return Err(NotifyError::Delivery("chat offline".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("a\nb", 10), vec!["a\nb"]);
        assert_eq!(split_message("abc", 0), vec!["abc"]);
    }

    #[test]
    fn splits_on_line_boundaries() {
        let chunks = split_message("aaaa\nbbbb\ncc", 9);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cc"]);
    }

    #[test]
    fn overlong_line_is_hard_split() {
        let chunks = split_message("ab\nééééééé", 3);
        assert_eq!(chunks, vec!["ab", "ééé", "ééé", "é"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
    }

    #[test]
    fn blank_lines_survive() {
        let chunks = split_message("aaa\n\nbbb", 5);
        assert_eq!(chunks.concat(), "aaa\nbbb");
        assert_eq!(chunks, vec!["aaa\n", "bbb"]);
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_others() {
        let notifier = Notifier::new(4);
        let broken = Arc::new(Recording { fail: true, ..Default::default() });
        let healthy = Arc::new(Recording::default());
        notifier.register(broken.clone());
        notifier.register(healthy.clone());

        notifier.notify("aaaa\nbbbb", &SessionId::from("s1")).await;

        // The broken observer is skipped after its first failure.
        assert_eq!(broken.chunks.lock().len(), 1);
        assert_eq!(*healthy.chunks.lock(), vec!["aaaa", "bbbb"]);
        assert_eq!(notifier.delivered(), 2);
        assert_eq!(notifier.failed(), 1);
    }

    #[tokio::test]
    async fn no_observers_is_a_no_op() {
        let notifier = Notifier::default();
        notifier.notify("hello", &SessionId::from("s1")).await;
        assert_eq!(notifier.observer_count(), 0);
        assert_eq!(notifier.delivered(), 0);
    }

    #[tokio::test]
    async fn webhook_posts_text_and_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({"text": "hi", "sessionId": "s1"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let hook = WebhookObserver::new("ops", format!("{}/hook", server.uri()), reqwest::Client::new());
        hook.deliver("hi", &SessionId::from("s1")).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let hook = WebhookObserver::new("ops", server.uri(), reqwest::Client::new());
        let err = hook.deliver("hi", &SessionId::from("s1")).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status(500)));
    }
}
