use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{Client, Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use relay_core::api::EventByteStream;
use relay_core::errors::RelayError;

use crate::credentials::CredentialProvider;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for [`HapiClient`].
#[derive(Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub access_token: SecretString,
    pub proxy_url: Option<String>,
    pub jwt_lifetime: Duration,
    pub refresh_margin: Duration,
    /// Bound on a request, and on waiting for the event stream's headers.
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_token: SecretString::from(access_token.into()),
            proxy_url: None,
            jwt_lifetime: Duration::from_secs(900),
            refresh_margin: Duration::from_secs(180),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_proxy(mut self, proxy_url: Option<String>) -> Self {
        self.proxy_url = proxy_url.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_token_lifetime(mut self, lifetime: Duration, margin: Duration) -> Self {
        self.jwt_lifetime = lifetime;
        self.refresh_margin = margin;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("proxy_url", &self.proxy_url)
            .finish()
    }
}

fn build_http(proxy_url: Option<&str>) -> Result<Client, RelayError> {
    let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if let Some(url) = proxy_url {
        let proxy = reqwest::Proxy::all(url)
            .map_err(|e| RelayError::InvalidRequest(format!("invalid proxy url {url}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| RelayError::NetworkError(format!("failed to build HTTP client: {e}")))
}

fn map_send_error(e: reqwest::Error, timeout: Duration) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout(timeout)
    } else {
        RelayError::NetworkError(e.to_string())
    }
}

/// Turn a non-2xx response into a classified error.
pub(crate) async fn check_status(resp: Response) -> Result<Response, RelayError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(RelayError::from_status(status, body))
}

/// Authenticated HTTP client for the session API.
///
/// The connection pool is opened lazily and can be dropped with
/// [`close`](Self::close); the next request reopens it.
pub struct HapiClient {
    endpoint: String,
    proxy_url: Option<String>,
    pool: RwLock<Option<Client>>,
    credentials: CredentialProvider,
    request_timeout: Duration,
}

impl HapiClient {
    pub fn new(config: ClientConfig) -> Result<Self, RelayError> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let auth_http = build_http(config.proxy_url.as_deref())?;
        let credentials = CredentialProvider::new(
            auth_http,
            &endpoint,
            config.access_token,
            config.jwt_lifetime,
            config.refresh_margin,
        );
        Ok(Self {
            endpoint,
            proxy_url: config.proxy_url,
            pool: RwLock::new(None),
            credentials,
            request_timeout: config.request_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn credentials(&self) -> &CredentialProvider {
        &self.credentials
    }

    pub fn is_open(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Drop the connection pool.
    pub fn close(&self) {
        if self.pool.write().take().is_some() {
            debug!("connection pool closed");
        }
    }

    fn http(&self) -> Result<Client, RelayError> {
        if let Some(client) = self.pool.read().as_ref() {
            return Ok(client.clone());
        }
        let mut pool = self.pool.write();
        if let Some(client) = pool.as_ref() {
            return Ok(client.clone());
        }
        let client = build_http(self.proxy_url.as_deref())?;
        *pool = Some(client.clone());
        debug!("connection pool opened");
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn send(
        &self,
        http: &Client,
        method: Method,
        url: &str,
        body: Option<&Value>,
        token: &SecretString,
    ) -> Result<Response, RelayError> {
        let mut req = http
            .request(method, url)
            .bearer_auth(token.expose_secret())
            .timeout(self.request_timeout);
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send()
            .await
            .map_err(|e| map_send_error(e, self.request_timeout))
    }

    /// Authenticated request. A 401 triggers one credential refresh and one
    /// retry; a second 401 is returned to the caller unchanged.
    #[instrument(skip(self, method, body), fields(method = %method))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, RelayError> {
        let http = self.http()?;
        let url = self.url(path);
        let token = self.credentials.get().await?;
        let resp = self.send(&http, method.clone(), &url, body, &token).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        warn!(path, "unauthorized, refreshing token and retrying once");
        let token = self.credentials.refresh_after_rejection(&token).await?;
        self.send(&http, method, &url, body, &token).await
    }

    /// Request and decode a JSON body, mapping non-2xx to [`RelayError`].
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, RelayError> {
        let resp = check_status(self.request(method, path, body).await?).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| map_send_error(e, self.request_timeout))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RelayError> {
        self.request_json(Method::GET, path, None).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, RelayError> {
        self.request_json(Method::POST, path, Some(body)).await
    }

    /// Request where only success matters; the body is discarded.
    pub async fn request_ok(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(), RelayError> {
        check_status(self.request(method, path, body).await?).await?;
        Ok(())
    }

    /// Unauthenticated `GET /health`. Any failure reads as unhealthy.
    pub async fn health(&self) -> bool {
        let http = match self.http() {
            Ok(http) => http,
            Err(_) => return false,
        };
        match http
            .get(self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }

    /// Open the event stream. The token travels as a query parameter. Waiting
    /// for the response headers is bounded; the body read is not.
    #[instrument(skip(self))]
    pub async fn subscribe_events(&self) -> Result<EventByteStream, RelayError> {
        let http = self.http()?;
        let url = self.url("/api/events");
        let mut token = self.credentials.get().await?;
        let mut retried = false;

        loop {
            let pending = http
                .get(&url)
                .query(&[("all", "1"), ("token", token.expose_secret())])
                .send();
            let resp = tokio::time::timeout(self.request_timeout, pending)
                .await
                .map_err(|_| RelayError::Timeout(self.request_timeout))?
                .map_err(|e| map_send_error(e, CONNECT_TIMEOUT))?;

            if resp.status() == StatusCode::UNAUTHORIZED && !retried {
                warn!("event stream unauthorized, refreshing token and retrying once");
                token = self.credentials.refresh_after_rejection(&token).await?;
                retried = true;
                continue;
            }

            let resp = check_status(resp).await?;
            debug!("event stream opened");
            let stream = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| RelayError::StreamInterrupted(e.to_string())));
            return Ok(Box::pin(stream));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_auth(server: &MockServer, token: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path("/api/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": token})))
            .expect(times)
            .mount(server)
            .await;
    }

    fn client(server: &MockServer) -> HapiClient {
        HapiClient::new(ClientConfig::new(server.uri(), "access")).unwrap()
    }

    #[tokio::test]
    async fn attaches_bearer_token() {
        let server = MockServer::start().await;
        mount_auth(&server, "jwt-1", 1).await;
        Mock::given(method("GET"))
            .and(path("/api/sessions"))
            .and(header("authorization", "Bearer jwt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessions": []})))
            .expect(1)
            .mount(&server)
            .await;

        let value: Value = client(&server).get_json("/api/sessions").await.unwrap();
        assert_eq!(value, json!({"sessions": []}));
    }

    #[tokio::test]
    async fn retries_once_after_unauthorized() {
        let server = MockServer::start().await;
        mount_auth(&server, "jwt", 2).await;
        Mock::given(method("GET"))
            .and(path("/api/sessions"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessions": [{"id": "s1"}]})))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        let value: Value = c.get_json("/api/sessions").await.unwrap();
        assert_eq!(value["sessions"][0]["id"], "s1");
        assert_eq!(c.credentials().auth_count(), 2);
    }

    #[tokio::test]
    async fn second_unauthorized_is_surfaced() {
        let server = MockServer::start().await;
        mount_auth(&server, "jwt", 2).await;
        Mock::given(method("GET"))
            .and(path("/api/sessions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .expect(2)
            .mount(&server)
            .await;

        let c = client(&server);
        let err = c.get_json::<Value>("/api/sessions").await;
        assert!(matches!(err, Err(RelayError::Unauthorized(ref body)) if body == "expired"));
    }

    #[tokio::test]
    async fn server_errors_are_classified() {
        let server = MockServer::start().await;
        mount_auth(&server, "jwt", 1).await;
        Mock::given(method("GET"))
            .and(path("/api/sessions/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such session"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/sessions/broken"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let c = client(&server);
        assert!(matches!(
            c.get_json::<Value>("/api/sessions/missing").await,
            Err(RelayError::NotFound(_))
        ));
        let err = c.get_json::<Value>("/api/sessions/broken").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn close_reopens_lazily() {
        let server = MockServer::start().await;
        mount_auth(&server, "jwt", 1).await;
        Mock::given(method("GET"))
            .and(path("/api/machines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"machines": []})))
            .expect(2)
            .mount(&server)
            .await;

        let c = client(&server);
        assert!(!c.is_open());
        c.get_json::<Value>("/api/machines").await.unwrap();
        assert!(c.is_open());
        c.close();
        assert!(!c.is_open());
        c.get_json::<Value>("/api/machines").await.unwrap();
        assert!(c.is_open());
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        assert!(client(&server).health().await);
    }

    #[tokio::test]
    async fn health_reports_unreachable_server_as_unhealthy() {
        let c = HapiClient::new(ClientConfig::new("http://127.0.0.1:9", "access")).unwrap();
        assert!(!c.health().await);
    }

    #[tokio::test]
    async fn health_reports_error_status_as_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        assert!(!client(&server).health().await);
    }

    #[tokio::test]
    async fn subscribe_passes_token_as_query() {
        let server = MockServer::start().await;
        mount_auth(&server, "jwt-q", 1).await;
        Mock::given(method("GET"))
            .and(path("/api/events"))
            .and(query_param("all", "1"))
            .and(query_param("token", "jwt-q"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"type\":\"ping\"}\n\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut stream = client(&server).subscribe_events().await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"data: {\"type\":\"ping\"}\n\n");
    }

    #[tokio::test]
    async fn subscribe_rejection_after_retry_is_an_error() {
        let server = MockServer::start().await;
        mount_auth(&server, "jwt", 2).await;
        Mock::given(method("GET"))
            .and(path("/api/events"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let result = client(&server).subscribe_events().await;
        assert!(matches!(result, Err(RelayError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn subscribe_gives_up_when_headers_never_arrive() {
        let server = MockServer::start().await;
        mount_auth(&server, "jwt", 1).await;
        Mock::given(method("GET"))
            .and(path("/api/events"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let timeout = Duration::from_millis(200);
        let c = HapiClient::new(
            ClientConfig::new(server.uri(), "access").with_request_timeout(timeout),
        )
        .unwrap();
        let started = std::time::Instant::now();
        let result = c.subscribe_events().await;

        assert!(matches!(result, Err(RelayError::Timeout(t)) if t == timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn blank_proxy_means_direct() {
        let config = ClientConfig::new("http://localhost", "t").with_proxy(Some("  ".into()));
        assert!(config.proxy_url.is_none());
    }
}
