//! HTTP transport implementation.
//!
//! Maps the remote transport contract onto a JSON REST API. The HTTP client
//! itself is abstracted behind [`HttpClient`] so any library (reqwest,
//! hyper, a platform bridge) can be plugged in.
//!
//! | Call                 | Request                              |
//! |----------------------|--------------------------------------|
//! | `create`             | `POST {base}/{type}`                 |
//! | `update`             | `PUT {base}/{type}/{remote_id}`      |
//! | `delete`             | `DELETE {base}/{type}/{remote_id}`   |
//! | `get_changes_since`  | `GET {base}/changes[?since=..]`      |
//! | `get_deleted_since`  | `GET {base}/deleted[?since=..]`      |
//!
//! Status codes are classified as: 409 conflict (body is the server's
//! version), 404 and 410 not found, 408, 429 and 5xx retryable, any other
//! 4xx fatal. A client-level failure (no response at all) is retryable.

use crate::error::{TransportError, TransportResult};
use crate::transport::{RemoteAck, RemoteTombstone, RemoteTransport};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tether_core::{LocalId, RemoteEntity, RemoteId};
use tracing::warn;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

/// An HTTP request built by [`HttpTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<Vec<u8>>,
}

/// An HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
///
/// Returns `Err` only if no response was received (connection refused,
/// DNS failure, TLS error); every received response is `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// Remote transport over a JSON REST API.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the API rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn call(
        &self,
        method: HttpMethod,
        url: String,
        headers: Vec<(String, String)>,
        body: Option<Value>,
    ) -> TransportResult<Vec<u8>> {
        let body = body
            .map(|b| serde_json::to_vec(&b))
            .transpose()
            .map_err(|e| TransportError::fatal(format!("failed to encode request: {e}")))?;

        let request = HttpRequest {
            method,
            url,
            headers,
            body,
        };

        let result = match self.client.send(request).await {
            Ok(response) => classify(response),
            Err(e) => Err(TransportError::retryable(e)),
        };

        match &result {
            Ok(_) => *self.last_error.write() = None,
            Err(e) => {
                warn!(error = %e, "http transport call failed");
                *self.last_error.write() = Some(e.to_string());
            }
        }
        result
    }

    fn entity_url(&self, entity_type: &str, remote_id: &RemoteId) -> String {
        format!("{}/{}/{}", self.base_url, entity_type, remote_id)
    }

    fn feed_url(&self, feed: &str, since: Option<DateTime<Utc>>) -> String {
        match since {
            Some(since) => format!(
                "{}/{}?since={}",
                self.base_url,
                feed,
                since.to_rfc3339_opts(SecondsFormat::Micros, true)
            ),
            None => format!("{}/{}", self.base_url, feed),
        }
    }
}

fn classify(response: HttpResponse) -> TransportResult<Vec<u8>> {
    let status = response.status;
    match status {
        200..=299 => Ok(response.body),
        409 => match serde_json::from_slice::<RemoteEntity>(&response.body) {
            Ok(remote) => Err(TransportError::conflict(remote)),
            Err(_) => Err(TransportError::fatal("409 without server version")),
        },
        404 | 410 => Err(TransportError::NotFound(format!("HTTP {status}"))),
        408 | 429 | 500..=599 => Err(TransportError::retryable(format!("HTTP {status}"))),
        _ => Err(TransportError::fatal(format!(
            "HTTP {status}: {}",
            String::from_utf8_lossy(&response.body)
        ))),
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> TransportResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| TransportError::fatal(format!("failed to decode response: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[async_trait]
impl<C: HttpClient> RemoteTransport for HttpTransport<C> {
    async fn create(
        &self,
        entity_type: &str,
        local_id: LocalId,
        payload: &Value,
    ) -> TransportResult<RemoteAck> {
        let body = self
            .call(
                HttpMethod::Post,
                format!("{}/{}", self.base_url, entity_type),
                vec![("Idempotency-Key".to_string(), local_id.to_string())],
                Some(json!({ "local_id": local_id, "payload": payload })),
            )
            .await?;
        decode(&body)
    }

    async fn update(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
        payload: &Value,
        base: Option<DateTime<Utc>>,
    ) -> TransportResult<RemoteAck> {
        let body = self
            .call(
                HttpMethod::Put,
                self.entity_url(entity_type, remote_id),
                Vec::new(),
                Some(json!({ "payload": payload, "base_updated_at": encode(&base) })),
            )
            .await?;
        decode(&body)
    }

    async fn delete(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
        base: Option<DateTime<Utc>>,
    ) -> TransportResult<()> {
        self.call(
            HttpMethod::Delete,
            self.entity_url(entity_type, remote_id),
            Vec::new(),
            Some(json!({ "base_updated_at": encode(&base) })),
        )
        .await?;
        Ok(())
    }

    async fn get_changes_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> TransportResult<Vec<RemoteEntity>> {
        let body = self
            .call(HttpMethod::Get, self.feed_url("changes", since), Vec::new(), None)
            .await?;
        decode(&body)
    }

    async fn get_deleted_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> TransportResult<Vec<RemoteTombstone>> {
        let body = self
            .call(HttpMethod::Get, self.feed_url("deleted", since), Vec::new(), None)
            .await?;
        decode(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned responses and records requests.
    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<HttpResponse, String>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedClient {
        fn respond(self, status: u16, body: Value) -> Self {
            self.responses.lock().push_back(Ok(HttpResponse {
                status,
                body: serde_json::to_vec(&body).unwrap(),
            }));
            self
        }

        fn unreachable(self) -> Self {
            self.responses.lock().push_back(Err("connection refused".into()));
            self
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err("no scripted response".into()))
        }
    }

    fn transport(client: ScriptedClient) -> HttpTransport<ScriptedClient> {
        HttpTransport::new("https://api.example.com/v1/", client)
    }

    #[tokio::test]
    async fn create_posts_with_idempotency_key() {
        let now = Utc::now();
        let t = transport(
            ScriptedClient::default().respond(201, json!({ "remote_id": "r-7", "updated_at": now })),
        );
        let local_id = LocalId::new();

        let ack = t.create("notes", local_id, &json!({ "title": "x" })).await.unwrap();
        assert_eq!(ack.remote_id, RemoteId::new("r-7"));
        assert_eq!(ack.updated_at, now);

        let requests = t.client.requests.lock();
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert_eq!(requests[0].url, "https://api.example.com/v1/notes");
        assert_eq!(
            requests[0].headers,
            vec![("Idempotency-Key".to_string(), local_id.to_string())]
        );
    }

    #[tokio::test]
    async fn conflict_carries_server_version() {
        let remote = RemoteEntity::new("r-1", "notes", json!({ "title": "y" }), Utc::now());
        let t = transport(ScriptedClient::default().respond(409, encode(&remote)));

        let result = t
            .update("notes", &RemoteId::new("r-1"), &json!({ "title": "x" }), None)
            .await;
        assert_eq!(result, Err(TransportError::conflict(remote)));
        assert_eq!(t.client.requests.lock()[0].url, "https://api.example.com/v1/notes/r-1");
    }

    #[tokio::test]
    async fn status_classification() {
        let t = transport(
            ScriptedClient::default()
                .respond(404, json!(null))
                .respond(503, json!(null))
                .respond(429, json!(null))
                .respond(422, json!({ "error": "title required" }))
                .unreachable(),
        );
        let id = RemoteId::new("r-1");

        assert!(matches!(t.delete("notes", &id, None).await, Err(TransportError::NotFound(_))));
        assert!(matches!(t.delete("notes", &id, None).await, Err(TransportError::Retryable(_))));
        assert!(matches!(t.delete("notes", &id, None).await, Err(TransportError::Retryable(_))));
        assert!(matches!(t.delete("notes", &id, None).await, Err(TransportError::Fatal(_))));
        assert!(matches!(t.delete("notes", &id, None).await, Err(TransportError::Retryable(_))));
        assert!(t.last_error().is_some());
    }

    #[tokio::test]
    async fn pull_feeds_pass_watermark() {
        let since = Utc::now();
        let remote = RemoteEntity::new("r-1", "notes", json!({}), since);
        let t = transport(
            ScriptedClient::default()
                .respond(200, json!([remote]))
                .respond(200, json!([])),
        );

        let changes = t.get_changes_since(Some(since)).await.unwrap();
        assert_eq!(changes, vec![remote]);
        assert!(t.get_deleted_since(None).await.unwrap().is_empty());
        assert!(t.last_error().is_none());

        let requests = t.client.requests.lock();
        assert!(requests[0].url.starts_with("https://api.example.com/v1/changes?since="));
        assert_eq!(requests[1].url, "https://api.example.com/v1/deleted");
        assert_eq!(requests[1].method, HttpMethod::Get);
    }
}
