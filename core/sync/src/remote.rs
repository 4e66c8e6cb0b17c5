//! Remote sync endpoint abstraction and its HTTP implementation.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use fieldsync_common::{Error, Result};

use crate::item::{Operation, SyncQueueItem};

/// What gets transmitted for one queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub model_type: String,
    pub operation: Operation,
    pub data: Value,
}

impl From<&SyncQueueItem> for Mutation {
    fn from(item: &SyncQueueItem) -> Self {
        Self {
            model_type: item.model_type.clone(),
            operation: item.operation,
            data: item.data.clone(),
        }
    }
}

/// Successful answer from the remote endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteAck {
    /// Authoritative record state, when the endpoint returns one.
    pub canonical: Option<Value>,
}

impl RemoteAck {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_canonical(canonical: Value) -> Self {
        Self {
            canonical: Some(canonical),
        }
    }
}

/// The authoritative backend receiving mutations.
///
/// Implementations report every non-success outcome as an error; the engine
/// counts those against the item's retry budget.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Endpoint name used in logs.
    fn name(&self) -> &str;

    /// Deliver one mutation.
    async fn push(&self, mutation: &Mutation) -> Result<RemoteAck>;
}

/// Endpoint speaking JSON over HTTP.
///
/// Each mutation is POSTed as `{"modelType", "operation", "data"}` to
/// `{base}/{modelType}`. A 2xx answer with a JSON object body is the
/// canonical state (unwrapped from a top-level `"data"` field if present);
/// an empty body or `null` means no canonical state.
pub struct HttpEndpoint {
    client: reqwest::Client,
    base: Url,
}

impl HttpEndpoint {
    /// Create an endpoint rooted at `base`.
    ///
    /// # Errors
    /// - `base` is not an absolute http(s) URL
    pub fn new(base: &str) -> Result<Self> {
        Self::with_client(reqwest::Client::new(), base)
    }

    /// Create an endpoint with a preconfigured client (proxies, auth headers).
    pub fn with_client(client: reqwest::Client, base: &str) -> Result<Self> {
        let mut base = Url::parse(base)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint URL '{}': {}", base, e)))?;

        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(format!(
                "Unsupported endpoint scheme '{}'",
                base.scheme()
            )));
        }

        // Url::join replaces the last segment unless the path ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self { client, base })
    }

    /// URL a mutation for `model_type` is sent to.
    pub fn url_for(&self, model_type: &str) -> Result<Url> {
        let segment = utf8_percent_encode(model_type, NON_ALPHANUMERIC).to_string();
        self.base
            .join(&segment)
            .map_err(|e| Error::InvalidInput(format!("Invalid model type '{}': {}", model_type, e)))
    }

    /// Host and port the endpoint talks to.
    pub fn socket_addr_hint(&self) -> Option<(String, u16)> {
        Some((
            self.base.host_str()?.to_string(),
            self.base.port_or_known_default()?,
        ))
    }
}

/// Turn a success body into canonical state.
pub(crate) fn canonical_from_body(body: &[u8]) -> Option<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring undecodable success body: {}", e);
            return None;
        }
    };

    let value = match value {
        Value::Object(mut object) if object.get("data").is_some_and(Value::is_object) => {
            object.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };

    match value {
        Value::Null => None,
        other => Some(other),
    }
}

#[async_trait]
impl RemoteEndpoint for HttpEndpoint {
    fn name(&self) -> &str {
        "http"
    }

    async fn push(&self, mutation: &Mutation) -> Result<RemoteAck> {
        let url = self.url_for(&mutation.model_type)?;
        debug!(%url, operation = %mutation.operation, "Pushing mutation");

        let response = self
            .client
            .post(url)
            .json(mutation)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Remote {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(RemoteAck::empty());
        }

        Ok(RemoteAck {
            canonical: canonical_from_body(&body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned HTTP response and hand back the raw request.
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        (format!("http://{}/api/sync", addr), handle)
    }

    fn mutation() -> Mutation {
        Mutation {
            model_type: "Job".to_string(),
            operation: Operation::Update,
            data: json!({"id": "1", "status": "done"}),
        }
    }

    #[test]
    fn test_url_building() {
        let endpoint = HttpEndpoint::new("https://example.com/api/sync").unwrap();
        assert_eq!(
            endpoint.url_for("Job").unwrap().as_str(),
            "https://example.com/api/sync/Job"
        );
        assert_eq!(
            endpoint.url_for("Site Visit").unwrap().as_str(),
            "https://example.com/api/sync/Site%20Visit"
        );
        assert_eq!(
            endpoint.socket_addr_hint(),
            Some(("example.com".to_string(), 443))
        );
    }

    #[test]
    fn test_rejects_bad_base() {
        assert!(HttpEndpoint::new("not a url").is_err());
        assert!(HttpEndpoint::new("ftp://example.com").is_err());
    }

    #[test]
    fn test_canonical_body_parsing() {
        assert_eq!(canonical_from_body(b""), None);
        assert_eq!(canonical_from_body(b"  \n"), None);
        assert_eq!(canonical_from_body(b"null"), None);
        assert_eq!(canonical_from_body(b"<html>"), None);
        assert_eq!(
            canonical_from_body(br#"{"id": "1"}"#),
            Some(json!({"id": "1"}))
        );
        assert_eq!(
            canonical_from_body(br#"{"data": {"id": "1"}, "meta": {}}"#),
            Some(json!({"id": "1"}))
        );
    }

    #[tokio::test]
    async fn test_push_success_with_canonical_state() {
        let (base, server) =
            one_shot_server("HTTP/1.1 200 OK", r#"{"data": {"id": "1", "rev": 4}}"#).await;
        let endpoint = HttpEndpoint::new(&base).unwrap();

        let ack = endpoint.push(&mutation()).await.unwrap();
        assert_eq!(ack.canonical, Some(json!({"id": "1", "rev": 4})));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/sync/Job "));
        assert!(request.contains(r#""modelType":"Job""#));
        assert!(request.contains(r#""operation":"update""#));
    }

    #[tokio::test]
    async fn test_push_error_status() {
        let (base, server) =
            one_shot_server("HTTP/1.1 503 Service Unavailable", "maintenance").await;
        let endpoint = HttpEndpoint::new(&base).unwrap();

        match endpoint.push(&mutation()).await {
            Err(Error::Remote { status, message }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("unexpected result {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_push_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = HttpEndpoint::new(&format!("http://{}/", addr)).unwrap();
        assert!(matches!(
            endpoint.push(&mutation()).await,
            Err(Error::Network(_))
        ));
    }
}
