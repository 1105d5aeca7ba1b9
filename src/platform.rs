//! Social Platform Client
//!
//! Executes gateway-approved actions against the feed platform's REST API
//! and reads the feed. Failures are classified as transient (may succeed
//! later) or permanent (the platform said no). Writes are resent inside a
//! call only when the platform throttled them.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gateway::{ActionKind, FailureKind};
use crate::retry::RetryPolicy;

const DEFAULT_BASE_URL: &str = "https://www.moltbook.com/api/v1";

/// Retry-After used when a 429 carries no usable header
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Dispatch failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("transient platform failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Refused by the platform's own rate limiter, so never processed
    #[error("rate limited by platform: {message}")]
    Throttled { message: String, retry_after: Duration },

    #[error("platform rejected action: {0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DispatchError::Transient { .. } | DispatchError::Throttled { .. } => FailureKind::Transient,
            DispatchError::Permanent(_) => FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DispatchError::Transient { retry_after, .. } => *retry_after,
            DispatchError::Throttled { retry_after, .. } => Some(*retry_after),
            DispatchError::Permanent(_) => None,
        }
    }

    /// Whether resending inside the same call is safe
    ///
    /// A write that failed with a 5xx or a dropped connection may already
    /// have been applied, so only reads are resent. A throttled request was
    /// never processed and can always be resent.
    pub fn retry_in_call(&self, idempotent: bool) -> bool {
        match self {
            DispatchError::Throttled { .. } => true,
            DispatchError::Transient { .. } => idempotent,
            DispatchError::Permanent(_) => false,
        }
    }
}

/// An approved action, ready to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKind,
    /// Post id, or agent name for follow / dm
    pub target: Option<String>,
    pub content: Option<String>,
    pub title: Option<String>,
}

/// Platform acknowledgement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReceipt {
    /// Id of the created post or comment, if any
    pub external_id: Option<String>,
}

/// A post read from the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    pub author: String,
    pub title: String,
    pub content: String,
}

/// Outbound side of the agent
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn dispatch(&self, request: &ActionRequest) -> Result<DispatchReceipt, DispatchError>;

    async fn fetch_feed(&self, limit: usize) -> Result<Vec<FeedItem>, DispatchError>;
}

/// Platform connection settings
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub base_url: String,
    pub api_key: String,
    /// Community new posts go to
    pub default_community: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            default_community: "general".to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Map an HTTP status to a dispatch error, `None` on success
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Option<DispatchError> {
    if status.is_success() {
        return None;
    }
    let snippet: String = body.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(DispatchError::Throttled {
            message: snippet,
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
        });
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Some(DispatchError::Transient {
            message: format!("{}: {}", status, snippet),
            retry_after,
        });
    }
    Some(DispatchError::Permanent(format!("{}: {}", status, snippet)))
}

/// Pull the created object's id out of a response body
pub fn extract_id(body: &Value) -> Option<String> {
    let candidates = [body.get("post"), body.get("comment"), Some(body)];
    candidates
        .into_iter()
        .flatten()
        .filter_map(|v| v.get("id"))
        .find_map(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn parse_feed(body: &Value) -> Vec<FeedItem> {
    let posts = body
        .get("posts")
        .and_then(Value::as_array)
        .or_else(|| body.as_array());

    let Some(posts) = posts else {
        return Vec::new();
    };

    posts
        .iter()
        .filter_map(|p| {
            let id = match p.get("id")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let author = p
                .get("author")
                .and_then(|a| a.get("name").or(Some(a)))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let text = |key: &str| p.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
            Some(FeedItem {
                id,
                author,
                title: text("title"),
                content: text("content"),
            })
        })
        .collect()
}

/// REST client for the feed platform
pub struct HttpPlatformClient {
    client: Client,
    config: PlatformConfig,
}

impl HttpPlatformClient {
    pub fn new(config: PlatformConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("openmolt/", env!("CARGO_PKG_VERSION")))
            .build()?;
        info!("Platform client targeting {}", config.base_url);
        Ok(Self { client, config })
    }

    fn route(&self, request: &ActionRequest) -> Result<(reqwest::Method, String, Option<Value>), DispatchError> {
        let target = || {
            request
                .target
                .as_deref()
                .ok_or_else(|| DispatchError::Permanent(format!("{} needs a target", request.kind)))
        };
        let content = request.content.clone().unwrap_or_default();

        let route = match request.kind {
            ActionKind::Post => {
                let title = request
                    .title
                    .clone()
                    .unwrap_or_else(|| content.chars().take(80).collect());
                (
                    reqwest::Method::POST,
                    "/posts".to_string(),
                    Some(serde_json::json!({
                        "submolt": self.config.default_community,
                        "title": title,
                        "content": content,
                    })),
                )
            }
            ActionKind::Comment => (
                reqwest::Method::POST,
                format!("/posts/{}/comments", target()?),
                Some(serde_json::json!({ "content": content })),
            ),
            ActionKind::Vote => (reqwest::Method::POST, format!("/posts/{}/upvote", target()?), None),
            ActionKind::Follow => (reqwest::Method::POST, format!("/agents/{}/follow", target()?), None),
            ActionKind::DirectMessage => (
                reqwest::Method::POST,
                "/agents/dm/request".to_string(),
                Some(serde_json::json!({ "to": target()?, "message": content })),
            ),
            ActionKind::DeletePost => (reqwest::Method::DELETE, format!("/posts/{}", target()?), None),
        };
        Ok(route)
    }

    async fn send_once(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, DispatchError> {
        let url = format!("{}{}", self.config.base_url, path);
        debug!("{} {}", method, url);

        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(&self.config.api_key);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| DispatchError::Transient {
            message: format!("request failed: {}", e),
            retry_after: None,
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();

        if let Some(err) = classify_status(status, retry_after, &text) {
            return Err(err);
        }
        if text.trim().is_empty() {
            return Ok(serde_json::json!({ "success": true }));
        }
        serde_json::from_str(&text).map_err(|e| DispatchError::Permanent(format!("unreadable response: {}", e)))
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value, DispatchError> {
        let idempotent = method == reqwest::Method::GET;
        self.config
            .retry
            .run(
                path,
                || self.send_once(method.clone(), path, body.as_ref()),
                |e: &DispatchError| e.retry_in_call(idempotent),
                DispatchError::retry_after,
            )
            .await
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn dispatch(&self, request: &ActionRequest) -> Result<DispatchReceipt, DispatchError> {
        let (method, path, body) = self.route(request)?;
        match self.send(method, &path, body).await {
            Ok(value) => {
                let external_id = extract_id(&value);
                info!("Dispatched {} -> {:?}", request.kind, external_id);
                Ok(DispatchReceipt { external_id })
            }
            Err(e) => {
                warn!("Dispatch of {} failed: {}", request.kind, e);
                Err(e)
            }
        }
    }

    async fn fetch_feed(&self, limit: usize) -> Result<Vec<FeedItem>, DispatchError> {
        let path = format!("/feed?sort=new&limit={}", limit);
        let value = self.send(reqwest::Method::GET, &path, None).await?;
        let items = parse_feed(&value);
        debug!("Fetched {} feed items", items.len());
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK, None, "").is_none());

        let limited = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(5)), "slow down").unwrap();
        assert_eq!(limited.failure_kind(), FailureKind::Transient);
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(5)));

        let limited = classify_status(StatusCode::TOO_MANY_REQUESTS, None, "").unwrap();
        assert_eq!(limited.retry_after(), Some(DEFAULT_RETRY_AFTER));

        let outage = classify_status(StatusCode::BAD_GATEWAY, None, "").unwrap();
        assert!(outage.is_transient());

        let rejected = classify_status(StatusCode::FORBIDDEN, None, "banned").unwrap();
        assert_eq!(rejected.failure_kind(), FailureKind::Permanent);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, None, "").unwrap().failure_kind(), FailureKind::Permanent);
    }

    #[test]
    fn test_retry_in_call_only_for_reads_or_throttling() {
        let outage = classify_status(StatusCode::BAD_GATEWAY, None, "").unwrap();
        assert!(outage.retry_in_call(true));
        assert!(!outage.retry_in_call(false));

        let throttled = classify_status(StatusCode::TOO_MANY_REQUESTS, None, "").unwrap();
        assert!(throttled.retry_in_call(false));
        assert!(throttled.is_transient());

        let rejected = classify_status(StatusCode::BAD_REQUEST, None, "").unwrap();
        assert!(!rejected.retry_in_call(true));
    }

    /// Serve canned responses in order, one per connection
    async fn canned_server(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request);
                    let complete = text.find("\r\n\r\n").map(|end| {
                        let length = text
                            .lines()
                            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                            .and_then(|v| v.parse::<usize>().ok())
                            .unwrap_or(0);
                        request.len() >= end + 4 + length
                    });
                    if n == 0 || complete == Some(true) {
                        break;
                    }
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), hits)
    }

    fn client_for(base_url: String) -> HttpPlatformClient {
        HttpPlatformClient::new(PlatformConfig {
            base_url,
            api_key: "key".into(),
            retry: RetryPolicy::immediate(2),
            ..PlatformConfig::default()
        })
        .unwrap()
    }

    const BAD_GATEWAY: &str = "HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const THROTTLED: &str = "HTTP/1.1 429 Too Many Requests\r\nretry-after: 0\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const CREATED: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 23\r\nconnection: close\r\n\r\n{\"comment\":{\"id\":\"c1\"}}";
    const EMPTY_FEED: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 12\r\nconnection: close\r\n\r\n{\"posts\":[]}";

    fn comment_request() -> ActionRequest {
        ActionRequest {
            kind: ActionKind::Comment,
            target: Some("p1".into()),
            content: Some("nice".into()),
            title: None,
        }
    }

    #[tokio::test]
    async fn test_write_not_resent_after_server_error() {
        let (url, hits) = canned_server(vec![BAD_GATEWAY, CREATED]).await;
        let client = client_for(url);

        let err = client.dispatch(&comment_request()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_throttled_write_is_resent() {
        let (url, hits) = canned_server(vec![THROTTLED, CREATED]).await;
        let client = client_for(url);

        let receipt = client.dispatch(&comment_request()).await.unwrap();
        assert_eq!(receipt.external_id.as_deref(), Some("c1"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_feed_read_is_resent_after_server_error() {
        let (url, hits) = canned_server(vec![BAD_GATEWAY, EMPTY_FEED]).await;
        let client = client_for(url);

        assert!(client.fetch_feed(10).await.unwrap().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_extract_id() {
        assert_eq!(extract_id(&serde_json::json!({"post": {"id": "p1"}})), Some("p1".into()));
        assert_eq!(extract_id(&serde_json::json!({"comment": {"id": 42}})), Some("42".into()));
        assert_eq!(extract_id(&serde_json::json!({"id": "c9", "success": true})), Some("c9".into()));
        assert_eq!(extract_id(&serde_json::json!({"success": true})), None);
    }

    #[test]
    fn test_parse_feed_shapes() {
        let wrapped = serde_json::json!({
            "posts": [
                {"id": "a", "author": {"name": "molty"}, "title": "Hi", "content": "hello"},
                {"id": 7, "author": "crab", "title": "Yo"},
                {"title": "no id"}
            ]
        });
        let items = parse_feed(&wrapped);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].author, "molty");
        assert_eq!(items[1].id, "7");
        assert_eq!(items[1].author, "crab");
        assert_eq!(items[1].content, "");

        let bare = serde_json::json!([{"id": "x", "author": {"name": "z"}}]);
        assert_eq!(parse_feed(&bare).len(), 1);
    }

    #[test]
    fn test_routes() {
        let client = HttpPlatformClient::new(PlatformConfig::default()).unwrap();
        let request = ActionRequest {
            kind: ActionKind::Comment,
            target: Some("p1".into()),
            content: Some("nice".into()),
            title: None,
        };
        let (method, path, body) = client.route(&request).unwrap();
        assert_eq!(method, reqwest::Method::POST);
        assert_eq!(path, "/posts/p1/comments");
        assert_eq!(body.unwrap()["content"], "nice");

        let missing = ActionRequest {
            kind: ActionKind::Vote,
            target: None,
            content: None,
            title: None,
        };
        assert!(matches!(client.route(&missing), Err(DispatchError::Permanent(_))));

        let delete = ActionRequest {
            kind: ActionKind::DeletePost,
            target: Some("p2".into()),
            content: None,
            title: None,
        };
        let (method, path, _) = client.route(&delete).unwrap();
        assert_eq!(method, reqwest::Method::DELETE);
        assert_eq!(path, "/posts/p2");
    }
}
