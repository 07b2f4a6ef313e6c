//! Local forwarding for tunnel requests
//!
//! Every `REQUEST` turns into exactly one `RESPONSE`. Local failures are
//! folded into a synthetic error response instead of being propagated.

use std::time::{Duration, Instant};

use hookline_shared::payload;
use hookline_shared::{Headers, Query, RequestMessage, ResponseMessage};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{redirect, Client, Method, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::headers::HeaderRewriter;
use crate::observer::{Direction, ForwardResult, SharedObserver};

/// Status reported when the local call produced no HTTP status at all
pub const FALLBACK_STATUS: u16 = 500;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Local hostname to forward to
    pub local_host: String,
    pub local_port: u16,
    /// Upper bound for one local call, body included
    pub timeout: Duration,
}

impl ForwarderConfig {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_host: "localhost".to_string(),
            local_port,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("{0}")]
    LocalUnreachable(String),

    #[error("{0}")]
    LocalTimeout(String),

    #[error("{0}")]
    LocalProtocolError(String),

    #[error("{0}")]
    InvalidRequest(String),
}

impl ForwardError {
    /// Short code appended to synthetic error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::LocalUnreachable(_) => "LOCAL_UNREACHABLE",
            ForwardError::LocalTimeout(_) => "LOCAL_TIMEOUT",
            ForwardError::LocalProtocolError(_) => "LOCAL_PROTOCOL_ERROR",
            ForwardError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        let message = root_cause(err);
        if err.is_timeout() {
            ForwardError::LocalTimeout(message)
        } else if err.is_connect() {
            ForwardError::LocalUnreachable(message)
        } else if err.is_builder() {
            ForwardError::InvalidRequest(message)
        } else {
            ForwardError::LocalProtocolError(message)
        }
    }
}

/// A failed local call, with the upstream status if one was received.
struct Failure {
    status: Option<u16>,
    error: ForwardError,
}

impl From<ForwardError> for Failure {
    fn from(error: ForwardError) -> Self {
        Self { status: None, error }
    }
}

pub struct Forwarder {
    client: Client,
    config: ForwarderConfig,
    rewriter: HeaderRewriter,
    observer: SharedObserver,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig, observer: SharedObserver) -> hookline_shared::Result<Self> {
        // Any status is a valid answer and redirects go back to the relay untouched.
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| {
                hookline_shared::Error::Connection(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            rewriter: HeaderRewriter::forwarding(&config.authority()),
            config,
            observer,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.config.local_port
    }

    /// Forward one request and build its response. Never fails.
    pub async fn forward(&self, request: RequestMessage) -> ResponseMessage {
        let start = Instant::now();
        debug!(
            "Proxying {} {} to {}",
            request.method,
            request.path,
            self.config.authority()
        );

        let response = match self.call_local(&request).await {
            Ok(response) => response,
            Err(Failure { status, error }) => {
                let body = format!("{} ({})", error, error.code());
                warn!(
                    "Error forwarding {} {}: {}",
                    request.method, request.path, body
                );
                ResponseMessage {
                    request_id: request.request_id.clone(),
                    status_code: status.unwrap_or(FALLBACK_STATUS),
                    headers: Headers::new(),
                    body: Some(Value::String(body)),
                    body_encoding: None,
                }
            }
        };

        self.observer.on_forward_result(&ForwardResult {
            direction: Direction::Inbound,
            method: request.method,
            path: request.path,
            status_code: response.status_code,
            duration: start.elapsed(),
        });

        response
    }

    async fn call_local(&self, request: &RequestMessage) -> Result<ResponseMessage, Failure> {
        let url = self.local_url(&request.path, &request.query)?;
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ForwardError::InvalidRequest(format!("invalid method '{}'", request.method)))?;

        let mut headers = header_map(
            self.rewriter
                .rewrite(request.headers.iter().map(|(k, v)| (k.clone(), v.clone()))),
        );

        let mut builder = self.client.request(method, url);
        if let Some(body) = &request.body {
            let bytes = payload::body_to_bytes(body, request.body_encoding).map_err(|e| {
                ForwardError::InvalidRequest(format!("body is not valid base64: {}", e))
            })?;
            if let Some(bytes) = bytes {
                if payload::is_structured(body) && !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                builder = builder.body(bytes);
            }
        }

        let response = builder.headers(headers).send().await.map_err(|e| Failure {
            status: None,
            error: ForwardError::from_reqwest(&e),
        })?;

        let status = response.status().as_u16();
        let headers = flatten_headers(response.headers());
        let bytes = response.bytes().await.map_err(|e| Failure {
            status: Some(status),
            error: ForwardError::from_reqwest(&e),
        })?;

        let content_type = headers.get(CONTENT_TYPE.as_str()).map(String::as_str);
        let (body, body_encoding) = payload::body_from_bytes(&bytes, content_type);

        Ok(ResponseMessage {
            request_id: request.request_id.clone(),
            status_code: status,
            headers,
            body: Some(body),
            body_encoding,
        })
    }

    /// `http://<host>:<port><path>?<query>`, query pairs appended in order.
    fn local_url(&self, path: &str, query: &Query) -> Result<Url, ForwardError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        let mut url = Url::parse(&format!("http://{}{}", self.config.authority(), path))
            .map_err(|e| ForwardError::InvalidRequest(format!("invalid path '{}': {}", path, e)))?;

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query.pairs() {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Build a header map, skipping names or values HTTP cannot carry.
fn header_map(headers: Vec<(String, String)>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!("Skipping unforwardable header '{}'", k),
        }
    }
    map
}

/// Flatten a reply's headers, joining repeated values. Non-UTF-8 values are dropped.
fn flatten_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

pub(crate) fn root_cause(err: &(dyn std::error::Error + 'static)) -> String {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap as AxumHeaders, Method as AxumMethod, StatusCode, Uri};
    use axum::response::{IntoResponse, Redirect};
    use axum::routing::{any, get};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn echo(method: AxumMethod, uri: Uri, headers: AxumHeaders, body: Bytes) -> Json<Value> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Json(json!({
            "method": method.as_str(),
            "uri": uri.to_string(),
            "host": header("host"),
            "contentType": header("content-type"),
            "custom": header("x-custom"),
            "body": String::from_utf8_lossy(&body),
        }))
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    const PNG_HEAD: [u8; 6] = [0x89, 0x50, 0x4e, 0x47, 0xff, 0x00];

    fn local_app() -> Router {
        Router::new()
            .route("/echo", any(echo))
            .route(
                "/compressed",
                get(|| async {
                    (
                        [("content-type", "text/plain"), ("content-encoding", "gzip")],
                        gzip(b"hello world"),
                    )
                }),
            )
            .route(
                "/image",
                get(|| async { ([("content-type", "application/octet-stream")], PNG_HEAD.to_vec()) }),
            )
            .route(
                "/down",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response() }),
            )
            .route("/old", get(|| async { Redirect::temporary("/new") }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    "late"
                }),
            )
    }

    fn recording_forwarder(
        port: u16,
        timeout: Duration,
    ) -> (Forwarder, Arc<Mutex<Vec<ForwardResult>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: SharedObserver = Arc::new(move |r: &ForwardResult| {
            sink.lock().unwrap().push(r.clone());
        });
        let config = ForwarderConfig::new(port)
            .with_local_host("127.0.0.1")
            .with_timeout(timeout);
        (Forwarder::new(config, observer).unwrap(), seen)
    }

    fn request(id: &str, method: &str, path: &str) -> RequestMessage {
        RequestMessage {
            request_id: id.into(),
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
            body: None,
            body_encoding: None,
            query: Query::new(),
        }
    }

    #[tokio::test]
    async fn test_forwards_request_with_query_headers_and_body() {
        let port = serve(local_app()).await;
        let (forwarder, seen) = recording_forwarder(port, Duration::from_secs(5));

        let mut req = request("r1", "post", "/echo");
        req.headers.insert("host".into(), "abc.relay.dev".into());
        req.headers.insert("content-length".into(), "999".into());
        req.headers.insert("x-custom".into(), "yes".into());
        req.body = Some(json!({"event": "push"}));
        req.query = vec![("page", "2"), ("tag", "a b"), ("tag", "c")]
            .into_iter()
            .collect();

        let resp = forwarder.forward(req).await;
        assert_eq!(resp.request_id, "r1");
        assert_eq!(resp.status_code, 200);

        let body = resp.body.unwrap();
        assert_eq!(body["method"], "POST");
        assert_eq!(body["uri"], "/echo?page=2&tag=a+b&tag=c");
        assert_eq!(body["host"], format!("127.0.0.1:{}", port));
        assert_eq!(body["contentType"], "application/json");
        assert_eq!(body["custom"], "yes");
        assert_eq!(body["body"], r#"{"event":"push"}"#);
        assert!(resp
            .headers
            .get("content-type")
            .unwrap()
            .contains("application/json"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].direction, Direction::Inbound);
        assert_eq!(seen[0].method, "post");
        assert_eq!(seen[0].path, "/echo");
        assert_eq!(seen[0].status_code, 200);
    }

    #[tokio::test]
    async fn test_string_body_sent_verbatim() {
        let port = serve(local_app()).await;
        let (forwarder, _) = recording_forwarder(port, Duration::from_secs(5));

        let mut req = request("r2", "PUT", "echo");
        req.headers.insert("content-type".into(), "text/plain".into());
        req.body = Some(json!("plain words"));

        let resp = forwarder.forward(req).await;
        let body = resp.body.unwrap();
        assert_eq!(body["body"], "plain words");
        assert_eq!(body["contentType"], "text/plain");
    }

    #[tokio::test]
    async fn test_compressed_reply_is_decoded() {
        let port = serve(local_app()).await;
        let (forwarder, _) = recording_forwarder(port, Duration::from_secs(5));

        let mut req = request("r9", "GET", "/compressed");
        req.headers.insert("accept-encoding".into(), "gzip".into());

        let resp = forwarder.forward(req).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, Some(json!("hello world")));
        assert_eq!(resp.body_encoding, None);
        assert!(!resp.headers.contains_key("content-encoding"));
        assert!(!resp.headers.contains_key("content-length"));
    }

    #[tokio::test]
    async fn test_binary_reply_survives_as_base64() {
        use base64::Engine;

        let port = serve(local_app()).await;
        let (forwarder, _) = recording_forwarder(port, Duration::from_secs(5));

        let resp = forwarder.forward(request("r10", "GET", "/image")).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body_encoding, Some(hookline_shared::BodyEncoding::Base64));
        let encoded = resp.body.unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_str().unwrap())
            .unwrap();
        assert_eq!(bytes, PNG_HEAD.to_vec());
    }

    #[tokio::test]
    async fn test_base64_request_body_decoded() {
        let port = serve(local_app()).await;
        let (forwarder, _) = recording_forwarder(port, Duration::from_secs(5));

        let mut req = request("r11", "POST", "/echo");
        req.body = Some(json!("cmF3IGJ5dGVz"));
        req.body_encoding = Some(hookline_shared::BodyEncoding::Base64);
        let resp = forwarder.forward(req).await;
        assert_eq!(resp.body.unwrap()["body"], "raw bytes");

        let mut req = request("r12", "POST", "/echo");
        req.body = Some(json!("%%%"));
        req.body_encoding = Some(hookline_shared::BodyEncoding::Base64);
        let resp = forwarder.forward(req).await;
        assert_eq!(resp.status_code, 500);
        assert!(resp.body.unwrap().as_str().unwrap().ends_with("(INVALID_REQUEST)"));
    }

    #[tokio::test]
    async fn test_error_statuses_pass_through() {
        let port = serve(local_app()).await;
        let (forwarder, _) = recording_forwarder(port, Duration::from_secs(5));

        let resp = forwarder.forward(request("r3", "GET", "/down")).await;
        assert_eq!(resp.status_code, 503);
        assert_eq!(resp.body, Some(json!("maintenance")));

        let resp = forwarder.forward(request("r4", "GET", "/missing")).await;
        assert_eq!(resp.status_code, 404);
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let port = serve(local_app()).await;
        let (forwarder, _) = recording_forwarder(port, Duration::from_secs(5));

        let resp = forwarder.forward(request("r5", "GET", "/old")).await;
        assert_eq!(resp.status_code, 307);
        assert_eq!(resp.headers.get("location").map(String::as_str), Some("/new"));
    }

    #[tokio::test]
    async fn test_unreachable_local_service() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (forwarder, seen) = recording_forwarder(port, Duration::from_secs(5));
        let resp = forwarder.forward(request("r6", "GET", "/ping")).await;

        assert_eq!(resp.request_id, "r6");
        assert_eq!(resp.status_code, 500);
        assert!(resp.headers.is_empty());
        let body = resp.body.unwrap();
        let text = body.as_str().unwrap();
        assert!(text.ends_with("(LOCAL_UNREACHABLE)"), "{}", text);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].status_code, 500);
    }

    #[tokio::test]
    async fn test_local_timeout() {
        let port = serve(local_app()).await;
        let (forwarder, _) = recording_forwarder(port, Duration::from_millis(200));

        let resp = forwarder.forward(request("r7", "GET", "/slow")).await;
        assert_eq!(resp.status_code, 500);
        let body = resp.body.unwrap();
        assert!(body.as_str().unwrap().ends_with("(LOCAL_TIMEOUT)"));
    }

    #[tokio::test]
    async fn test_invalid_method() {
        let (forwarder, _) = recording_forwarder(9, Duration::from_secs(1));
        let resp = forwarder.forward(request("r8", "NOT A METHOD", "/")).await;
        assert_eq!(resp.status_code, 500);
        let body = resp.body.unwrap();
        assert!(body.as_str().unwrap().ends_with("(INVALID_REQUEST)"));
    }

    #[test]
    fn test_flatten_joins_repeated_headers() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));
        map.insert("x-binary", HeaderValue::from_bytes(&[0xFF]).unwrap());

        let flat = flatten_headers(&map);
        assert_eq!(flat.get("set-cookie").map(String::as_str), Some("a=1, b=2"));
        assert!(!flat.contains_key("x-binary"));
    }
}
