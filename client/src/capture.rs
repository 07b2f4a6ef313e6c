//! Capture relay
//!
//! A local HTTP listener for processes that route outbound calls through
//! it (e.g. via `HTTP_PROXY`). Each request is packaged and posted to
//! `<sink>/<sink_path>/<bin>/<path>`; the caller receives a short JSON
//! acknowledgement instead of the sink's reply.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use http_body_util::LengthLimitError;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::forwarder::root_cause;
use crate::headers::HeaderRewriter;
use crate::observer::{Direction, ForwardResult, SharedObserver};

/// Largest request body the relay will buffer
pub const MAX_CAPTURE_BODY: usize = 10 * 1024 * 1024;

pub const USER_AGENT: &str = concat!("hookline-capture/", env!("CARGO_PKG_VERSION"));

const JSON: &str = "application/json";
const PLAIN_TEXT: &str = "text/plain";

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Local port to listen on (0 picks a free one)
    pub listen_port: u16,
    pub bin_id: String,
    /// Base URL of the capture sink
    pub sink_base: String,
    pub sink_path: String,
    /// Base URL for the bin viewer link in acknowledgements
    pub viewer_base: String,
    pub timeout: Duration,
}

impl CaptureConfig {
    pub fn new(bin_id: impl Into<String>, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into();
        Self {
            listen_port: 8081,
            bin_id: bin_id.into(),
            sink_base: api_url.clone(),
            sink_path: "b".to_string(),
            viewer_base: api_url,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sink destination for a captured path (query string included).
    pub fn sink_url(&self, original: &str) -> String {
        let original = if original.starts_with('/') {
            original.to_string()
        } else {
            format!("/{}", original)
        };
        format!(
            "{}/{}/{}{}",
            self.sink_base.trim_end_matches('/'),
            self.sink_path.trim_matches('/'),
            self.bin_id,
            original
        )
    }

    pub fn viewer_url(&self) -> String {
        format!(
            "{}/bin/{}/view",
            self.viewer_base.trim_end_matches('/'),
            self.bin_id
        )
    }
}

/// Body and content type as sent to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedBody {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl CapturedBody {
    fn new(content_type: &str, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.to_string(),
            bytes,
        }
    }
}

/// Decide what to send for a captured body.
///
/// One layer of surrounding single quotes (left over from shell quoting)
/// is removed first. An empty body becomes `{}`. A body declared as JSON
/// that does not parse is sent as plain text so the capture is never lost.
pub fn prepare_body(content_type: Option<&str>, raw: &[u8]) -> CapturedBody {
    let body = strip_single_quotes(raw);
    if body.iter().all(u8::is_ascii_whitespace) {
        return CapturedBody::new(JSON, b"{}".to_vec());
    }

    match content_type.map(str::trim).filter(|ct| !ct.is_empty()) {
        Some(ct) if ct.to_ascii_lowercase().contains(JSON) => {
            match serde_json::from_slice::<Value>(body) {
                Ok(value) => {
                    let bytes = serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec());
                    CapturedBody::new(JSON, bytes)
                }
                Err(e) => {
                    debug!("Captured body is not valid JSON ({}), sending as text", e);
                    CapturedBody::new(PLAIN_TEXT, body.to_vec())
                }
            }
        }
        Some(ct) => CapturedBody::new(ct, body.to_vec()),
        None => CapturedBody::new(PLAIN_TEXT, body.to_vec()),
    }
}

fn strip_single_quotes(raw: &[u8]) -> &[u8] {
    match raw {
        [b'\'', inner @ .., b'\''] => inner,
        _ => raw,
    }
}

#[derive(Clone)]
struct CaptureState {
    client: Client,
    config: Arc<CaptureConfig>,
    rewriter: Arc<HeaderRewriter>,
    observer: SharedObserver,
}

pub struct CaptureRelay {
    listener: TcpListener,
    state: CaptureState,
}

impl CaptureRelay {
    /// Bind the local listener on loopback.
    pub async fn bind(config: CaptureConfig, observer: SharedObserver) -> hookline_shared::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                hookline_shared::Error::Connection(format!("failed to build HTTP client: {}", e))
            })?;

        let addr = SocketAddr::from(([127, 0, 0, 1], config.listen_port));
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            state: CaptureState {
                client,
                config: Arc::new(config),
                rewriter: Arc::new(HeaderRewriter::capture(USER_AGENT)),
                observer,
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.state.config
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = Router::new()
            .fallback(capture_handler)
            .with_state(self.state);

        if let Ok(addr) = self.listener.local_addr() {
            info!("Capture relay listening on http://{}", addr);
        }
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

async fn capture_handler(State(state): State<CaptureState>, request: Request) -> Response {
    let start = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.to_string();
    // Proxied requests arrive in absolute form; only the path is kept.
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let raw = match to_bytes(body, MAX_CAPTURE_BODY).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Rejected capture of {} {}: {}", method, path, e);
            let (status, error) = if exceeds_limit(&e) {
                (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
            } else {
                (StatusCode::BAD_REQUEST, "Failed to read request body")
            };
            return reply(
                &state,
                method,
                path,
                start,
                status,
                json!({ "error": error, "detail": root_cause(&e) }),
            );
        }
    };

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let captured = prepare_body(content_type, &raw);

    let headers = state.rewriter.rewrite(parts.headers.iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
    }));

    let url = state.config.sink_url(&path);
    debug!("Capturing {} {} -> {}", method, path, url);

    let mut outgoing = state.client.post(&url);
    for (name, value) in &headers {
        outgoing = outgoing.header(name.as_str(), value.as_str());
    }
    let sent = outgoing
        .header("content-type", captured.content_type.as_str())
        .body(captured.bytes)
        .send()
        .await;

    let failure = match sent {
        Ok(response) if response.status().is_success() => None,
        Ok(response) => Some(format!("sink responded with {}", response.status())),
        Err(e) => Some(root_cause(&e)),
    };

    match failure {
        None => reply(
            &state,
            method,
            path,
            start,
            StatusCode::OK,
            json!({
                "success": true,
                "message": "Request captured",
                "binUrl": state.config.viewer_url(),
            }),
        ),
        Some(detail) => {
            error!("Failed to capture {} {}: {}", method, path, detail);
            reply(
                &state,
                method,
                path,
                start,
                StatusCode::BAD_GATEWAY,
                json!({ "error": "Failed to capture request", "detail": detail }),
            )
        }
    }
}

/// Whether a body read failed on the size cap rather than the transport.
fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn reply(
    state: &CaptureState,
    method: String,
    path: String,
    start: Instant,
    status: StatusCode,
    body: Value,
) -> Response {
    state.observer.on_forward_result(&ForwardResult {
        direction: Direction::Outbound,
        method,
        path,
        status_code: status.as_u16(),
        duration: start.elapsed(),
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, Bytes};
    use std::sync::Mutex;

    /// Handler state whose sink is never reached by the body-read tests.
    fn handler_state() -> (CaptureState, Arc<Mutex<Vec<ForwardResult>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let observer: SharedObserver = Arc::new(move |r: &ForwardResult| {
            recorder.lock().unwrap().push(r.clone());
        });
        let state = CaptureState {
            client: Client::new(),
            config: Arc::new(CaptureConfig::new("bin42", "http://127.0.0.1:9")),
            rewriter: Arc::new(HeaderRewriter::capture(USER_AGENT)),
            observer,
        };
        (state, seen)
    }

    async fn call(state: CaptureState, body: Body) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/hook")
            .body(body)
            .unwrap();
        let response = capture_handler(State(state), request).await;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (state, seen) = handler_state();
        let (status, body) = call(state, Body::from(vec![b'a'; MAX_CAPTURE_BODY + 1])).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "Request body too large");
        assert_eq!(seen.lock().unwrap()[0].status_code, 413);
    }

    #[tokio::test]
    async fn test_broken_body_stream_is_bad_request() {
        let (state, seen) = handler_state();
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"partial\":")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer went away")),
        ];
        let body = Body::from_stream(futures_util::stream::iter(chunks));
        let (status, body) = call(state, body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Failed to read request body");
        assert!(body["detail"].as_str().unwrap().contains("peer went away"));
        assert_eq!(seen.lock().unwrap()[0].status_code, 400);
    }

    #[test]
    fn test_empty_body_becomes_empty_object() {
        let cases: [&[u8]; 4] = [b"", b"   ", b"''", b"' \n'"];
        for raw in cases {
            let body = prepare_body(Some("application/json"), raw);
            assert_eq!(body, CapturedBody::new(JSON, b"{}".to_vec()));
        }
        assert_eq!(prepare_body(None, b"").content_type, JSON);
    }

    #[test]
    fn test_json_body_is_normalized() {
        let body = prepare_body(Some("application/json; charset=utf-8"), b"{ \"a\" : 1 }");
        assert_eq!(body.content_type, JSON);
        assert_eq!(body.bytes, br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn test_shell_quotes_stripped_once() {
        let body = prepare_body(Some("application/json"), br#"'{"event":"paid"}'"#);
        assert_eq!(body.content_type, JSON);
        assert_eq!(body.bytes, br#"{"event":"paid"}"#.to_vec());

        let body = prepare_body(Some("text/plain"), b"''hi''");
        assert_eq!(body.bytes, b"'hi'".to_vec());

        let body = prepare_body(Some("text/plain"), b"'");
        assert_eq!(body.bytes, b"'".to_vec());
    }

    #[test]
    fn test_invalid_json_sent_as_text() {
        let body = prepare_body(Some("application/json"), b"{not json");
        assert_eq!(body, CapturedBody::new(PLAIN_TEXT, b"{not json".to_vec()));
    }

    #[test]
    fn test_other_content_types_pass_through() {
        let body = prepare_body(Some("application/x-www-form-urlencoded"), b"a=1&b=2");
        assert_eq!(body.content_type, "application/x-www-form-urlencoded");
        assert_eq!(body.bytes, b"a=1&b=2".to_vec());

        let body = prepare_body(None, b"hello");
        assert_eq!(body, CapturedBody::new(PLAIN_TEXT, b"hello".to_vec()));
    }

    #[test]
    fn test_sink_and_viewer_urls() {
        let mut config = CaptureConfig::new("bin42", "https://hooks.example.com/");
        assert_eq!(
            config.sink_url("/api/charge?x=1"),
            "https://hooks.example.com/b/bin42/api/charge?x=1"
        );
        assert_eq!(config.sink_url("plain"), "https://hooks.example.com/b/bin42/plain");
        assert_eq!(config.viewer_url(), "https://hooks.example.com/bin/bin42/view");

        config.sink_path = "/capture/".into();
        config.viewer_base = "https://app.example.com".into();
        assert_eq!(config.sink_url("/"), "https://hooks.example.com/capture/bin42/");
        assert_eq!(config.viewer_url(), "https://app.example.com/bin/bin42/view");
    }

    #[test]
    fn test_user_agent_carries_version() {
        assert!(USER_AGENT.starts_with("hookline-capture/"));
        assert!(USER_AGENT.len() > "hookline-capture/".len());
    }
}
