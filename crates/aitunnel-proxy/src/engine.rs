use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use futures_util::StreamExt;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{Instant, Sleep};
use uuid::Uuid;

use aitunnel_core::events::{Event, RequestEvent, RetryEvent};
use aitunnel_core::retry::RetryPolicy;
use aitunnel_core::router::Resolved;
use aitunnel_core::state::AppState;

use crate::upstream::{
    BufferedResponse, Dispatched, TransportError, UpstreamClient, is_stripped_response_header,
};

/// Request bodies are fully buffered so a retry can replay them.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const BODY_READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Upper bound on one request, streaming included.
pub const REQUEST_LIFETIME: Duration = Duration::from_secs(180);

const NO_CHANNEL_MESSAGE: &str = "No available channel";

/// The streaming reverse proxy: one ingress listener, a retry loop per
/// request, and zero buffering on the success path.
pub struct ProxyEngine {
    state: Arc<AppState>,
    client: UpstreamClient,
}

impl ProxyEngine {
    pub fn new(state: Arc<AppState>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            state,
            client: UpstreamClient::new()?,
        })
    }

    /// Every method and path lands in the same handler; the proxy does not
    /// interpret API shapes, it routes and relays.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(handle).with_state(self)
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    async fn handle(&self, req: Request) -> Response {
        let started = Instant::now();
        let deadline = started + REQUEST_LIFETIME;
        let id = Uuid::now_v7().to_string();
        let (parts, body) = req.into_parts();
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());

        let body = match buffer_body(body).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => {
                self.finish(&id, &method, &path, None, Some(413), 0, started, Some("body too large"));
                return error_envelope(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "proxy_error",
                    "request body exceeds the 10 MiB limit",
                );
            }
            Err(BodyError::Timeout) => {
                self.finish(&id, &method, &path, None, Some(408), 0, started, Some("body read timeout"));
                return error_envelope(
                    StatusCode::REQUEST_TIMEOUT,
                    "proxy_error",
                    "request body read timed out",
                );
            }
            Err(BodyError::Read(message)) => {
                self.finish(&id, &method, &path, None, Some(400), 0, started, Some(&message));
                return error_envelope(StatusCode::BAD_REQUEST, "proxy_error", &message);
            }
        };

        self.run_retry_loop(RequestCtx {
            id,
            method,
            path,
            path_and_query,
            headers: parts.headers,
            body,
            started,
            deadline,
        })
        .await
    }

    async fn run_retry_loop(&self, ctx: RequestCtx) -> Response {
        let policy = self.state.policy.load_full();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut attempts: u32 = 0;
        let mut last_buffered: Option<BufferedResponse> = None;
        let mut last_channel: Option<String> = None;

        while attempts < policy.max_attempts() {
            let Some(resolved) = self.state.router.resolve_next(&ctx.path, &excluded) else {
                // Key-exhaustion mid-loop still has an upstream answer in
                // hand; surface that instead of masking it with a 503.
                if let Some(buffered) = last_buffered.take() {
                    self.finish(
                        &ctx.id,
                        &ctx.method,
                        &ctx.path,
                        last_channel.as_deref(),
                        Some(buffered.status),
                        attempts,
                        ctx.started,
                        Some("retries exhausted"),
                    );
                    return forward_buffered(buffered);
                }
                self.state.hub.warn(
                    "proxy",
                    format!("{} {}: no available channel", ctx.method, ctx.path),
                );
                self.finish(
                    &ctx.id,
                    &ctx.method,
                    &ctx.path,
                    None,
                    Some(503),
                    attempts,
                    ctx.started,
                    Some(NO_CHANNEL_MESSAGE),
                );
                return error_envelope(StatusCode::SERVICE_UNAVAILABLE, "proxy_error", NO_CHANNEL_MESSAGE);
            };

            attempts += 1;
            let attempt_started = Instant::now();
            let channel_name = resolved.channel.name().to_string();
            last_channel = Some(channel_name.clone());
            tracing::debug!(
                event = "upstream_dispatch",
                id = %ctx.id,
                channel = %channel_name,
                attempt = attempts,
                method = %ctx.method,
                path = %ctx.path
            );

            let dispatched = self
                .client
                .dispatch(
                    &resolved.channel,
                    &resolved.key,
                    &ctx.method,
                    &ctx.path_and_query,
                    &ctx.headers,
                    ctx.body.clone(),
                )
                .await;

            match dispatched {
                Ok(Dispatched::Streamed { response, permit }) => {
                    let latency = attempt_started.elapsed().as_millis() as u64;
                    let status = response.status().as_u16();
                    resolved.channel.record_success(latency);
                    resolved.channel.mark_key_success(resolved.key_index);
                    self.finish(
                        &ctx.id,
                        &ctx.method,
                        &ctx.path,
                        Some(&channel_name),
                        Some(status),
                        attempts,
                        ctx.started,
                        None,
                    );
                    return stream_response(response, permit, ctx.deadline);
                }
                Ok(Dispatched::Buffered(buffered)) => {
                    let status = buffered.status;
                    let key_failure = RetryPolicy::is_key_failure(status) || status == 429;
                    if key_failure {
                        resolved.channel.mark_key_failed(resolved.key_index);
                    }
                    if RetryPolicy::is_channel_failure(status) {
                        let demoted = resolved
                            .channel
                            .record_failure(format!("upstream status {status}"));
                        if demoted {
                            self.state.hub.warn(
                                "channel",
                                format!("channel {channel_name} marked unhealthy after repeated failures"),
                            );
                        }
                        excluded.insert(channel_name.clone());
                    }

                    let retryable =
                        policy.should_retry(status) || RetryPolicy::is_key_failure(status);
                    if !retryable {
                        record_forwarded_outcome(&resolved, status, attempt_started);
                        self.finish(
                            &ctx.id,
                            &ctx.method,
                            &ctx.path,
                            Some(&channel_name),
                            Some(status),
                            attempts,
                            ctx.started,
                            None,
                        );
                        return forward_buffered(buffered);
                    }

                    let delay = buffered
                        .retry_after
                        .unwrap_or_else(|| policy.delay(attempts - 1));
                    last_buffered = Some(buffered);
                    if attempts >= policy.max_attempts() {
                        break;
                    }
                    self.emit_retry(&ctx.id, attempts, &channel_name, Some(status), "retryable status", delay);
                    if !self.backoff(delay, ctx.deadline).await {
                        break;
                    }
                }
                Err(err) => {
                    let demoted = resolved
                        .channel
                        .record_failure(format!("transport error: {err}"));
                    if demoted {
                        self.state.hub.warn(
                            "channel",
                            format!("channel {channel_name} marked unhealthy after repeated failures"),
                        );
                    }
                    excluded.insert(channel_name.clone());
                    if attempts >= policy.max_attempts() {
                        break;
                    }
                    let delay = policy.delay(attempts - 1);
                    self.emit_retry(&ctx.id, attempts, &channel_name, None, &err.to_string(), delay);
                    if !self.backoff(delay, ctx.deadline).await {
                        break;
                    }
                }
            }
        }

        // Exhausted. Surface the last upstream answer when there is one;
        // otherwise synthesize the gateway error.
        let status = last_buffered.as_ref().map(|buffered| buffered.status);
        self.finish(
            &ctx.id,
            &ctx.method,
            &ctx.path,
            last_channel.as_deref(),
            status.or(Some(502)),
            attempts,
            ctx.started,
            Some("retries exhausted"),
        );
        match last_buffered {
            Some(buffered) => forward_buffered(buffered),
            None => error_envelope(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "all upstream attempts failed",
            ),
        }
    }

    /// Sleep for `delay`, clipped to the request deadline. Returns false
    /// when the deadline leaves no room to retry.
    async fn backoff(&self, delay: Duration, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let wait = delay.min(deadline - now);
        tokio::time::sleep(wait).await;
        Instant::now() < deadline
    }

    fn emit_retry(
        &self,
        id: &str,
        attempt: u32,
        from_channel: &str,
        status: Option<u16>,
        reason: &str,
        delay: Duration,
    ) {
        self.state.hub.info(
            "retry",
            format!(
                "attempt {attempt} on {from_channel} failed ({reason}), retrying in {}ms",
                delay.as_millis()
            ),
        );
        self.state.hub.emit(Event::Retry(RetryEvent {
            id: id.to_string(),
            attempt,
            from_channel: from_channel.to_string(),
            status,
            reason: reason.to_string(),
            delay_ms: delay.as_millis() as u64,
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        id: &str,
        method: &Method,
        path: &str,
        channel: Option<&str>,
        status: Option<u16>,
        attempts: u32,
        started: Instant,
        error: Option<&str>,
    ) {
        self.state.hub.emit(Event::Request(RequestEvent {
            id: id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            channel: channel.map(|name| name.to_string()),
            status,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: error.map(|message| message.to_string()),
        }));
    }
}

async fn handle(State(engine): State<Arc<ProxyEngine>>, req: Request) -> Response {
    engine.handle(req).await
}

struct RequestCtx {
    id: String,
    method: Method,
    path: String,
    path_and_query: String,
    headers: HeaderMap,
    body: Bytes,
    started: Instant,
    deadline: Instant,
}

enum BodyError {
    TooLarge,
    Timeout,
    Read(String),
}

async fn buffer_body(body: Body) -> Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let collect = async {
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| BodyError::Read(err.to_string()))?;
            if buf.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(BodyError::TooLarge);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    };
    match tokio::time::timeout(BODY_READ_TIMEOUT, collect).await {
        Ok(result) => result,
        Err(_) => Err(BodyError::Timeout),
    }
}

fn record_forwarded_outcome(resolved: &Resolved, status: u16, attempt_started: Instant) {
    // Pass-through 4xx is the upstream answering as asked; only a 5xx we
    // chose not to retry counts against the channel.
    if status < 500 {
        resolved
            .channel
            .record_success(attempt_started.elapsed().as_millis() as u64);
    } else if !RetryPolicy::is_channel_failure(status) {
        resolved.channel.record_failure(format!("upstream status {status}"));
    }
}

fn forward_buffered(buffered: BufferedResponse) -> Response {
    let mut response = Response::new(Body::from(buffered.body));
    *response.status_mut() =
        StatusCode::from_u16(buffered.status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in &buffered.headers {
        if !is_stripped_response_header(name.as_str()) {
            response.headers_mut().append(name.clone(), value.clone());
        }
    }
    // The body was re-buffered; let hyper recompute framing.
    response.headers_mut().remove(http::header::CONTENT_LENGTH);
    response
}

fn stream_response(
    upstream: reqwest::Response,
    permit: OwnedSemaphorePermit,
    deadline: Instant,
) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !is_stripped_response_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let is_event_stream = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"));
    if is_event_stream {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    }

    let stream = BoundedStream {
        inner: upstream.bytes_stream(),
        deadline: Box::pin(tokio::time::sleep_until(deadline)),
        _permit: permit,
    };
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn error_envelope(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": { "message": message, "type": error_type }
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Relays upstream chunks in order and cuts the stream at the request
/// deadline. Dropping it (client disconnect) drops the inner response,
/// which aborts the upstream socket instead of reading to EOF.
struct BoundedStream<S> {
    inner: S,
    deadline: Pin<Box<Sleep>>,
    _permit: OwnedSemaphorePermit,
}

impl<S> Stream for BoundedStream<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(std::io::Error::other(err)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
