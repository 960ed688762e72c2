use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, RETRY_AFTER};
use http::{HeaderMap, HeaderValue, Method};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use aitunnel_core::Channel;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_IDLE_PER_ORIGIN: usize = 4;
pub const MAX_SOCKETS_PER_ORIGIN: usize = 16;

/// Statuses whose bodies are buffered in full so the socket is freed
/// before the retry loop decides what to do.
pub const BUFFERED_STATUSES: [u16; 6] = [401, 403, 429, 502, 503, 504];

/// Request headers never forwarded upstream. `host` and `content-length`
/// are recomputed from the target and the replay buffer; the rest are
/// hop-by-hop or downstream identity that must not leak.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "proxy-authorization",
    "x-real-ip",
    "via",
    "forwarded",
    "authorization",
    "content-length",
    "host",
];

pub fn is_stripped_request_header(name: &str) -> bool {
    STRIPPED_REQUEST_HEADERS.contains(&name) || name.starts_with("x-forwarded-")
}

/// Response headers owned by this hop's transport, not forwarded.
const STRIPPED_RESPONSE_HEADERS: &[&str] =
    &["connection", "keep-alive", "transfer-encoding", "upgrade"];

pub fn is_stripped_response_header(name: &str) -> bool {
    STRIPPED_RESPONSE_HEADERS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Tls,
    Other,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if message.to_ascii_lowercase().contains("tls") {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Other
        };
        Self { kind, message }
    }
}

/// A retryable status fully read off the wire.
#[derive(Debug)]
pub struct BufferedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub retry_after: Option<Duration>,
}

pub enum Dispatched {
    /// Headers accepted; the body is still on the socket. The permit rides
    /// along so the per-origin bound covers the whole stream lifetime.
    Streamed {
        response: reqwest::Response,
        permit: OwnedSemaphorePermit,
    },
    Buffered(BufferedResponse),
}

/// Keep-alive client shared by every request to every origin, plus a
/// per-origin semaphore implementing the socket bound.
pub struct UpstreamClient {
    http: reqwest::Client,
    permits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl UpstreamClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_ORIGIN)
            // The proxy passes redirects through verbatim.
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            permits: Mutex::new(HashMap::new()),
        })
    }

    fn origin_semaphore(&self, origin: &str) -> Arc<Semaphore> {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        permits
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(MAX_SOCKETS_PER_ORIGIN)))
            .clone()
    }

    /// Replay the buffered request body against `channel` with the
    /// selected credential. Statuses in [`BUFFERED_STATUSES`] come back
    /// fully buffered; anything else comes back as a live stream.
    pub async fn dispatch(
        &self,
        channel: &Channel,
        key: &str,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Dispatched, TransportError> {
        let semaphore = self.origin_semaphore(channel.target());
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| TransportError {
                kind: TransportErrorKind::Other,
                message: "origin semaphore closed".to_string(),
            })?;

        let url = format!("{}{}", channel.target(), path_and_query);
        let mut upstream_headers = HeaderMap::new();
        for (name, value) in headers {
            if !is_stripped_request_header(name.as_str()) {
                upstream_headers.append(name.clone(), value.clone());
            }
        }
        let bearer = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
            TransportError {
                kind: TransportErrorKind::Other,
                message: "credential is not a valid header value".to_string(),
            }
        })?;
        upstream_headers.insert(AUTHORIZATION, bearer);

        let response = self
            .http
            .request(method.clone(), &url)
            .headers(upstream_headers)
            .body(body)
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = response.status().as_u16();
        if BUFFERED_STATUSES.contains(&status) {
            let headers = response.headers().clone();
            let retry_after = parse_retry_after(&headers);
            let body = response.bytes().await.map_err(TransportError::from)?;
            drop(permit);
            return Ok(Dispatched::Buffered(BufferedResponse {
                status,
                headers,
                body,
                retry_after,
            }));
        }

        Ok(Dispatched::Streamed { response, permit })
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date; unparsable values are
/// ignored. HTTP-dates end in `GMT`, which the Rfc2822 parser wants
/// spelled as a numeric offset.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let normalized = value
        .strip_suffix(" GMT")
        .map(|rest| format!("{rest} +0000"));
    let date = OffsetDateTime::parse(value, &Rfc2822)
        .or_else(|err| match &normalized {
            Some(candidate) => OffsetDateTime::parse(candidate, &Rfc2822),
            None => Err(err),
        })
        .ok()?;
    let delta = date - OffsetDateTime::now_utc();
    if delta.is_positive() {
        Some(delta.unsigned_abs())
    } else {
        Some(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(
            parse_retry_after(&header_map("7")),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn retry_after_http_date_in_the_past_clamps_to_zero() {
        let headers = header_map("Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_garbage_is_ignored() {
        assert_eq!(parse_retry_after(&header_map("soonish")), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn forwarding_identity_headers_are_stripped() {
        for name in [
            "authorization",
            "host",
            "content-length",
            "x-forwarded-for",
            "x-forwarded-proto",
            "x-real-ip",
            "via",
            "connection",
        ] {
            assert!(is_stripped_request_header(name), "{name} should be stripped");
        }
        for name in ["content-type", "accept", "user-agent", "anthropic-version"] {
            assert!(!is_stripped_request_header(name), "{name} should pass");
        }
    }
}
