//! Local inspection of proxied HTTP exchanges.
//!
//! Each bridged stream can be tapped in both directions. The first bytes of
//! every direction are kept in a [`PreviewBuffer`]; once the exchange ends the
//! previews are parsed into a [`CapturedExchange`] and handed to an
//! [`ExchangeRecorder`].

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::{AsyncRead, ReadBuf};
use uuid::Uuid;

/// Default number of bytes kept per direction
pub const DEFAULT_PREVIEW_BYTES: usize = 64 * 1024;

/// Maximum exchanges kept by [`RecentExchanges`]
const MAX_RECENT_EXCHANGES: usize = 100;

/// Keeps the first `limit` bytes written to it
#[derive(Debug, Clone)]
pub struct PreviewBuffer {
    data: Arc<Mutex<Vec<u8>>>,
    limit: usize,
}

impl PreviewBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
            limit,
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        let room = self.limit.saturating_sub(data.len());
        if room > 0 {
            let take = room.min(bytes.len());
            data.extend_from_slice(&bytes[..take]);
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn is_full(&self) -> bool {
        self.data.lock().len() >= self.limit
    }
}

/// Reader that copies what passes through it into an optional preview
pub struct TapReader<R> {
    inner: R,
    preview: Option<PreviewBuffer>,
}

impl<R> TapReader<R> {
    pub fn new(inner: R, preview: Option<PreviewBuffer>) -> Self {
        Self { inner, preview }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TapReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let (Poll::Ready(Ok(())), Some(preview)) = (&poll, &this.preview) {
            let filled = &buf.filled()[before..];
            if !filled.is_empty() && !preview.is_full() {
                preview.push(filled);
            }
        }
        poll
    }
}

/// Summary of one request/response cycle
#[derive(Debug, Clone, Serialize)]
pub struct CapturedExchange {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    /// `None` when no response head was seen
    pub status: Option<u16>,
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}

/// Raw material collected while an exchange was bridged
pub struct ExchangeTaps {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl CapturedExchange {
    /// Build a summary from the tapped bytes
    ///
    /// Returns `None` if the request preview does not start with an HTTP
    /// request head.
    pub fn from_taps(taps: ExchangeTaps) -> Option<Self> {
        let request = parse_request_head(&taps.request)?;
        let response = parse_response_head(&taps.response);

        let host = request
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.clone());

        let (status, response_headers) = match response {
            Some(head) => (Some(head.status), head.headers),
            None => (None, Vec::new()),
        };

        Some(Self {
            id: Uuid::new_v4(),
            started_at: taps.started_at,
            duration: taps.duration,
            method: request.method,
            path: request.path,
            host,
            status,
            request_headers: request.headers,
            response_headers,
            bytes_in: taps.bytes_in,
            bytes_out: taps.bytes_out,
        })
    }
}

struct RequestHead {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

/// Header lines of a head, stopping at the first blank line
fn head_lines(bytes: &[u8]) -> Option<Vec<&str>> {
    let end = bytes.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&bytes[..end]).ok()?;
    Some(head.split("\r\n").collect())
}

fn parse_headers(lines: &[&str]) -> Vec<(String, String)> {
    lines
        .iter()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_request_head(bytes: &[u8]) -> Option<RequestHead> {
    let lines = head_lines(bytes)?;
    let (request_line, rest) = lines.split_first()?;

    let mut parts = request_line.split(' ');
    let method = parts.next().filter(|m| !m.is_empty())?;
    let path = parts.next().filter(|p| !p.is_empty())?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }

    Some(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        headers: parse_headers(rest),
    })
}

fn parse_response_head(bytes: &[u8]) -> Option<ResponseHead> {
    let lines = head_lines(bytes)?;
    let (status_line, rest) = lines.split_first()?;

    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = parts.next()?.parse().ok()?;

    Some(ResponseHead {
        status,
        headers: parse_headers(rest),
    })
}

/// Receives every captured exchange
pub trait ExchangeRecorder: Send + Sync {
    fn record(&self, exchange: CapturedExchange);
}

/// Reports exchanges through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl ExchangeRecorder for LogRecorder {
    fn record(&self, exchange: CapturedExchange) {
        let status = exchange
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        tracing::info!(
            "{} {} -> {} ({} ms, {} bytes in, {} bytes out)",
            exchange.method,
            exchange.path,
            status,
            exchange.duration.as_millis(),
            exchange.bytes_in,
            exchange.bytes_out
        );
    }
}

/// Keeps the most recent exchanges in memory
#[derive(Clone, Default)]
pub struct RecentExchanges {
    inner: Arc<RwLock<VecDeque<CapturedExchange>>>,
}

impl RecentExchanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchanges, oldest first
    pub fn snapshot(&self) -> Vec<CapturedExchange> {
        self.inner.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl ExchangeRecorder for RecentExchanges {
    fn record(&self, exchange: CapturedExchange) {
        let mut inner = self.inner.write();
        inner.push_back(exchange);
        if inner.len() > MAX_RECENT_EXCHANGES {
            inner.pop_front();
        }
    }
}
