//! Host header handling for requests forwarded to the local service.

use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sluice_common::copy_counted;

/// Largest request head buffered while looking for the end of the headers
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// What `Host` header the local service receives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostHeader {
    /// Keep the public host (e.g. `abcd1234.tunnel.example.com`)
    #[default]
    Preserve,
    /// Use the local address being forwarded to
    Rewrite,
    /// Use a fixed value
    Custom(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid host header value: {0:?}")]
pub struct InvalidHostHeader(String);

impl FromStr for HostHeader {
    type Err = InvalidHostHeader;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        match value.to_ascii_lowercase().as_str() {
            "" | "preserve" => Ok(HostHeader::Preserve),
            "rewrite" => Ok(HostHeader::Rewrite),
            _ if value.bytes().any(|b| b.is_ascii_control() || b == b' ') => {
                Err(InvalidHostHeader(value.to_string()))
            }
            _ => Ok(HostHeader::Custom(value.to_string())),
        }
    }
}

impl HostHeader {
    /// The value to put in `Host`, or `None` to forward requests untouched
    pub fn target(&self, local_addr: &str) -> Option<String> {
        match self {
            HostHeader::Preserve => None,
            HostHeader::Rewrite => Some(local_addr.to_string()),
            HostHeader::Custom(value) => Some(value.clone()),
        }
    }
}

/// Replace the `Host` line of a complete request head, or insert one
///
/// `head` must end with the blank line terminating the headers. Extra `Host`
/// lines are dropped so the result carries exactly one.
pub fn rewrite_head(head: &[u8], host: &str) -> Vec<u8> {
    let body = head.strip_suffix(HEAD_TERMINATOR).unwrap_or(head);
    let mut lines = body.split(|b| *b == b'\n').map(|line| line.strip_suffix(b"\r").unwrap_or(line));

    let mut out = Vec::with_capacity(head.len() + host.len() + 8);
    let host_line = format!("Host: {}", host);

    if let Some(request_line) = lines.next() {
        out.extend_from_slice(request_line);
        out.extend_from_slice(b"\r\n");
    }

    let mut replaced = false;
    let mut headers = Vec::new();
    for line in lines {
        if is_host_line(line) {
            if !replaced {
                headers.push(host_line.as_bytes());
                replaced = true;
            }
            continue;
        }
        headers.push(line);
    }
    if !replaced {
        headers.insert(0, host_line.as_bytes());
    }

    for line in headers {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn is_host_line(line: &[u8]) -> bool {
    match line.iter().position(|b| *b == b':') {
        Some(colon) => line[..colon].trim_ascii().eq_ignore_ascii_case(b"host"),
        None => false,
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

/// Copy a request stream, rewriting the `Host` header of its head
///
/// The head is buffered up to [`MAX_HEAD_BYTES`]. A head that does not end
/// within that limit, or a stream that ends first, is forwarded unchanged.
/// The counter tracks bytes read from `reader`.
pub async fn copy_with_host_rewrite<R, W>(
    mut reader: R,
    mut writer: W,
    host: &str,
    counter: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let mut scanned = 0;

    let end = loop {
        if let Some(pos) = find_terminator(&head[scanned..]) {
            break Some(scanned + pos + HEAD_TERMINATOR.len());
        }
        if head.len() >= MAX_HEAD_BYTES {
            break None;
        }
        // Terminator may straddle reads
        scanned = head.len().saturating_sub(HEAD_TERMINATOR.len() - 1);

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break None;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        head.extend_from_slice(&chunk[..n]);
    };

    let prefix = head.len() as u64;
    match end {
        Some(end) => {
            writer.write_all(&rewrite_head(&head[..end], host)).await?;
            writer.write_all(&head[end..]).await?;
        }
        None => {
            tracing::debug!("Request head not found in {} bytes, forwarding unchanged", head.len());
            writer.write_all(&head).await?;
        }
    }
    writer.flush().await?;

    let rest = copy_counted(reader, writer, counter).await?;
    Ok(prefix + rest)
}
