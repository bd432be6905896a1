use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Hard ceiling on a single control message (64 KiB)
pub const MAX_CONTROL_MESSAGE_BYTES: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Control message too large: {0} bytes (max {MAX_CONTROL_MESSAGE_BYTES})")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Newline-delimited JSON codec for control messages
///
/// Wire format: one compact JSON object followed by `\n`. A peer that closes
/// its write side without the trailing newline still gets its last message
/// decoded.
///
/// `In` is the decoded message type; any `Serialize` value can be encoded.
pub struct ControlCodec<In> {
    max_len: usize,
    /// How far into the buffer we already looked for a newline
    scanned: usize,
    _phantom: PhantomData<In>,
}

impl<In> ControlCodec<In> {
    pub fn new() -> Self {
        Self::with_max_len(MAX_CONTROL_MESSAGE_BYTES)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len,
            scanned: 0,
            _phantom: PhantomData,
        }
    }
}

impl<In> Default for ControlCodec<In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned> Decoder for ControlCodec<In> {
    type Item = In;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.scanned..].iter().position(|b| *b == b'\n');

        let Some(offset) = newline else {
            if src.len() > self.max_len {
                return Err(CodecError::MessageTooLarge(src.len()));
            }
            self.scanned = src.len();
            return Ok(None);
        };

        let end = self.scanned + offset;
        self.scanned = 0;
        if end > self.max_len {
            return Err(CodecError::MessageTooLarge(end));
        }

        let line = src.split_to(end + 1);
        let payload = trim_line(&line[..end]);
        let message = serde_json::from_slice(payload)?;
        Ok(Some(message))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        self.scanned = 0;

        if trim_line(src).is_empty() {
            src.clear();
            return Ok(None);
        }

        let line = src.split();
        let message = serde_json::from_slice(trim_line(&line))?;
        Ok(Some(message))
    }
}

impl<In, Out: Serialize> Encoder<Out> for ControlCodec<In> {
    type Error = CodecError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        if json.len() > self.max_len {
            return Err(CodecError::MessageTooLarge(json.len()));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');

        Ok(())
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}
