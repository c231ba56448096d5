//! Container output streams
//!
//! Container engines deliver stdout and stderr interleaved on a single
//! connection. Each chunk is preceded by an 8-byte header:
//!
//! ```text
//! [stream kind, 0, 0, 0, len >> 24, len >> 16, len >> 8, len]
//! ```
//!
//! [`FrameDecoder`] turns such a byte stream back into payloads, buffering
//! across reads so a header or payload may be split over any number of
//! chunks. Payloads are handed to an [`OutputSink`].
//!
//! # Example
//!
//! ```
//! use insulate::engine::{encode_frame, FrameDecoder, StreamKind};
//!
//! let mut bytes = encode_frame(StreamKind::Stdout, b"hello");
//! bytes.extend(encode_frame(StreamKind::Stderr, b"world!"));
//!
//! let mut decoder = FrameDecoder::new();
//! let mut frames = decoder.push(&bytes[..7]);
//! frames.extend(decoder.push(&bytes[7..]));
//!
//! let text: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
//! assert_eq!(text, b"helloworld!");
//! ```

use crate::engine::{ByteStream, EngineError};
use futures_util::StreamExt;
use std::io::{self, Write};
use std::sync::Mutex;
use tracing::debug;

/// Length of a frame header
pub const HEADER_LEN: usize = 8;

/// Receives container output as it is decoded
///
/// This trait is object-safe and is shared as `Arc<dyn OutputSink>` between
/// the pipeline and the task that reads a container's output.
pub trait OutputSink: Send + Sync {
    /// Called with the payload of every frame, in order
    fn write_output(&self, bytes: &[u8]);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_output(&self, _bytes: &[u8]) {}
}

/// Writes payloads straight to the process's stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_output(&self, bytes: &[u8]) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }
}

/// Collects payloads in memory
#[derive(Debug, Default)]
pub struct BufferSink {
    buffer: Mutex<Vec<u8>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Everything written so far, lossily decoded as UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl OutputSink for BufferSink {
    fn write_output(&self, bytes: &[u8]) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(bytes);
        }
    }
}

/// Which stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    Other(u8),
}

impl From<u8> for StreamKind {
    fn from(byte: u8) -> Self {
        match byte {
            0 => StreamKind::Stdin,
            1 => StreamKind::Stdout,
            2 => StreamKind::Stderr,
            other => StreamKind::Other(other),
        }
    }
}

impl From<StreamKind> for u8 {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
            StreamKind::Other(byte) => byte,
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamKind,
    pub payload: Vec<u8>,
}

/// Incremental decoder for the multiplexed frame format
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every frame completed by them
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut offset = 0;
        while self.buffer.len() - offset >= HEADER_LEN {
            let header = &self.buffer[offset..offset + HEADER_LEN];
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let end = offset + HEADER_LEN + len;
            if self.buffer.len() < end {
                break;
            }
            frames.push(Frame {
                stream: StreamKind::from(header[0]),
                payload: self.buffer[offset + HEADER_LEN..end].to_vec(),
            });
            offset = end;
        }
        self.buffer.drain(..offset);
        frames
    }

    /// Bytes of an incomplete frame still waiting for more input
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Encode a payload as one frame
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(u8::from(kind));
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode `stream` until it ends, forwarding every payload to `sink`.
/// Returns the number of payload bytes forwarded.
pub async fn demultiplex(mut stream: ByteStream, sink: &dyn OutputSink) -> Result<u64, EngineError> {
    let mut decoder = FrameDecoder::new();
    let mut forwarded = 0u64;

    while let Some(chunk) = stream.next().await {
        for frame in decoder.push(&chunk?) {
            sink.write_output(&frame.payload);
            forwarded += frame.payload.len() as u64;
        }
    }

    if decoder.pending() > 0 {
        debug!("Output stream ended inside a frame, {} bytes dropped", decoder.pending());
    }
    Ok(forwarded)
}
