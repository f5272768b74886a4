//! # Line-Framed JSON Transport (Agent)
//!
//! Newline-delimited JSON framing over the control socket: one [`Frame`]
//! per line, reassembled across reads, with a 1 MiB line cap. A single
//! malformed line is logged and dropped; an oversized line closes the
//! connection.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::protocol::Frame;

/// Hard cap on a single control line.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// The agent's control connection carrying newline-delimited JSON frames.
pub struct FrameTransport {
    inner: Framed<TcpStream, LinesCodec>,
}

impl FrameTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            inner: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        }
    }

    /// Splits into independent halves so the outbound writer task and the
    /// inbound dispatch loop can run concurrently.
    pub fn split(self) -> (FrameSink, FrameSource) {
        let (sink, source) = self.inner.split::<String>();
        (FrameSink { inner: sink }, FrameSource { inner: source })
    }
}

/// Write half: the single writer for the control socket, so frames never
/// interleave mid-line.
pub struct FrameSink {
    inner: SplitSink<Framed<TcpStream, LinesCodec>, String>,
}

impl FrameSink {
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), LinesCodecError> {
        let text = serde_json::to_string(frame).map_err(|e| {
            LinesCodecError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        self.inner.send(text).await
    }
}

/// Read half of the control connection.
pub struct FrameSource {
    inner: SplitStream<Framed<TcpStream, LinesCodec>>,
}

impl FrameSource {
    /// Reads the next frame, skipping empty and malformed lines. `None`
    /// means the connection is done: EOF, a read error, or an oversized
    /// line.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.inner.next().await? {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Frame>(trimmed) {
                        Ok(frame) => return Some(frame),
                        Err(e) => {
                            warn!("Dropping malformed control line: {}", e);
                        }
                    }
                }
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        "Control line exceeded {} bytes, closing connection",
                        MAX_LINE_BYTES
                    );
                    return None;
                }
                Err(LinesCodecError::Io(e)) => {
                    warn!("Control read error: {}", e);
                    return None;
                }
            }
        }
    }
}
