//! # Line-Framed JSON Transport
//!
//! Wraps a bytestream in newline-delimited JSON framing for the control
//! protocol: one [`Frame`] per line, UTF-8, no length prefix. The read side
//! reassembles partial lines across reads; the write side serializes a frame
//! and appends `\n`.
//!
//! A single malformed line is logged and dropped without tearing down the
//! connection. A line exceeding [`MAX_LINE_BYTES`] is treated as a protocol
//! violation and closes the connection.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::protocol::Frame;

/// Hard cap on a single control line. Frames are small (payloads are 8 KiB
/// reads base64-encoded), so anything near this size is garbage input.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A control connection carrying newline-delimited JSON frames.
pub struct FrameTransport<T> {
    inner: Framed<T, LinesCodec>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> FrameTransport<T> {
    pub fn new(io: T) -> Self {
        Self::with_max_line(io, MAX_LINE_BYTES)
    }

    fn with_max_line(io: T, max: usize) -> Self {
        Self {
            inner: Framed::new(io, LinesCodec::new_with_max_length(max)),
        }
    }

    /// Splits into independent read and write halves so that an outbound
    /// writer task and the inbound dispatch loop can run concurrently.
    pub fn split(self) -> (FrameSink<T>, FrameSource<T>) {
        let (sink, source) = self.inner.split::<String>();
        (FrameSink { inner: sink }, FrameSource { inner: source })
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), LinesCodecError> {
        self.inner.send(encode_frame(frame)?).await
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        next_from(&mut self.inner).await
    }
}

/// Write half of a split [`FrameTransport`].
pub struct FrameSink<T> {
    inner: SplitSink<Framed<T, LinesCodec>, String>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> FrameSink<T> {
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), LinesCodecError> {
        self.inner.send(encode_frame(frame)?).await
    }
}

/// Read half of a split [`FrameTransport`].
pub struct FrameSource<T> {
    inner: SplitStream<Framed<T, LinesCodec>>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> FrameSource<T> {
    /// Reads the next frame, skipping empty and malformed lines. `None`
    /// means the connection is done: EOF, a read error, or an oversized
    /// line.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        next_from(&mut self.inner).await
    }
}

fn encode_frame(frame: &Frame) -> Result<String, LinesCodecError> {
    serde_json::to_string(frame)
        .map_err(|e| LinesCodecError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

async fn next_from<S>(lines: &mut S) -> Option<Frame>
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    loop {
        match lines.next().await? {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reassembles_frames_split_across_reads() {
        let (mut wr, rd) = tokio::io::duplex(256);
        let mut transport = FrameTransport::new(rd);

        wr.write_all(b"{\"type\":\"con").await.unwrap();
        wr.write_all(b"nect\",\"requestId\":\"r1\"}\n").await.unwrap();

        let frame = transport.next_frame().await.unwrap();
        assert_eq!(
            frame,
            Frame::Connect {
                request_id: "r1".into()
            }
        );
    }

    #[tokio::test]
    async fn parses_multiple_frames_from_one_read() {
        let (mut wr, rd) = tokio::io::duplex(256);
        let mut transport = FrameTransport::new(rd);

        wr.write_all(b"{\"type\":\"end\",\"requestId\":\"a\"}\n{\"type\":\"end\",\"requestId\":\"b\"}\n")
            .await
            .unwrap();

        assert_eq!(
            transport.next_frame().await.unwrap(),
            Frame::End {
                request_id: "a".into()
            }
        );
        assert_eq!(
            transport.next_frame().await.unwrap(),
            Frame::End {
                request_id: "b".into()
            }
        );
    }

    #[tokio::test]
    async fn malformed_line_is_dropped_without_closing() {
        let (mut wr, rd) = tokio::io::duplex(256);
        let mut transport = FrameTransport::new(rd);

        wr.write_all(b"this is not json\n\n{\"type\":\"unauthorized\"}\n")
            .await
            .unwrap();

        assert_eq!(transport.next_frame().await.unwrap(), Frame::Unauthorized);
    }

    #[tokio::test]
    async fn oversized_line_closes_the_stream() {
        let (mut wr, rd) = tokio::io::duplex(1024);
        let mut transport = FrameTransport::with_max_line(rd, 64);

        let long = vec![b'x'; 256];
        wr.write_all(&long).await.unwrap();
        wr.write_all(b"\n").await.unwrap();
        drop(wr);

        assert_eq!(transport.next_frame().await, None);
    }

    #[tokio::test]
    async fn eof_yields_none() {
        let (wr, rd) = tokio::io::duplex(64);
        let mut transport = FrameTransport::new(rd);
        drop(wr);
        assert_eq!(transport.next_frame().await, None);
    }

    #[tokio::test]
    async fn send_frame_writes_one_line() {
        let (wr, mut rd) = tokio::io::duplex(256);
        let mut transport = FrameTransport::new(wr);

        transport
            .send_frame(&Frame::Registered {
                backend_id: "b1".into(),
            })
            .await
            .unwrap();

        let mut peer = FrameTransport::new(&mut rd);
        assert_eq!(
            peer.next_frame().await.unwrap(),
            Frame::Registered {
                backend_id: "b1".into()
            }
        );
    }
}
