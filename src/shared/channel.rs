//! Framed message transport over a duplex byte stream.
//!
//! Framing is an 8-byte big-endian length prefix followed by that many bytes
//! of serialised payload. A receive reads exactly one frame; a send writes
//! exactly one frame atomically with respect to other sends on the same
//! channel (each half sits behind its own async mutex, the way a stdio
//! transport guards its stdin and stdout).
//!
//! Transport failures (short read inside a frame, oversized frame, broken
//! pipe) are [`Error::Channel`]; payloads that cannot be encoded or decoded
//! are [`Error::Serialization`]. The two never mix: a serialization failure
//! leaves the stream intact and positioned at a frame boundary.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::Message;

/// Default cap on a single frame's declared payload length: 1 GiB.
pub const MAX_FRAME_LEN: u64 = 1024 * 1024 * 1024;

/// Reads length-prefixed frames from an async byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_frame_len: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a readable stream with the default frame cap.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Overrides the frame cap. Frames declaring a longer payload fail the
    /// receive with [`Error::Channel`] without reading the payload.
    pub fn with_max_frame_len(mut self, max: u64) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Reads exactly one frame and decodes its message.
    pub async fn read_message(&mut self) -> Result<Message> {
        let mut prefix = [0u8; 8];
        self.inner
            .read_exact(&mut prefix)
            .await
            .map_err(|e| Error::Channel(format!("failed to read frame header: {e}")))?;

        let len = u64::from_be_bytes(prefix);
        if len > self.max_frame_len {
            return Err(Error::Channel(format!(
                "frame of {len} bytes exceeds the {} byte cap",
                self.max_frame_len
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::Channel(format!("failed to read frame payload: {e}")))?;

        serde_json::from_slice(&payload)
            .map_err(|e| Error::Serialization(format!("failed to decode message: {e}")))
    }
}

/// Writes length-prefixed frames to an async byte stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a writable stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encodes a message and writes it as one frame, flushing afterwards.
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| Error::Serialization(format!("failed to encode message: {e}")))?;

        let prefix = (payload.len() as u64).to_be_bytes();
        self.inner
            .write_all(&prefix)
            .await
            .map_err(|e| Error::Channel(format!("failed to write frame header: {e}")))?;
        self.inner
            .write_all(&payload)
            .await
            .map_err(|e| Error::Channel(format!("failed to write frame payload: {e}")))?;
        self.inner
            .flush()
            .await
            .map_err(|e| Error::Channel(format!("failed to flush frame: {e}")))?;
        Ok(())
    }
}

/// Duplex message transport: a frame reader and a frame writer, each behind
/// its own async mutex so concurrent senders (or one sender and one
/// receiver) interleave at frame granularity.
#[derive(Debug)]
pub struct Channel<R, W> {
    reader: Mutex<FrameReader<R>>,
    writer: Mutex<FrameWriter<W>>,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Builds a channel from a readable and a writable half.
    pub fn new(read: R, write: W) -> Self {
        Self {
            reader: Mutex::new(FrameReader::new(read)),
            writer: Mutex::new(FrameWriter::new(write)),
        }
    }

    /// Sends one message as one frame.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_message(message).await
    }

    /// Receives one message from one frame.
    pub async fn receive(&self) -> Result<Message> {
        let mut reader = self.reader.lock().await;
        reader.read_message().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitResult, Job, Outcome};
    use serde_json::json;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer
                .write_message(&Message::Job(Job::new("echo", json!("hello"))))
                .await
                .unwrap();
            writer.write_message(&Message::Stop).await.unwrap();
        }

        let mut reader = FrameReader::new(buf.as_slice());
        match reader.read_message().await.unwrap() {
            Message::Job(job) => assert_eq!(job.payload, json!("hello")),
            other => panic!("expected job, got {}", other.kind_name()),
        }
        assert!(matches!(
            reader.read_message().await.unwrap(),
            Message::Stop
        ));
    }

    #[tokio::test]
    async fn length_prefix_is_big_endian() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer.write_message(&Message::Stop).await.unwrap();
        }
        let payload_len = buf.len() - 8;
        assert_eq!(&buf[..8], &(payload_len as u64).to_be_bytes());
    }

    #[tokio::test]
    async fn short_read_inside_frame_is_channel_error() {
        // A header declaring 100 bytes followed by only 3.
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u64.to_be_bytes());
        buf.extend_from_slice(b"abc");

        let mut reader = FrameReader::new(buf.as_slice());
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, Error::Channel(_)), "got: {err}");
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_is_channel_error() {
        let mut reader = FrameReader::new(&[][..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, Error::Channel(_)), "got: {err}");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading_payload() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(64u64).to_be_bytes());
        buf.extend_from_slice(&[0u8; 64]);

        let mut reader = FrameReader::new(buf.as_slice()).with_max_frame_len(16);
        let err = reader.read_message().await.unwrap_err();
        match err {
            Error::Channel(msg) => assert!(msg.contains("exceeds"), "got: {msg}"),
            other => panic!("expected channel error, got: {other}"),
        }
    }

    #[tokio::test]
    async fn undecodable_payload_is_serialization_error() {
        let garbage = b"not json at all";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(garbage.len() as u64).to_be_bytes());
        buf.extend_from_slice(garbage);

        let mut reader = FrameReader::new(buf.as_slice());
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)), "got: {err}");
    }

    #[tokio::test]
    async fn channel_sends_over_duplex_stream() {
        let (parent, child) = tokio::io::duplex(4096);
        let (pr, pw) = tokio::io::split(parent);
        let (cr, cw) = tokio::io::split(child);
        let parent_chan = Channel::new(pr, pw);
        let child_chan = Channel::new(cr, cw);

        parent_chan
            .send(&Message::Job(Job::new("echo", json!(1))))
            .await
            .unwrap();
        let got = child_chan.receive().await.unwrap();
        assert!(matches!(got, Message::Job(_)));

        child_chan
            .send(&Message::ExitResult(ExitResult {
                outcome: Outcome::Value(json!(0)),
            }))
            .await
            .unwrap();
        let got = parent_chan.receive().await.unwrap();
        assert!(matches!(got, Message::ExitResult(_)));
    }
}
