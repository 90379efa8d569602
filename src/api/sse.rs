//! Server-sent event framing.
//!
//! A [`StreamEncoder`] is open until `done` (which writes the `[DONE]`
//! sentinel) or `abort` (which does not). Both end the transport. Any call
//! after that is [`GatewayError::AlreadyTerminal`].

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::GatewayError;

/// Literal payload of the final frame of a completed stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Done,
    Aborted,
}

/// `data: ` framing of `payload`. Embedded newlines start new data lines.
pub fn frame(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + 8);
    for line in payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

pub struct StreamEncoder<W> {
    writer: W,
    state: StreamState,
    frames: u64,
}

impl<W: AsyncWrite + Unpin> StreamEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            state: StreamState::Open,
            frames: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state != StreamState::Open
    }

    /// Frames written so far, sentinel included.
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    fn ensure_open(&self) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::AlreadyTerminal);
        }
        Ok(())
    }

    async fn write_frame(&mut self, payload: &str) -> Result<(), GatewayError> {
        self.writer.write_all(frame(payload).as_bytes()).await?;
        self.writer.flush().await?;
        self.frames += 1;
        Ok(())
    }

    pub async fn write(&mut self, payload: &str) -> Result<(), GatewayError> {
        self.ensure_open()?;
        self.write_frame(payload).await
    }

    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), GatewayError> {
        self.ensure_open()?;
        let payload = serde_json::to_string(value)?;
        self.write_frame(&payload).await
    }

    /// Write the sentinel and end the transport.
    pub async fn done(&mut self) -> Result<(), GatewayError> {
        self.ensure_open()?;
        self.state = StreamState::Done;
        self.write_frame(DONE_SENTINEL).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    /// End the transport without the sentinel.
    pub async fn abort(&mut self) -> Result<(), GatewayError> {
        self.ensure_open()?;
        self.state = StreamState::Aborted;
        // The peer is usually gone already.
        if let Err(error) = self.writer.shutdown().await {
            debug!(%error, "stream shutdown after abort failed");
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_split_multiline_payloads() {
        assert_eq!(frame("hi"), "data: hi\n\n");
        assert_eq!(frame("a\nb"), "data: a\ndata: b\n\n");
    }

    #[tokio::test]
    async fn done_writes_sentinel_last() {
        let mut encoder = StreamEncoder::new(Vec::new());
        encoder.write_json(&json!({"n": 1})).await.unwrap();
        encoder.write("plain").await.unwrap();
        encoder.done().await.unwrap();

        assert_eq!(encoder.state(), StreamState::Done);
        assert_eq!(encoder.frames_written(), 3);
        let written = String::from_utf8(encoder.into_inner()).unwrap();
        assert_eq!(written, "data: {\"n\":1}\n\ndata: plain\n\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn abort_omits_sentinel() {
        let mut encoder = StreamEncoder::new(Vec::new());
        encoder.write("partial").await.unwrap();
        encoder.abort().await.unwrap();

        assert_eq!(encoder.state(), StreamState::Aborted);
        let written = String::from_utf8(encoder.into_inner()).unwrap();
        assert!(!written.contains(DONE_SENTINEL));
    }

    #[tokio::test]
    async fn every_call_after_terminal_is_fatal() {
        let mut encoder = StreamEncoder::new(Vec::new());
        encoder.done().await.unwrap();

        let write = encoder.write("late").await.unwrap_err();
        assert!(write.is_fatal());
        assert!(encoder.write_json(&json!(1)).await.unwrap_err().is_fatal());
        assert!(encoder.done().await.unwrap_err().is_fatal());
        assert!(encoder.abort().await.unwrap_err().is_fatal());
        assert_eq!(encoder.frames_written(), 1);
    }
}
