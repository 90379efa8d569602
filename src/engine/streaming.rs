//! Text fragment streaming from a backend to a request session.

use tokio::sync::mpsc;

/// Default number of fragments buffered between backend and session.
pub const FRAGMENT_BUFFER: usize = 64;

/// Receiving half of a fragment stream.
pub struct TextStream {
    receiver: mpsc::Receiver<String>,
}

impl TextStream {
    /// Create a new fragment stream with sender/receiver pair.
    pub fn new(buffer_size: usize) -> (TextStreamSender, Self) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        (TextStreamSender { sender }, Self { receiver })
    }

    /// Receive the next fragment. Returns `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Take a fragment that is already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

/// Sender half used by backends to push generated text.
#[derive(Clone)]
pub struct TextStreamSender {
    sender: mpsc::Sender<String>,
}

impl TextStreamSender {
    /// Push a fragment, waiting for buffer space.
    pub async fn send(&self, fragment: impl Into<String>) -> Result<(), StreamSendError> {
        self.sender
            .send(fragment.into())
            .await
            .map_err(|_| StreamSendError::Closed)
    }

    /// Push a fragment from a blocking worker thread.
    pub fn blocking_send(&self, fragment: impl Into<String>) -> Result<(), StreamSendError> {
        self.sender
            .blocking_send(fragment.into())
            .map_err(|_| StreamSendError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamSendError {
    #[error("fragment stream closed")]
    Closed,
}
