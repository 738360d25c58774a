use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{codec::encode_message, error::*, message::Message};

type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// Serializes outbound frames onto the shared write half of a channel.
///
/// Each call encodes one message up front and then writes it while holding the lock, so frames
/// from concurrent senders never interleave.
pub struct Writer {
    half: Mutex<Option<WriteHalf>>,
    cancel: CancellationToken,
}

impl Writer {
    /// Creates a writer with no channel attached. Writes abort once `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            half: Mutex::new(None),
            cancel,
        }
    }

    /// Attaches the write half of a freshly connected channel.
    pub async fn attach<W>(&self, half: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.half.lock().await = Some(Box::new(half));
    }

    /// Encodes `message` and writes it as a single frame.
    ///
    /// Encoding failures leave the channel untouched. I/O failures mean the channel is broken.
    pub async fn write(&self, message: &Message) -> Result<()> {
        let frame = encode_message(message)?;
        trace!(bytes = frame.len(), "sending message: {:?}", message);
        let mut guard = self.half.lock().await;
        let half = guard
            .as_mut()
            .ok_or(RpcError::Disconnect { source: None })?;
        tokio::select! {
            result = write_frame(half, &frame) => result,
            _ = self.cancel.cancelled() => Err(RpcError::Disconnect { source: None }),
        }
    }

    /// Shuts down and drops the write half. Later writes fail with `Disconnect`.
    pub async fn close(&self) {
        let half = self.half.lock().await.take();
        if let Some(mut half) = half {
            if let Err(e) = half.shutdown().await {
                warn!("error shutting down channel: {}", e);
            }
        }
    }
}

async fn write_frame(half: &mut WriteHalf, frame: &[u8]) -> Result<()> {
    half.write_all(frame).await?;
    half.flush().await?;
    Ok(())
}
