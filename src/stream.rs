//! Multicast stream of inbound requests and notifications.
//!
//! Every subscriber holds its own cursor into a bounded broadcast ring. Subscribers only see events
//! published after they subscribed; nothing is replayed.
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{
    error::{ProtocolError, RpcError},
    message::Message,
};

/// An event published to stream subscribers.
#[derive(Debug, Clone)]
pub(crate) enum StreamEvent {
    /// An inbound request or notification.
    Message(Message),
    /// A recoverable anomaly; the session keeps running.
    Error(ProtocolError),
    /// The session failed. Always the last event.
    Terminated(Arc<RpcError>),
}

/// Errors observed on a [`MessageStream`].
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// An inbound value was not a valid message, or a response matched no request.
    #[error("protocol anomaly: {0}")]
    Protocol(ProtocolError),

    /// The subscriber fell behind and missed this many events.
    #[error("subscriber lagged by {0} events")]
    Lagged(u64),

    /// The session hit a fatal error. No further events follow.
    #[error("session terminated: {0}")]
    Terminated(Arc<RpcError>),
}

impl StreamError {
    /// True if the stream has ended with this error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamError::Terminated(_))
    }
}

/// A subscription to a session's inbound requests and notifications.
#[derive(Debug)]
pub struct MessageStream {
    receiver: Option<broadcast::Receiver<StreamEvent>>,
}

impl MessageStream {
    fn closed() -> Self {
        Self { receiver: None }
    }

    /// Waits for the next inbound request or notification.
    ///
    /// Returns `Some(Err(_))` for error events and `None` once the stream has completed, either
    /// because the session stopped or the peer closed the channel.
    pub async fn recv(&mut self) -> Option<std::result::Result<Message, StreamError>> {
        let event = self.receiver.as_mut()?.recv().await;
        let item = match event {
            Ok(StreamEvent::Message(message)) => Ok(message),
            Ok(StreamEvent::Error(error)) => Err(StreamError::Protocol(error)),
            Ok(StreamEvent::Terminated(cause)) => {
                self.receiver = None;
                Err(StreamError::Terminated(cause))
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => Err(StreamError::Lagged(missed)),
            Err(broadcast::error::RecvError::Closed) => {
                self.receiver = None;
                return None;
            }
        };
        Some(item)
    }

    /// Collects messages until the stream completes, skipping recoverable errors.
    ///
    /// Fails if the stream terminates with an error.
    pub async fn collect_messages(mut self) -> std::result::Result<Vec<Message>, StreamError> {
        let mut messages = Vec::new();
        while let Some(item) = self.recv().await {
            match item {
                Ok(message) => messages.push(message),
                Err(e) if e.is_terminal() => return Err(e),
                Err(_) => {}
            }
        }
        Ok(messages)
    }
}

/// Publishing side of the stream, owned by the session.
pub(crate) struct Broadcaster {
    sender: Mutex<Option<broadcast::Sender<StreamEvent>>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn subscribe(&self) -> MessageStream {
        match &*self.sender.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(sender) => MessageStream {
                receiver: Some(sender.subscribe()),
            },
            None => MessageStream::closed(),
        }
    }

    pub fn publish(&self, event: StreamEvent) {
        if let Some(sender) = &*self.sender.lock().unwrap_or_else(PoisonError::into_inner) {
            // No subscribers is not an error; events are not retained.
            if sender.send(event).is_err() {
                trace!("no stream subscribers, event dropped");
            }
        }
    }

    /// Completes the stream, publishing `cause` as a terminal event first if there is one.
    pub fn close(&self, cause: Option<Arc<RpcError>>) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(sender), Some(cause)) = (&sender, cause) {
            drop(sender.send(StreamEvent::Terminated(cause)));
        }
    }
}
