//! The session façade: one connection, one read loop, many concurrent callers.
//!
//! A [`Session`] owns the channel to a single MessagePack-RPC peer. Outbound requests and
//! notifications go through a shared [`Writer`]; a background task reads inbound frames, completes
//! pending requests and publishes everything else on a multicast [`MessageStream`].
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use rmpv::Value;
use tokio::{io::AsyncRead, sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    codec::MessageDecoder,
    config::SessionConfig,
    dispatch::{Dispatched, Dispatcher},
    error::*,
    message::*,
    reader::ByteStreamReader,
    stream::{Broadcaster, MessageStream, StreamEvent},
    table::{FailReason, RequestTable},
    transport::{Channel, Connector, SocketConnector},
    writer::Writer,
};

/// Lifecycle of a session. A session is used for exactly one connection and cannot be restarted
/// once it reaches `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Running,
    Stopping,
    Stopped,
}

struct Lifecycle {
    state: SessionState,
    reason: Option<FailReason>,
}

/// State shared between the session handle and its read loop.
struct Shared {
    lifecycle: Mutex<Lifecycle>,
    table: RequestTable,
    writer: Writer,
    stream: Broadcaster,
    cancel: CancellationToken,
    next_id: AtomicU64,
    /// Signalled when the lifecycle reaches `Stopped`.
    stopped: Notify,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The error callers see once the session is going down.
    fn failure(&self) -> RpcError {
        self.lifecycle()
            .reason
            .as_ref()
            .map(FailReason::to_error)
            .unwrap_or(RpcError::Stopped)
    }

    /// Tears the session down: closes the channel, fails pending requests and completes the
    /// stream. Only the first call does anything; returns whether this call did the work.
    async fn terminate(&self, reason: FailReason) -> bool {
        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                SessionState::Stopping | SessionState::Stopped => return false,
                _ => {
                    lifecycle.state = SessionState::Stopping;
                    lifecycle.reason = Some(reason.clone());
                }
            }
        }
        debug!("session stopping: {:?}", reason);

        self.cancel.cancel();
        self.writer.close().await;
        let failed = self.table.fail_all(reason.clone());
        if failed > 0 {
            debug!("failed {} pending requests", failed);
        }
        let cause = match reason {
            FailReason::ConnectionLost(cause) => cause,
            FailReason::Stopped => None,
        };
        self.stream.close(cause);

        self.mark_stopped();
        debug!("session stopped");
        true
    }

    fn mark_stopped(&self) {
        self.lifecycle().state = SessionState::Stopped;
        self.stopped.notify_waiters();
    }

    /// Waits until a teardown started elsewhere has finished.
    async fn wait_stopped(&self) {
        let notified = self.stopped.notified();
        tokio::pin!(notified);
        loop {
            // Register before checking the state so a concurrent `mark_stopped` is not missed.
            notified.as_mut().enable();
            let stopped = self.lifecycle().state == SessionState::Stopped;
            if stopped {
                return;
            }
            notified.as_mut().await;
            notified.set(self.stopped.notified());
        }
    }
}

/// A MessagePack-RPC session over one byte-stream channel.
///
/// All methods take `&self`; wrap the session in an `Arc` to issue calls from several tasks.
pub struct Session {
    shared: Arc<Shared>,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    /// Creates an idle session that connects with [`SocketConnector`].
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, SocketConnector)
    }

    /// Creates an idle session that opens its channel through `connector`.
    pub fn with_connector<C>(config: SessionConfig, connector: C) -> Self
    where
        C: Connector + 'static,
    {
        let config = config.normalized();
        let cancel = CancellationToken::new();
        Self {
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Idle,
                    reason: None,
                }),
                table: RequestTable::new(),
                writer: Writer::new(cancel.clone()),
                stream: Broadcaster::new(config.stream_capacity),
                cancel,
                next_id: AtomicU64::new(0),
                stopped: Notify::new(),
            }),
            config,
            connector: Arc::new(connector),
            read_task: Mutex::new(None),
        }
    }

    /// The session's current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.lifecycle().state
    }

    /// Connects to `address` and starts the read loop, reading at most `read_buffer_size` bytes
    /// at a time.
    ///
    /// Resolves once the channel is up. A session runs once: calling this again, or after a
    /// failed connect, is an error.
    pub async fn run(&self, address: &str, read_buffer_size: usize) -> Result<()> {
        self.begin(SessionState::Connecting)?;
        debug!("connecting to {}", address);
        match self.connector.connect(address).await {
            Ok(channel) => self.start(channel, read_buffer_size).await,
            Err(e) => {
                warn!("connect to {} failed: {}", address, e);
                self.shared
                    .terminate(FailReason::ConnectionLost(None))
                    .await;
                Err(e)
            }
        }
    }

    /// Runs the session over a channel that is already connected, such as an accepted socket.
    /// Reads use the configured `read_buffer_size`.
    pub async fn run_with<C: Channel>(&self, channel: C) -> Result<()> {
        self.begin(SessionState::Connecting)?;
        self.start(channel, self.config.read_buffer_size).await
    }

    fn begin(&self, next: SessionState) -> Result<()> {
        let mut lifecycle = self.shared.lifecycle();
        if lifecycle.state != SessionState::Idle {
            return Err(RpcError::InvalidState {
                expected: SessionState::Idle,
                actual: lifecycle.state,
            });
        }
        lifecycle.state = next;
        Ok(())
    }

    async fn start<C: Channel>(&self, channel: C, read_buffer_size: usize) -> Result<()> {
        let (read_half, write_half) = tokio::io::split(channel);
        self.shared.writer.attach(write_half).await;

        let stopped_meanwhile = {
            let mut lifecycle = self.shared.lifecycle();
            if lifecycle.state == SessionState::Connecting {
                lifecycle.state = SessionState::Running;
                false
            } else {
                true
            }
        };
        if stopped_meanwhile {
            self.shared.writer.close().await;
            return Err(self.shared.failure());
        }

        let reader = ByteStreamReader::new(
            read_half,
            read_buffer_size,
            MessageDecoder::new(self.config.max_buffered_bytes),
        );
        let handle = tokio::spawn(read_loop(self.shared.clone(), reader));
        *self
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!("session running");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        let lifecycle = self.shared.lifecycle();
        match lifecycle.state {
            SessionState::Running => Ok(()),
            SessionState::Stopping | SessionState::Stopped => Err(lifecycle
                .reason
                .as_ref()
                .map(FailReason::to_error)
                .unwrap_or(RpcError::Stopped)),
            actual => Err(RpcError::InvalidState {
                expected: SessionState::Running,
                actual,
            }),
        }
    }

    /// Sends a request with the next message id.
    ///
    /// With `expects_return_value`, resolves with the peer's response once it arrives, or fails
    /// when the session stops first. Otherwise the request is still written with its id, and the
    /// call resolves right after the write with a nil response.
    pub async fn request(
        &self,
        method: &str,
        params: &[Value],
        expects_return_value: bool,
    ) -> Result<Response> {
        self.ensure_running()?;
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let pending = if expects_return_value {
            match self.shared.table.register(id) {
                Ok(pending) => Some(pending),
                Err(RpcError::Protocol(e)) => {
                    warn!("request registration failed: {}", e);
                    self.shared.stream.publish(StreamEvent::Error(e.clone()));
                    return Err(RpcError::Protocol(e));
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        self.send(Message::Request(Request {
            id,
            method: method.to_string(),
            params: params.to_vec(),
        }))
        .await?;

        match pending {
            Some(pending) => pending.wait().await,
            None => Ok(Response {
                id,
                error: Value::Nil,
                result: Value::Nil,
            }),
        }
    }

    /// Sends a request and waits for its result, mapping a peer error into
    /// [`RpcError::Service`].
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        self.request(method, params, true).await?.into_result()
    }

    /// Sends a notification. Consumes no message id.
    pub async fn notify(&self, method: &str, params: &[Value]) -> Result<()> {
        self.ensure_running()?;
        self.send(Message::Notification(Notification {
            method: method.to_string(),
            params: params.to_vec(),
        }))
        .await
    }

    /// Answers a request the peer sent us, as received on the stream.
    pub async fn respond(&self, id: u64, error: Value, result: Value) -> Result<()> {
        self.ensure_running()?;
        self.send(Message::Response(Response { id, error, result }))
            .await
    }

    /// Subscribes to inbound requests and notifications from this point on.
    pub fn stream(&self) -> MessageStream {
        self.shared.stream.subscribe()
    }

    /// Stops the session: closes the channel, ends the read loop, fails every pending request
    /// with [`RpcError::Stopped`] and completes the stream. Safe to call more than once.
    ///
    /// If the session is already going down for another reason, waits for that teardown to
    /// finish, so the state is `Stopped` when this returns.
    pub async fn stop(&self) {
        if !self.shared.terminate(FailReason::Stopped).await {
            self.shared.wait_stopped().await;
        }
        let handle = self
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Error joining read loop: {}", e);
            }
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        match self.shared.writer.write(&message).await {
            Ok(()) => Ok(()),
            Err(RpcError::Io(e)) => {
                error!("write failed: {}", e);
                let cause = RpcError::Io(io::Error::new(e.kind(), e.to_string()));
                self.shared
                    .terminate(FailReason::ConnectionLost(Some(Arc::new(cause))))
                    .await;
                Err(RpcError::Io(e))
            }
            Err(RpcError::Disconnect { .. }) => Err(self.shared.failure()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.table.fail_all(FailReason::Stopped);
        self.shared.stream.close(None);
    }
}

/// Reads, decodes and dispatches inbound frames until the channel closes, fails, or the session
/// is stopped.
async fn read_loop<R>(shared: Arc<Shared>, mut reader: ByteStreamReader<R>)
where
    R: AsyncRead + Unpin,
{
    let cause = 'read: loop {
        let read = tokio::select! {
            _ = shared.cancel.cancelled() => {
                trace!("read loop cancelled");
                return;
            }
            read = reader.fill() => read,
        };
        match read {
            Ok(0) => {
                debug!("peer closed the channel");
                if reader.buffered() > 0 {
                    warn!("discarding {} bytes of incomplete frame", reader.buffered());
                }
                break None;
            }
            Ok(_) => {}
            Err(e) => {
                error!("read failed: {}", e);
                break Some(e);
            }
        }

        let dispatcher = Dispatcher::new(&shared.table, &shared.stream);
        loop {
            match reader.next_value() {
                Ok(Some(value)) => match dispatcher.dispatch(value) {
                    Dispatched::Completed(id) => trace!(id, "response matched"),
                    Dispatched::Published => {}
                    Dispatched::Anomaly(e) => debug!("continuing after anomaly: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("undecodable inbound data: {}", e);
                    break 'read Some(e);
                }
            }
        }
    };

    shared
        .terminate(FailReason::ConnectionLost(cause.map(Arc::new)))
        .await;
}
