//! Correlation of outstanding requests with their responses.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::oneshot;
use tracing::trace;

use crate::{
    error::{ProtocolError, Result, RpcError},
    message::Response,
};

/// Why the table stopped accepting requests.
#[derive(Debug, Clone)]
pub enum FailReason {
    /// The owner called `stop`.
    Stopped,
    /// The channel closed or failed. Carries the fatal error, if any.
    ConnectionLost(Option<Arc<RpcError>>),
}

impl FailReason {
    pub fn to_error(&self) -> RpcError {
        match self {
            FailReason::Stopped => RpcError::Stopped,
            FailReason::ConnectionLost(source) => RpcError::Disconnect {
                source: source.clone(),
            },
        }
    }
}

/// A registered request waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    completion: oneshot::Receiver<Result<Response>>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits until the matching response is dispatched or the table is failed.
    pub async fn wait(self) -> Result<Response> {
        self.completion
            .await
            .map_err(|_| RpcError::Disconnect { source: None })?
    }
}

#[derive(Default)]
struct TableState {
    pending: HashMap<u64, oneshot::Sender<Result<Response>>>,
    failed: Option<FailReason>,
}

/// Maps outstanding message ids to their completions.
///
/// `register`, `complete` and `fail_all` share one lock, so a request can never be registered
/// after the table was failed and then wait forever.
#[derive(Default)]
pub struct RequestTable {
    state: Mutex<TableState>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `id` as outstanding and returns the handle its caller waits on.
    pub fn register(&self, id: u64) -> Result<PendingRequest> {
        let mut state = self.lock();
        if let Some(reason) = &state.failed {
            return Err(reason.to_error());
        }
        if state.pending.contains_key(&id) {
            return Err(ProtocolError::DuplicateRequestId { id }.into());
        }
        let (sender, completion) = oneshot::channel();
        state.pending.insert(id, sender);
        Ok(PendingRequest { id, completion })
    }

    /// Fulfills the request matching `response.id` and removes it from the table.
    ///
    /// Fails with `UnexpectedResponse` if no request with that id is outstanding; the table is
    /// left unchanged in that case.
    pub fn complete(&self, response: Response) -> Result<()> {
        let sender = self.lock().pending.remove(&response.id);
        match sender {
            Some(sender) => {
                trace!(id = response.id, "completing request");
                // Receiver may be dropped if caller gave up waiting; ignore send errors.
                drop(sender.send(Ok(response)));
                Ok(())
            }
            None => Err(ProtocolError::UnexpectedResponse { id: response.id }.into()),
        }
    }

    /// Fails every outstanding request with `reason` and refuses further registrations.
    ///
    /// Returns the number of requests that were failed. Only the first reason is kept, and it is
    /// the one every request sees.
    pub fn fail_all(&self, reason: FailReason) -> usize {
        let (reason, pending) = {
            let mut state = self.lock();
            let reason = state.failed.get_or_insert(reason).clone();
            (reason, std::mem::take(&mut state.pending))
        };
        let count = pending.len();
        for (_, sender) in pending {
            drop(sender.send(Err(reason.to_error())));
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
