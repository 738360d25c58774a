use std::{io, sync::Arc};

use rmpv::Value;
use thiserror::Error;

use crate::session::SessionState;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The channel could not be established.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Error occurred while reading from or writing to the channel.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error occurred during MessagePack serialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmpv::encode::Error),

    /// Error occurred during MessagePack deserialization.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmpv::decode::Error),

    /// Error related to the RPC protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection was lost before the operation could complete. Carries the fatal error that
    /// brought the session down, if there was one.
    #[error("connection lost")]
    Disconnect {
        #[source]
        source: Option<Arc<RpcError>>,
    },

    /// The session was stopped by its owner.
    #[error("session stopped")]
    Stopped,

    /// The operation is not valid in the session's current lifecycle state.
    #[error("invalid session state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    /// Error returned by the remote peer in a response.
    #[error("Service error: {0}")]
    Service(ServiceError),
}

/// Violations of the MessagePack-RPC framing or correlation rules.
///
/// None of these bring a session down on their own, except `FrameTooLarge`, which leaves the
/// inbound stream without a way to resynchronize.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// A decoded value did not have the shape of a request, response or notification.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A response arrived for an id with no outstanding request.
    #[error("unexpected response for id {id}")]
    UnexpectedResponse { id: u64 },

    /// A request id was registered while a request with the same id was still pending.
    #[error("request id {id} is already outstanding")]
    DuplicateRequestId { id: u64 },

    /// A single incomplete value outgrew the inbound buffer limit.
    #[error("buffered frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("{0}")]
    Other(String),
}

impl From<String> for ProtocolError {
    fn from(message: String) -> Self {
        ProtocolError::Other(message)
    }
}

impl From<&str> for ProtocolError {
    fn from(message: &str) -> Self {
        ProtocolError::Other(message.to_string())
    }
}

/// An error reported by the remote peer in the error slot of a response.
///
/// Peers that follow the mrpc convention send a map with "name" and "value" keys; anything else is
/// wrapped under a synthetic name by [`crate::Response::into_result`].
#[derive(Error, Debug, Clone, PartialEq)]
pub struct ServiceError {
    pub name: String,
    pub value: Value,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Service error {}: {:?}", self.name, self.value)
    }
}

impl From<ServiceError> for Value {
    fn from(error: ServiceError) -> Self {
        Value::Map(vec![
            (
                Value::String("name".into()),
                Value::String(error.name.into()),
            ),
            (Value::String("value".into()), error.value),
        ])
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_disconnect_exposes_cause() {
        let cause = Arc::new(RpcError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "pipe closed",
        )));
        let err = RpcError::Disconnect {
            source: Some(cause),
        };
        assert_eq!(err.to_string(), "connection lost");
        let source = err.source().expect("disconnect should carry its cause");
        assert!(source.to_string().contains("pipe closed"));

        let clean = RpcError::Disconnect { source: None };
        assert!(clean.source().is_none());
    }

    #[test]
    fn test_protocol_error_from_strings() {
        let err: ProtocolError = "boom".into();
        assert_eq!(err, ProtocolError::Other("boom".into()));
        let err: RpcError = ProtocolError::from(String::from("bad")).into();
        assert_eq!(err.to_string(), "Protocol error: bad");
    }

    #[test]
    fn test_service_error_into_value() {
        let value: Value = ServiceError {
            name: "MethodNotFound".into(),
            value: Value::from("nope"),
        }
        .into();
        assert_eq!(
            value,
            Value::Map(vec![
                (Value::from("name"), Value::from("MethodNotFound")),
                (Value::from("value"), Value::from("nope")),
            ])
        );
    }
}
