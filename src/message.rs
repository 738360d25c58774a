//! MessagePack-RPC message types and their mapping to and from MessagePack values.
//!
//! Frames on the wire are arrays:
//!
//! - Request: `[0, msgid, method, params]`
//! - Response: `[1, msgid, error, result]`
//! - Notification: `[2, method, params]`
use rmpv::Value;

use crate::error::*;

const REQUEST_MESSAGE: u64 = 0;
const RESPONSE_MESSAGE: u64 = 1;
const NOTIFICATION_MESSAGE: u64 = 2;

/// Represents the different types of RPC messages: requests, responses, and notifications.
#[derive(PartialEq, Clone, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// An RPC request message containing an ID, method name, and parameters.
#[derive(PartialEq, Clone, Debug)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

/// An RPC response message. A nil `error` means the call succeeded and `result` holds its value.
#[derive(PartialEq, Clone, Debug)]
pub struct Response {
    pub id: u64,
    pub error: Value,
    pub result: Value,
}

/// An RPC notification message containing a method name and parameters.
#[derive(PartialEq, Clone, Debug)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

impl Response {
    /// Returns true if the peer reported an error.
    pub fn is_error(&self) -> bool {
        !self.error.is_nil()
    }

    /// Converts the response into the call's result, mapping a non-nil error into
    /// [`RpcError::Service`].
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Value::Nil => Ok(self.result),
            Value::Map(map) => {
                let field = |key: &str| {
                    map.iter()
                        .find(|(k, _)| k.as_str() == Some(key))
                        .map(|(_, v)| v)
                };
                let named = match (field("name"), field("value")) {
                    (Some(Value::String(name)), Some(value)) => name
                        .as_str()
                        .map(|name| (name.to_string(), value.clone())),
                    _ => None,
                };
                let service_error = match named {
                    Some((name, value)) => ServiceError { name, value },
                    None => ServiceError {
                        name: "UnknownError".to_string(),
                        value: Value::Map(map),
                    },
                };
                Err(RpcError::Service(service_error))
            }
            other => Err(RpcError::Service(ServiceError {
                name: "RemoteError".to_string(),
                value: other,
            })),
        }
    }
}

impl Message {
    /// Converts the message to a MessagePack-RPC compatible Value.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(req) => Value::Array(vec![
                Value::from(REQUEST_MESSAGE),
                Value::from(req.id),
                Value::String(req.method.clone().into()),
                Value::Array(req.params.clone()),
            ]),
            Message::Response(resp) => Value::Array(vec![
                Value::from(RESPONSE_MESSAGE),
                Value::from(resp.id),
                resp.error.clone(),
                resp.result.clone(),
            ]),
            Message::Notification(notif) => Value::Array(vec![
                Value::from(NOTIFICATION_MESSAGE),
                Value::String(notif.method.clone().into()),
                Value::Array(notif.params.clone()),
            ]),
        }
    }

    /// Classifies a decoded value as a request, response or notification.
    ///
    /// The arity must match the tag exactly: four elements for tags 0 and 1, three for tag 2.
    pub fn from_value(value: Value) -> Result<Self> {
        let array = match value {
            Value::Array(array) => array,
            other => return Err(invalid(format!("expected array, got {}", kind(&other)))),
        };
        let tag = array
            .first()
            .ok_or_else(|| invalid("empty message array"))?
            .as_u64()
            .ok_or_else(|| invalid("message type is not an unsigned integer"))?;

        match (array.len(), tag) {
            (4, REQUEST_MESSAGE) => {
                let mut fields = array.into_iter().skip(1);
                let id = take_id(fields.next(), "request")?;
                let method = take_method(fields.next(), "request")?;
                let params = take_params(fields.next(), "request")?;
                Ok(Message::Request(Request { id, method, params }))
            }
            (4, RESPONSE_MESSAGE) => {
                let mut fields = array.into_iter().skip(1);
                let id = take_id(fields.next(), "response")?;
                let error = fields.next().unwrap_or(Value::Nil);
                let result = fields.next().unwrap_or(Value::Nil);
                Ok(Message::Response(Response { id, error, result }))
            }
            (3, NOTIFICATION_MESSAGE) => {
                let mut fields = array.into_iter().skip(1);
                let method = take_method(fields.next(), "notification")?;
                let params = take_params(fields.next(), "notification")?;
                Ok(Message::Notification(Notification { method, params }))
            }
            (len, tag) => Err(invalid(format!(
                "message type {} with {} elements",
                tag, len
            ))),
        }
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(notif) => Some(&notif.method),
            Message::Response(_) => None,
        }
    }
}

fn invalid(message: impl Into<String>) -> RpcError {
    RpcError::Protocol(ProtocolError::InvalidMessage(message.into()))
}

fn take_id(field: Option<Value>, what: &str) -> Result<u64> {
    field
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid(format!("invalid {} id", what)))
}

fn take_method(field: Option<Value>, what: &str) -> Result<String> {
    field
        .as_ref()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("invalid {} method", what)))
}

fn take_params(field: Option<Value>, what: &str) -> Result<Vec<Value>> {
    match field {
        Some(Value::Array(params)) => Ok(params),
        _ => Err(invalid(format!("invalid {} params", what))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(..) => "extension",
    }
}
