use rmpv::Value;
use tracing::{trace, warn};

use crate::{
    error::{ProtocolError, RpcError},
    message::Message,
    stream::{Broadcaster, StreamEvent},
    table::RequestTable,
};

/// What happened to one inbound value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Dispatched {
    /// A response fulfilled the pending request with this id.
    Completed(u64),
    /// A request or notification went out on the stream.
    Published,
    /// The value was reported as a recoverable error on the stream.
    Anomaly(ProtocolError),
}

/// Routes decoded values: responses to the request table, everything else to the stream.
pub(crate) struct Dispatcher<'a> {
    table: &'a RequestTable,
    stream: &'a Broadcaster,
}

impl<'a> Dispatcher<'a> {
    pub fn new(table: &'a RequestTable, stream: &'a Broadcaster) -> Self {
        Self { table, stream }
    }

    pub fn dispatch(&self, value: Value) -> Dispatched {
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(e) => return self.anomaly(e),
        };
        trace!("received message: {:?}", message);
        match message {
            Message::Response(response) => {
                let id = response.id;
                match self.table.complete(response) {
                    Ok(()) => Dispatched::Completed(id),
                    Err(e) => self.anomaly(e),
                }
            }
            message => {
                self.stream.publish(StreamEvent::Message(message));
                Dispatched::Published
            }
        }
    }

    fn anomaly(&self, error: RpcError) -> Dispatched {
        let error = match error {
            RpcError::Protocol(e) => e,
            other => ProtocolError::Other(other.to_string()),
        };
        warn!("protocol anomaly: {}", error);
        self.stream.publish(StreamEvent::Error(error.clone()));
        Dispatched::Anomaly(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamError;

    fn frame(items: Vec<Value>) -> Value {
        Value::Array(items)
    }

    #[tokio::test]
    async fn test_routes_each_message_kind() {
        let table = RequestTable::new();
        let stream = Broadcaster::new(16);
        let mut subscriber = stream.subscribe();
        let dispatcher = Dispatcher::new(&table, &stream);

        let pending = table.register(0).unwrap();
        assert_eq!(
            dispatcher.dispatch(frame(vec![
                Value::from(1),
                Value::from(0),
                Value::Nil,
                Value::from("ok"),
            ])),
            Dispatched::Completed(0)
        );
        let response = pending.wait().await.unwrap();
        assert_eq!(response.error, Value::Nil);
        assert_eq!(response.result, Value::from("ok"));

        assert_eq!(
            dispatcher.dispatch(frame(vec![
                Value::from(2),
                Value::from("redraw"),
                Value::Array(vec![]),
            ])),
            Dispatched::Published
        );
        assert_eq!(
            dispatcher.dispatch(frame(vec![
                Value::from(0),
                Value::from(7),
                Value::from("ask"),
                Value::Array(vec![Value::from(1)]),
            ])),
            Dispatched::Published
        );

        stream.close(None);
        let messages = subscriber.recv().await.unwrap().unwrap();
        assert_eq!(messages.method(), Some("redraw"));
        match subscriber.recv().await.unwrap().unwrap() {
            Message::Request(req) => assert_eq!(req.id, 7),
            other => panic!("expected request, got {:?}", other),
        }
        assert!(subscriber.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_anomalies_are_reported_not_fatal() {
        let table = RequestTable::new();
        let stream = Broadcaster::new(16);
        let mut subscriber = stream.subscribe();
        let dispatcher = Dispatcher::new(&table, &stream);
        let _pending = table.register(0).unwrap();

        let stray = dispatcher.dispatch(frame(vec![
            Value::from(1),
            Value::from(99),
            Value::Nil,
            Value::Nil,
        ]));
        assert_eq!(
            stray,
            Dispatched::Anomaly(ProtocolError::UnexpectedResponse { id: 99 })
        );
        assert_eq!(table.len(), 1);

        let malformed = dispatcher.dispatch(Value::from("hello"));
        assert!(matches!(
            malformed,
            Dispatched::Anomaly(ProtocolError::InvalidMessage(_))
        ));

        assert!(matches!(
            subscriber.recv().await,
            Some(Err(StreamError::Protocol(
                ProtocolError::UnexpectedResponse { id: 99 }
            )))
        ));
        assert!(matches!(
            subscriber.recv().await,
            Some(Err(StreamError::Protocol(ProtocolError::InvalidMessage(_))))
        ));
    }
}
