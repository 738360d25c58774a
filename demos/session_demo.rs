//! Runs a session against a tiny in-process peer on a Unix socket.
//!
//! The peer answers `add` requests, rejects everything else, and pushes one notification.
//! Set `RUST_LOG=mrpc_session=trace` to watch the frames go by.

use bytes::BytesMut;
use mrpc_session::{
    encode_message, Message, MessageDecoder, Notification, Response, Result, ServiceError,
    Session, SessionConfig, Value,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};
use tokio_util::codec::Decoder;
use tracing_subscriber::EnvFilter;

async fn peer(mut socket: UnixStream) -> Result<()> {
    let mut decoder = MessageDecoder::default();
    let mut buf = BytesMut::new();

    let hello = Message::Notification(Notification {
        method: "hello".into(),
        params: vec![Value::from("from the peer")],
    });
    socket.write_all(&encode_message(&hello)?).await?;

    loop {
        while let Some(value) = decoder.decode(&mut buf)? {
            let Message::Request(req) = Message::from_value(value)? else {
                continue;
            };
            let (error, result) = match req.method.as_str() {
                "add" => {
                    let sum: i64 = req.params.iter().filter_map(Value::as_i64).sum();
                    (Value::Nil, Value::from(sum))
                }
                other => (
                    ServiceError {
                        name: "MethodNotFound".into(),
                        value: Value::from(format!("Method '{}' not found", other)),
                    }
                    .into(),
                    Value::Nil,
                ),
            };
            let reply = Message::Response(Response {
                id: req.id,
                error,
                result,
            });
            socket.write_all(&encode_message(&reply)?).await?;
        }
        if socket.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = std::env::temp_dir().join(format!("mrpc-session-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("peer.sock");
    let listener = UnixListener::bind(&path)?;
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            if let Err(e) = peer(socket).await {
                eprintln!("peer error: {}", e);
            }
        }
    });

    let session = Session::new(SessionConfig::default());
    let mut inbound = session.stream();
    session.run(&path.to_string_lossy(), 4096).await?;

    if let Some(Ok(message)) = inbound.recv().await {
        println!("peer says: {:?}", message);
    }

    let sum = session
        .call("add", &[Value::from(40), Value::from(2)])
        .await?;
    println!("40 + 2 = {}", sum);

    match session.call("divide", &[Value::from(1)]).await {
        Err(e) => println!("divide failed as expected: {}", e),
        Ok(value) => println!("unexpected result: {}", value),
    }

    session.stop().await;
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
