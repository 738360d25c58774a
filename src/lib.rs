//! MessagePack-RPC session engine.
//!
//! A [`Session`] connects to a single MessagePack-RPC peer over a Unix domain socket or TCP and
//! lets any number of tasks use that one channel concurrently:
//!
//! - `request` sends a request and waits for the response with the same id, in whatever order
//!   responses arrive. Fire-and-forget requests are written with an id but not awaited.
//! - `notify` sends a notification.
//! - `stream` subscribes to the requests and notifications the peer sends, as a multicast stream.
//! - `stop` tears everything down and fails whatever is still pending.
//!
//! ```no_run
//! use mrpc_session::{Session, SessionConfig, Value};
//!
//! # async fn demo() -> mrpc_session::Result<()> {
//! let session = Session::new(SessionConfig::default());
//! session.run("/tmp/nvim.sock", 8 * 1024).await?;
//!
//! let mut inbound = session.stream();
//! let response = session
//!     .request("nvim_eval", &[Value::from("1 + 1")], true)
//!     .await?;
//! println!("{:?}", response.result);
//!
//! while let Some(Ok(message)) = inbound.recv().await {
//!     println!("{:?}", message);
//! }
//! session.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! Uses `tokio` for async I/O and `rmpv` for MessagePack serialization.

mod codec;
mod config;
mod dispatch;
mod error;
mod message;
mod reader;
mod session;
mod stream;
mod table;
mod transport;
mod writer;

pub use codec::{encode_message, MessageDecoder};
pub use config::*;
pub use error::*;
pub use message::*;
pub use reader::ByteStreamReader;
pub use session::{Session, SessionState};
pub use stream::{MessageStream, StreamError};
pub use table::{FailReason, PendingRequest, RequestTable};
pub use transport::*;
pub use writer::Writer;

pub use rmpv::Value;
