//! Remote procedure calls and event feeds over one framed connection.
//!
//! A server hosts [`Protocol`]s, each a numbered namespace of native
//! functions and feeds. Clients call those functions by
//! `(protocol_id, function_id)` and get a [`Promise`] for the result; replies
//! may arrive in any order and are matched to their call by correlation id.
//! Arguments and results travel in a self-describing, type-tagged binary
//! format (see [`codec`]).
//!
//! ```no_run
//! use rpcservice::{Protocol, ServiceClient, ServiceServer};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut math = Protocol::new();
//! math.expose(42, |a: i64, b: i64| a + b)?;
//!
//! let server = ServiceServer::builder().add(1, math)?.build();
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.serve_tcp("127.0.0.1:8080").await }
//! });
//!
//! let client = ServiceClient::connect("127.0.0.1:8080").await?;
//! let sum: i64 = client.call(1, 42, &(2i64, 3i64)).wait().await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

pub mod calling;
pub mod codec;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod envelope;
pub mod error;
pub mod feed;
pub mod net;
pub mod promise;
pub mod protocol;
pub mod registry;
pub mod types;

pub use calling::{Async, CallContext, Handler, IntoReply, Reply, WithClient};
pub use codec::{
    decode_from_bytes, encode_args, encode_to_bytes, Args, Decode, DecodeError, Encode, SizeCounter, WireReader,
    WireWrite,
};
pub use config::ServiceConfig;
pub use connection::{Connection, SendError};
pub use dispatcher::DispatchError;
pub use envelope::{Classification, Envelope, EnvelopeError};
pub use error::{CallError, ErrorCode, RemoteError, ServiceError};
pub use feed::{FeedKey, Publisher, SubscriptionHandle};
pub use net::{
    client::{ClientBuilder, ServiceClient},
    server::{ServerBuilder, ServiceServer},
};
pub use promise::{Promise, PromiseError, PromiseTable};
pub use protocol::{Protocol, RegistryError};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use types::{Type, TypeMismatch, Value};
