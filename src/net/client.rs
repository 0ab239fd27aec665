use super::add_protocol;
use crate::{
    codec::{Args, Decode},
    config::ServiceConfig,
    connection::Connection,
    dispatcher::Dispatcher,
    error::{CallError, Result},
    feed::SubscriptionHandle,
    promise::Promise,
    protocol::{Protocol, RegistryError},
    registry::ConnectionHandle,
};
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
};
use tracing::info;

#[derive(Default)]
pub struct ClientBuilder {
    protocols: HashMap<u64, Protocol>,
    config: ServiceConfig,
}

impl ClientBuilder {
    /// Hosts a protocol on the client, for the server to call back into.
    pub fn add(mut self, protocol_id: u64, protocol: Protocol) -> Result<Self, RegistryError> {
        add_protocol(&mut self.protocols, protocol_id, protocol)?;
        Ok(self)
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn connect<A: ToSocketAddrs>(self, addr: A) -> Result<ServiceClient> {
        let sock = TcpStream::connect(addr).await?;
        sock.set_nodelay(true)?;
        let peer = sock.peer_addr().ok();
        let client = self.open(sock, peer);
        info!(connection = %client.handle(), peer = ?peer, "connected");
        Ok(client)
    }

    /// Connects over an already established stream, e.g. one half of a
    /// `tokio::io::duplex` pair. Must be called inside a Tokio runtime.
    pub fn connect_stream<S>(self, stream: S) -> ServiceClient
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.open(stream, None)
    }

    fn open<S>(self, stream: S, peer: Option<std::net::SocketAddr>) -> ServiceClient
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let dispatcher = Arc::new(Dispatcher::new(self.protocols, self.config));
        let connection = Connection::open(stream, peer, &dispatcher);
        ServiceClient {
            connection,
            dispatcher,
        }
    }
}

/// A connection to a [`ServiceServer`](crate::ServiceServer).
///
/// Dropping the client closes the connection.
pub struct ServiceClient {
    connection: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
}

impl ServiceClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Connects over TCP with the default configuration and no hosted
    /// protocols.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::builder().connect(addr).await
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.connection.handle()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    /// Calls `function_id` of `protocol_id` on the server.
    ///
    /// ```no_run
    /// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
    /// use rpcservice::ServiceClient;
    ///
    /// let client = ServiceClient::connect("127.0.0.1:8080").await?;
    /// let sum: i64 = client.call(1, 42, &(2i64, 3i64)).wait().await?;
    /// assert_eq!(sum, 5);
    /// # Ok(())
    /// # }
    /// ```
    pub fn call<T, A>(&self, protocol_id: u64, function_id: u64, args: &A) -> Promise<T>
    where
        A: Args + ?Sized,
    {
        self.connection.call(protocol_id, function_id, args)
    }

    /// Calls with an argument list that is already encoded, e.g. by
    /// [`encode_args`](crate::encode_args).
    pub fn call_packed<T>(&self, protocol_id: u64, function_id: u64, args: Bytes) -> Promise<T> {
        self.connection.call_packed(protocol_id, function_id, args)
    }

    /// Calls and waits for the result, bounded by the configured
    /// `call_timeout` if there is one.
    pub async fn call_wait<T, A>(&self, protocol_id: u64, function_id: u64, args: &A) -> Result<T, CallError>
    where
        T: Decode,
        A: Args + ?Sized,
    {
        let promise = self.call(protocol_id, function_id, args);
        match self.dispatcher.config().call_timeout {
            Some(timeout) => promise.wait_timeout(timeout).await,
            None => promise.wait().await,
        }
    }

    /// Subscribes to a server feed. `callback` runs for every event, in the
    /// order the events arrive.
    pub async fn subscribe<T, F>(
        &self,
        protocol_id: u64,
        feed_id: u64,
        callback: F,
    ) -> Result<SubscriptionHandle, CallError>
    where
        T: Decode + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.connection.subscribe(protocol_id, feed_id, callback).await
    }

    pub fn unsubscribe(&self, subscription: SubscriptionHandle) -> bool {
        self.connection.unsubscribe(subscription)
    }

    /// Closes the connection. Pending calls fail with
    /// [`CallError::ConnectionClosed`].
    pub fn close(&self) {
        self.connection.close();
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        self.connection.closed().await;
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.connection.close();
    }
}
