use super::add_protocol;
use crate::{
    codec::{encode_args, Args, Encode},
    config::ServiceConfig,
    connection::Connection,
    dispatcher::Dispatcher,
    error::CallError,
    feed::FeedKey,
    promise::Promise,
    protocol::{Protocol, RegistryError},
    registry::ConnectionHandle,
};
use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, ToSocketAddrs},
    sync::watch,
    time,
};
use tracing::{debug, info, warn};

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Default)]
pub struct ServerBuilder {
    protocols: HashMap<u64, Protocol>,
    config: ServiceConfig,
}

impl ServerBuilder {
    pub fn add(mut self, protocol_id: u64, protocol: Protocol) -> Result<Self, RegistryError> {
        add_protocol(&mut self.protocols, protocol_id, protocol)?;
        Ok(self)
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Freezes the protocol set and binds every registered publisher.
    pub fn build(self) -> ServiceServer {
        let (shutdown, _) = watch::channel(false);
        ServiceServer {
            inner: Arc::new(Inner {
                dispatcher: Arc::new(Dispatcher::new(self.protocols, self.config)),
                shutdown,
            }),
        }
    }
}

struct Inner {
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
}

/// Hosts protocols for any number of connections.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ServiceServer {
    inner: Arc<Inner>,
}

impl ServiceServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Binds `addr` and serves until [`shutdown`](Self::shutdown).
    pub async fn serve_tcp<A: ToSocketAddrs>(&self, addr: A) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections from `listener` until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut shutdown = self.inner.shutdown.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "serving");
        }
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((sock, addr)) => {
                        if let Err(err) = sock.set_nodelay(true) {
                            debug!(%addr, error = %err, "could not set TCP_NODELAY");
                        }
                        self.open(sock, Some(addr));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        info!("server stopped accepting");
        Ok(())
    }

    /// Serves a single already established stream, e.g. one half of a
    /// `tokio::io::duplex` pair.
    pub fn accept_stream<S>(&self, stream: S) -> ConnectionHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.open(stream, None)
    }

    fn open<S>(&self, stream: S, peer: Option<SocketAddr>) -> ConnectionHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Connection::open(stream, peer, &self.inner.dispatcher);
        info!(connection = %conn.handle(), peer = ?peer, "client connected");
        conn.handle()
    }

    /// Handles of the live connections, ascending.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.inner.dispatcher.connections().active_handles()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.dispatcher.connections().len()
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        self.inner.dispatcher.connections().lookup(handle)
    }

    pub fn protocol_ids(&self) -> Vec<u64> {
        self.inner.dispatcher.protocol_ids()
    }

    /// Calls a function the client behind `handle` hosts.
    pub fn call<T, A>(&self, handle: ConnectionHandle, protocol_id: u64, function_id: u64, args: &A) -> Promise<T>
    where
        A: Args + ?Sized,
    {
        match self.connection(handle) {
            Some(conn) => conn.call(protocol_id, function_id, args),
            None => Promise::failed(CallError::ConnectionClosed),
        }
    }

    /// Calls the same function on every live connection. The arguments are
    /// encoded once.
    pub fn broadcast<T, A>(&self, protocol_id: u64, function_id: u64, args: &A) -> Vec<(ConnectionHandle, Promise<T>)>
    where
        A: Args + ?Sized,
    {
        let packed = encode_args(args);
        let mut promises = Vec::new();
        self.for_each_connection(|handle, conn| {
            promises.push((handle, conn.call_packed(protocol_id, function_id, packed.clone())));
        });
        promises
    }

    pub fn for_each_connection<F>(&self, f: F)
    where
        F: FnMut(ConnectionHandle, &Arc<Connection>),
    {
        self.inner.dispatcher.connections().for_each(f);
    }

    /// Publishes on a feed of a hosted protocol. Same as publishing through
    /// the feed's [`Publisher`](crate::Publisher).
    pub fn publish<T: Encode + ?Sized>(&self, protocol_id: u64, feed_id: u64, value: &T) -> usize {
        self.inner
            .dispatcher
            .feeds()
            .publish(FeedKey::new(protocol_id, feed_id), value)
    }

    pub fn subscriber_count(&self, protocol_id: u64, feed_id: u64) -> usize {
        self.inner
            .dispatcher
            .feeds()
            .subscriber_count(FeedKey::new(protocol_id, feed_id))
    }

    /// Stops accepting, refuses calls still waiting for a handler slot and
    /// closes every connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.dispatcher.shutdown();
        self.for_each_connection(|_, conn| conn.close());
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
