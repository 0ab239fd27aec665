//! One framed peer connection and the tasks that drive it.
//!
//! Every connection runs three tasks: a reader that hands each inbound frame
//! to the [`Dispatcher`], a writer that drains the bounded outbound queue
//! into the transport, and an event worker that runs subscription callbacks
//! in arrival order. None of them ever runs a handler inline.

use crate::{
    codec::{decode_from_bytes, encode_args, encode_to_bytes, Args, Decode, DecodeError, WireReader},
    dispatcher::Dispatcher,
    envelope::{Classification, Envelope},
    error::CallError,
    feed::{EventCallback, FeedKey, Route, SubscriptionHandle, SubscriptionTable},
    promise::{Promise, PromiseTable},
    registry::ConnectionHandle,
};
use async_bincode::tokio::{AsyncBincodeReader, AsyncBincodeWriter};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::{
    fmt,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{self, AsyncRead, AsyncWrite},
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time,
};
use tracing::{debug, error, trace, warn};

/// How long a closing writer keeps flushing frames that were already queued.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,

    #[error("connection is closed")]
    Closed,
}

impl From<SendError> for CallError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Full => CallError::CouldNotDeliver,
            SendError::Closed => CallError::ConnectionClosed,
        }
    }
}

pub struct Connection {
    handle: ConnectionHandle,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Bytes>,
    events: mpsc::Sender<Envelope>,
    promises: Arc<PromiseTable>,
    subscriptions: SubscriptionTable,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Registers the connection with the dispatcher's registry and starts
    /// its tasks. Must be called inside a Tokio runtime.
    pub(crate) fn open<S>(stream: S, peer: Option<SocketAddr>, dispatcher: &Arc<Dispatcher>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = dispatcher.config();
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity());
        let (events, events_rx) = mpsc::channel(config.event_capacity());
        let (closed, _) = watch::channel(false);
        let subscriptions = SubscriptionTable::new(config.cancelled_subscription_memory);

        let conn = dispatcher.connections().enter(|handle| {
            Arc::new(Self {
                handle,
                peer,
                outbound,
                events,
                promises: Arc::new(PromiseTable::new()),
                subscriptions,
                closed,
            })
        });
        debug!(connection = %conn.handle, peer = ?peer, "connection opened");

        let (reader, writer) = io::split(stream);
        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            conn.closed.subscribe(),
            Arc::downgrade(&conn),
        ));
        tokio::spawn(event_loop(
            events_rx,
            conn.closed.subscribe(),
            Arc::downgrade(&conn),
        ));
        tokio::spawn(read_loop(reader, Arc::clone(&conn), Arc::clone(dispatcher)));
        conn
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Starts a graceful close. Pending calls fail with
    /// [`CallError::ConnectionClosed`]; frames already queued are still
    /// flushed.
    pub fn close(&self) {
        let first = self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
        if first {
            debug!(connection = %self.handle, "closing connection");
            self.promises.close(CallError::ConnectionClosed);
        }
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        closed_signal(&mut rx).await;
    }

    /// Calls `function_id` of `protocol_id` on the peer.
    ///
    /// Never blocks: if the outbound queue is full the promise fails with
    /// [`CallError::CouldNotDeliver`].
    pub fn call<T, A>(&self, protocol_id: u64, function_id: u64, args: &A) -> Promise<T>
    where
        A: Args + ?Sized,
    {
        self.call_packed(protocol_id, function_id, encode_args(args))
    }

    /// Like [`call`](Self::call) with an argument list that is already
    /// encoded.
    pub fn call_packed<T>(&self, protocol_id: u64, function_id: u64, args: Bytes) -> Promise<T> {
        let promise = PromiseTable::issue(&self.promises);
        if promise.is_ready() {
            return promise;
        }
        let frame = Envelope::call(promise.id(), protocol_id, function_id, args).to_bytes();
        if let Err(err) = self.try_send(frame) {
            debug!(
                connection = %self.handle,
                protocol_id,
                function_id,
                correlation_id = promise.id(),
                error = %err,
                "call not sent"
            );
            // Cannot be missing: nothing else resolves an id before it is sent.
            let _ = self.promises.fail(promise.id(), err.into());
        }
        promise
    }

    /// Subscribes to a feed of the peer. `callback` runs on this
    /// connection's event worker for every event, in arrival order.
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
        let key = FeedKey::new(protocol_id, feed_id);
        let callback: EventCallback = Arc::new(move |body: &[u8]| -> Result<(), DecodeError> {
            callback(decode_from_bytes(body)?);
            Ok(())
        });
        let id = self.subscriptions.allocate(key, callback);

        let ack: Promise<()> = PromiseTable::issue(&self.promises);
        let frame = Envelope::new(
            Classification::Subscribe,
            ack.id(),
            protocol_id,
            feed_id,
            encode_to_bytes(&id),
        )
        .to_bytes();
        if let Err(err) = self.try_send(frame) {
            self.subscriptions.discard(id);
            return Err(err.into());
        }
        match ack.wait().await {
            Ok(()) => {
                debug!(connection = %self.handle, feed = %key, subscription_id = id, "subscribed");
                Ok(SubscriptionHandle { id, key })
            }
            Err(err) => {
                self.subscriptions.discard(id);
                Err(err)
            }
        }
    }

    /// Ends a subscription. Returns false if it was not active. No reply is
    /// expected; events already in flight are ignored.
    pub fn unsubscribe(&self, subscription: SubscriptionHandle) -> bool {
        let Some(key) = self.subscriptions.remove(subscription.id) else {
            return false;
        };
        let frame = Envelope::new(
            Classification::Unsubscribe,
            0,
            key.protocol_id,
            key.feed_id,
            encode_to_bytes(&subscription.id),
        )
        .to_bytes();
        if let Err(err) = self.try_send(frame) {
            debug!(connection = %self.handle, feed = %key, error = %err, "unsubscribe not sent");
        }
        true
    }

    /// Queues a frame without waiting.
    pub fn try_send(&self, frame: Bytes) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Queues a frame, waiting for room in the outbound queue.
    pub(crate) async fn send(&self, frame: Bytes) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        self.outbound.send(frame).await.map_err(|_| SendError::Closed)
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.promises.len()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn promises(&self) -> &PromiseTable {
        &self.promises
    }

    /// Hands an EVENT to the event worker.
    pub(crate) fn deliver_event(&self, envelope: Envelope) {
        match self.events.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => warn!(
                connection = %self.handle,
                protocol_id = envelope.protocol_id,
                feed_id = envelope.member_id,
                "event queue full, dropping event"
            ),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn route_event(&self, envelope: Envelope) {
        let key = FeedKey::new(envelope.protocol_id, envelope.member_id);
        let mut reader = WireReader::new(&envelope.payload);
        let subscription_id = match u64::decode(&mut reader) {
            Ok(id) => id,
            Err(err) => {
                warn!(connection = %self.handle, feed = %key, error = %err, "malformed event");
                return;
            }
        };
        let body = &envelope.payload[reader.position()..];

        match self.subscriptions.route(subscription_id, key) {
            Route::Deliver(callback) => match panic::catch_unwind(AssertUnwindSafe(|| callback(body))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    connection = %self.handle,
                    feed = %key,
                    subscription_id,
                    error = %err,
                    "failed to decode event"
                ),
                Err(_) => error!(
                    connection = %self.handle,
                    feed = %key,
                    subscription_id,
                    "event callback panicked"
                ),
            },
            Route::Cancelled => trace!(subscription_id, "event for cancelled subscription"),
            Route::Unknown => warn!(
                connection = %self.handle,
                feed = %key,
                subscription_id,
                "event for unknown subscription"
            ),
            Route::FeedMismatch { expected } => warn!(
                connection = %self.handle,
                feed = %key,
                expected = %expected,
                subscription_id,
                "event arrived on the wrong feed"
            ),
        }
    }

    fn teardown(&self) {
        let failed = self.promises.close(CallError::ConnectionClosed);
        self.subscriptions.clear();
        debug!(connection = %self.handle, failed_calls = failed, "connection torn down");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}

async fn closed_signal(rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the connection itself is gone.
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Closes and unregisters a connection when its read loop ends, however it
/// ends.
struct Teardown {
    conn: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.conn.close();
        self.conn.teardown();
        self.dispatcher.on_disconnect(&self.conn);
    }
}

async fn read_loop<R>(reader: R, conn: Arc<Connection>, dispatcher: Arc<Dispatcher>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = AsyncBincodeReader::<_, Vec<u8>>::from(reader);
    let mut closed = conn.closed.subscribe();
    let guard = Teardown { conn, dispatcher };
    let conn = &guard.conn;
    loop {
        tokio::select! {
            _ = closed_signal(&mut closed) => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => guard.dispatcher.dispatch(conn, Bytes::from(frame)),
                Some(Err(err)) => {
                    warn!(connection = %conn.handle, error = %err, "framing error, closing connection");
                    break;
                }
                None => {
                    debug!(connection = %conn.handle, "peer closed the connection");
                    break;
                }
            },
        }
    }
}

async fn write_loop<W>(
    writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    mut closed: watch::Receiver<bool>,
    conn: Weak<Connection>,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = AsyncBincodeWriter::<_, Vec<u8>, _>::from(writer).for_async();
    let failed = loop {
        let frame = tokio::select! {
            biased;
            _ = closed_signal(&mut closed) => break false,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break false,
            },
        };
        // A stalled peer must not keep a closed connection's writer alive.
        tokio::select! {
            biased;
            sent = sink.send(frame.to_vec()) => {
                if let Err(err) = sent {
                    warn!(error = %err, "write failed, closing connection");
                    break true;
                }
            }
            _ = closed_signal(&mut closed) => break false,
        }
    };

    if failed {
        if let Some(conn) = conn.upgrade() {
            conn.close();
        }
        return;
    }

    let drain = async {
        while let Ok(frame) = outbound.try_recv() {
            sink.feed(frame.to_vec()).await?;
        }
        sink.close().await
    };
    match time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "flush on close failed"),
        Err(_) => debug!("peer stalled, dropping unflushed frames"),
    }
}

async fn event_loop(
    mut events: mpsc::Receiver<Envelope>,
    mut closed: watch::Receiver<bool>,
    conn: Weak<Connection>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = closed_signal(&mut closed) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(conn) = conn.upgrade() else {
            break;
        };
        conn.route_event(event);
    }
}
