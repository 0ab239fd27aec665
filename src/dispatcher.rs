use crate::{
    calling::{CallContext, Job},
    codec::{decode_from_bytes, encode_to_bytes, DecodeError, WireReader},
    config::ServiceConfig,
    connection::Connection,
    envelope::{Classification, Envelope, EnvelopeError},
    error::{CallError, ErrorCode, RemoteError},
    feed::{FeedKey, FeedMultiplexer, Subscriber},
    protocol::Protocol,
    registry::ConnectionRegistry,
};
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Why an inbound request could not be served.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("protocol {0} not found")]
    ProtocolNotFound(u64),

    #[error("no member {function_id} in protocol {protocol_id}")]
    MemberNotFound { protocol_id: u64, function_id: u64 },

    #[error("no feed {feed_id} in protocol {protocol_id}")]
    FeedNotFound { protocol_id: u64, feed_id: u64 },

    #[error("failed to decode arguments: {0}")]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    UnknownMessage(#[from] EnvelopeError),

    #[error("{0}")]
    Handler(RemoteError),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::ProtocolNotFound(_) => ErrorCode::ProtocolNotFound,
            DispatchError::MemberNotFound { .. } => ErrorCode::MemberNotFound,
            DispatchError::FeedNotFound { .. } => ErrorCode::FeedNotFound,
            DispatchError::Decode(DecodeError::TypeMismatch(_)) => ErrorCode::TypeMismatch,
            DispatchError::Decode(DecodeError::BufferUnderrun { .. }) => ErrorCode::BufferUnderrun,
            DispatchError::Decode(_) => ErrorCode::MalformedPayload,
            DispatchError::UnknownMessage(_) => ErrorCode::UnknownMessage,
            DispatchError::Handler(err) => err.code,
        }
    }

    /// The descriptor sent back to the caller.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            DispatchError::Handler(err) => err.clone(),
            other => RemoteError::new(other.code(), other.to_string()),
        }
    }
}

/// Routes inbound envelopes of every connection of one server or client.
///
/// Protocols are fixed at construction, so lookups need no locking.
pub(crate) struct Dispatcher {
    protocols: HashMap<u64, Protocol>,
    feeds: Arc<FeedMultiplexer>,
    connections: Arc<ConnectionRegistry<Connection>>,
    limiter: Arc<Semaphore>,
    config: ServiceConfig,
}

impl Dispatcher {
    /// Takes ownership of the protocols and binds their publishers.
    pub(crate) fn new(protocols: HashMap<u64, Protocol>, config: ServiceConfig) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let feeds = Arc::new(FeedMultiplexer::new(Arc::clone(&connections)));
        for (&protocol_id, protocol) in &protocols {
            for (feed_id, publisher) in protocol.feeds() {
                let key = FeedKey::new(protocol_id, feed_id);
                if !publisher.bind(key, &feeds) {
                    warn!(feed = %key, "publisher is already bound to another feed");
                }
            }
        }
        Self {
            protocols,
            feeds,
            connections,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_calls())),
            config,
        }
    }

    pub(crate) fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub(crate) fn connections(&self) -> &Arc<ConnectionRegistry<Connection>> {
        &self.connections
    }

    pub(crate) fn feeds(&self) -> &Arc<FeedMultiplexer> {
        &self.feeds
    }

    /// Refuses calls that are still waiting for a handler slot. Handlers
    /// already running finish normally.
    pub(crate) fn shutdown(&self) {
        self.limiter.close();
    }

    pub(crate) fn protocol_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.protocols.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Handles one inbound frame. Never waits: anything that might is
    /// spawned.
    pub(crate) fn dispatch(&self, conn: &Arc<Connection>, frame: Bytes) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                let correlation_id = err.correlation_id().unwrap_or(0);
                warn!(connection = %conn.handle(), correlation_id, error = %err, "rejecting message");
                let reply = DispatchError::from(err).to_remote();
                send_reply(
                    conn,
                    Envelope::new(Classification::Error, correlation_id, 0, 0, encode_to_bytes(&reply)),
                );
                return;
            }
        };

        match envelope.classification {
            Classification::FunctionCall => self.invoke(conn, envelope),
            Classification::Result => {
                if let Err(err) = conn.promises().fulfill(envelope.correlation_id, envelope.payload) {
                    warn!(connection = %conn.handle(), error = %err, "dropping unmatched result");
                }
            }
            Classification::Error => {
                let error = match decode_from_bytes::<RemoteError>(&envelope.payload) {
                    Ok(remote) => CallError::Remote(remote),
                    Err(err) => CallError::Decode(err),
                };
                if let Err(err) = conn.promises().fail(envelope.correlation_id, error) {
                    warn!(connection = %conn.handle(), error = %err, "dropping unmatched error");
                }
            }
            Classification::Subscribe => self.subscribe(conn, envelope),
            Classification::Unsubscribe => self.unsubscribe(conn, envelope),
            Classification::Event => conn.deliver_event(envelope),
        }
    }

    fn bind(&self, ctx: &CallContext, args: &[u8]) -> Result<Job, DispatchError> {
        let protocol = self
            .protocols
            .get(&ctx.protocol_id)
            .ok_or(DispatchError::ProtocolNotFound(ctx.protocol_id))?;
        let callable = protocol
            .member(ctx.function_id)
            .ok_or(DispatchError::MemberNotFound {
                protocol_id: ctx.protocol_id,
                function_id: ctx.function_id,
            })?;
        Ok(callable.bind(ctx, &mut WireReader::new(args))?)
    }

    fn invoke(&self, conn: &Arc<Connection>, envelope: Envelope) {
        let ctx = CallContext {
            connection: conn.handle(),
            protocol_id: envelope.protocol_id,
            function_id: envelope.member_id,
            correlation_id: envelope.correlation_id,
        };
        let job = self.bind(&ctx, &envelope.payload);
        let limiter = Arc::clone(&self.limiter);
        let conn = Arc::clone(conn);

        tokio::spawn(async move {
            let reply = match job {
                Ok(job) => match limiter.acquire().await {
                    Ok(_permit) => job.run().await.map_err(DispatchError::Handler),
                    Err(_) => Err(DispatchError::Handler(RemoteError::new(
                        ErrorCode::Handler,
                        "dispatcher is shutting down",
                    ))),
                },
                Err(err) => Err(err),
            };

            // Correlation id zero asks for no reply.
            if ctx.correlation_id == 0 {
                if let Err(err) = reply {
                    debug!(protocol_id = ctx.protocol_id, function_id = ctx.function_id, error = %err, "one-way call failed");
                }
                return;
            }

            let envelope = match reply {
                Ok(result) => Envelope::new(
                    Classification::Result,
                    ctx.correlation_id,
                    ctx.protocol_id,
                    ctx.function_id,
                    result,
                ),
                Err(err) => {
                    debug!(
                        connection = %ctx.connection,
                        protocol_id = ctx.protocol_id,
                        function_id = ctx.function_id,
                        correlation_id = ctx.correlation_id,
                        error = %err,
                        "call failed"
                    );
                    Envelope::new(
                        Classification::Error,
                        ctx.correlation_id,
                        ctx.protocol_id,
                        ctx.function_id,
                        encode_to_bytes(&err.to_remote()),
                    )
                }
            };
            if conn.send(envelope.to_bytes()).await.is_err() {
                debug!(connection = %ctx.connection, correlation_id = ctx.correlation_id, "connection closed before reply");
            }
        });
    }

    fn check_feed(&self, key: FeedKey) -> Result<(), DispatchError> {
        let protocol = self
            .protocols
            .get(&key.protocol_id)
            .ok_or(DispatchError::ProtocolNotFound(key.protocol_id))?;
        if !protocol.has_feed(key.feed_id) {
            return Err(DispatchError::FeedNotFound {
                protocol_id: key.protocol_id,
                feed_id: key.feed_id,
            });
        }
        Ok(())
    }

    fn subscribe(&self, conn: &Arc<Connection>, envelope: Envelope) {
        let key = FeedKey::new(envelope.protocol_id, envelope.member_id);
        let accepted = self.check_feed(key).and_then(|()| {
            let subscription_id = decode_from_bytes::<u64>(&envelope.payload)?;
            let subscriber = Subscriber {
                connection: conn.handle(),
                subscription_id,
            };
            if self.feeds.subscribe(key, subscriber) {
                debug!(connection = %conn.handle(), feed = %key, subscription_id, "subscriber added");
            }
            Ok(())
        });
        let reply = match accepted {
            Ok(()) => Envelope::new(
                Classification::Result,
                envelope.correlation_id,
                key.protocol_id,
                key.feed_id,
                encode_to_bytes(&()),
            ),
            Err(err) => {
                debug!(connection = %conn.handle(), feed = %key, error = %err, "subscribe rejected");
                Envelope::new(
                    Classification::Error,
                    envelope.correlation_id,
                    key.protocol_id,
                    key.feed_id,
                    encode_to_bytes(&err.to_remote()),
                )
            }
        };
        send_reply(conn, reply);
    }

    fn unsubscribe(&self, conn: &Arc<Connection>, envelope: Envelope) {
        let key = FeedKey::new(envelope.protocol_id, envelope.member_id);
        match decode_from_bytes::<u64>(&envelope.payload) {
            Ok(subscription_id) => {
                let subscriber = Subscriber {
                    connection: conn.handle(),
                    subscription_id,
                };
                if !self.feeds.unsubscribe(key, subscriber) {
                    debug!(connection = %conn.handle(), feed = %key, subscription_id, "unsubscribe for unknown subscription");
                }
            }
            Err(err) => warn!(connection = %conn.handle(), feed = %key, error = %err, "malformed unsubscribe"),
        }
    }

    pub(crate) fn on_disconnect(&self, conn: &Connection) {
        self.connections.leave(conn.handle());
        let dropped = self.feeds.drop_connection(conn.handle());
        info!(connection = %conn.handle(), subscriptions = dropped, "connection closed");
    }
}

/// Sends a reply from the read loop without waiting on the outbound queue.
fn send_reply(conn: &Arc<Connection>, envelope: Envelope) {
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        if conn.send(envelope.to_bytes()).await.is_err() {
            debug!(connection = %conn.handle(), "connection closed before reply");
        }
    });
}
