//! Publish/subscribe over the call connection.
//!
//! The serving side keeps, per `(protocol, feed)`, the list of connections
//! subscribed to it and fans published values out to them. The subscribing
//! side allocates a subscription id per SUBSCRIBE and routes incoming EVENTs
//! to the callback registered under that id.

use crate::{
    codec::{encode_to_bytes, DecodeError, Encode},
    connection::{Connection, SendError},
    envelope::Envelope,
    registry::{ConnectionHandle, ConnectionRegistry},
};
use bytes::BytesMut;
use dashmap::DashMap;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock, PoisonError, Weak,
    },
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedKey {
    pub protocol_id: u64,
    pub feed_id: u64,
}

impl FeedKey {
    pub fn new(protocol_id: u64, feed_id: u64) -> Self {
        Self {
            protocol_id,
            feed_id,
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol_id, self.feed_id)
    }
}

/// One subscription as seen by the publishing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscriber {
    pub connection: ConnectionHandle,
    /// Id chosen by the subscribing peer; echoed in every EVENT.
    pub subscription_id: u64,
}

/// Subscriber lists of every feed of a server.
pub struct FeedMultiplexer {
    subscribers: DashMap<FeedKey, Vec<Subscriber>>,
    connections: Arc<ConnectionRegistry<Connection>>,
}

impl FeedMultiplexer {
    pub(crate) fn new(connections: Arc<ConnectionRegistry<Connection>>) -> Self {
        Self {
            subscribers: DashMap::new(),
            connections,
        }
    }

    /// Adds a subscriber. Returns false if it was already subscribed.
    pub fn subscribe(&self, key: FeedKey, subscriber: Subscriber) -> bool {
        let mut list = self.subscribers.entry(key).or_default();
        if list.contains(&subscriber) {
            return false;
        }
        list.push(subscriber);
        true
    }

    pub fn unsubscribe(&self, key: FeedKey, subscriber: Subscriber) -> bool {
        let removed = match self.subscribers.get_mut(&key) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|s| *s != subscriber);
                list.len() != before
            }
            None => false,
        };
        self.subscribers.remove_if(&key, |_, list| list.is_empty());
        removed
    }

    /// Removes every subscription held by `handle`. Returns how many there were.
    pub fn drop_connection(&self, handle: ConnectionHandle) -> usize {
        let mut dropped = 0;
        self.subscribers.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.connection != handle);
            dropped += before - list.len();
            !list.is_empty()
        });
        dropped
    }

    pub fn subscriber_count(&self, key: FeedKey) -> usize {
        self.subscribers.get(&key).map_or(0, |list| list.len())
    }

    /// Sends `value` to every subscriber of `key`. Returns how many
    /// subscribers the event was queued for.
    ///
    /// Never waits: a subscriber whose outbound queue is full misses this
    /// event, and subscribers whose connection is gone are dropped.
    pub fn publish<T: Encode + ?Sized>(&self, key: FeedKey, value: &T) -> usize {
        // Snapshot so no map guard is held while sending.
        let subscribers = match self.subscribers.get(&key) {
            Some(list) => list.value().clone(),
            None => return 0,
        };
        let body = encode_to_bytes(value);
        let mut delivered = 0;
        let mut gone = Vec::new();

        for subscriber in subscribers {
            let Some(conn) = self.connections.lookup(subscriber.connection) else {
                gone.push(subscriber);
                continue;
            };
            let mut payload = BytesMut::with_capacity(9 + body.len());
            subscriber.subscription_id.encode(&mut payload);
            payload.extend_from_slice(&body);
            let frame = Envelope::event(key.protocol_id, key.feed_id, payload.freeze()).to_bytes();

            match conn.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(SendError::Full) => warn!(
                    feed = %key,
                    connection = %subscriber.connection,
                    "outbound queue full, dropping event"
                ),
                Err(SendError::Closed) => gone.push(subscriber),
            }
        }

        if !gone.is_empty() {
            debug!(feed = %key, pruned = gone.len(), "pruning subscribers of closed connections");
            if let Some(mut list) = self.subscribers.get_mut(&key) {
                list.retain(|s| !gone.contains(s));
            }
            self.subscribers.remove_if(&key, |_, list| list.is_empty());
        }
        delivered
    }
}

struct FeedBinding {
    key: FeedKey,
    feeds: Weak<FeedMultiplexer>,
}

/// Handle application code publishes a feed through.
///
/// A publisher is registered on a [`Protocol`](crate::Protocol) and becomes
/// bound to its feed when the server (or client) hosting the protocol is
/// built. Until then publishing reaches nobody.
#[derive(Clone, Default)]
pub struct Publisher {
    binding: Arc<OnceLock<FeedBinding>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.get().is_some()
    }

    /// Publishes `value` to the current subscribers. Returns how many it was
    /// queued for.
    pub fn publish<T: Encode + ?Sized>(&self, value: &T) -> usize {
        match self.multiplexer() {
            Some((key, feeds)) => feeds.publish(key, value),
            None => 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self.multiplexer() {
            Some((key, feeds)) => feeds.subscriber_count(key),
            None => 0,
        }
    }

    fn multiplexer(&self) -> Option<(FeedKey, Arc<FeedMultiplexer>)> {
        let binding = self.binding.get()?;
        Some((binding.key, binding.feeds.upgrade()?))
    }

    /// Binds to a feed. A publisher binds once; later attempts return false.
    pub(crate) fn bind(&self, key: FeedKey, feeds: &Arc<FeedMultiplexer>) -> bool {
        self.binding
            .set(FeedBinding {
                key,
                feeds: Arc::downgrade(feeds),
            })
            .is_ok()
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("feed", &self.binding.get().map(|b| b.key))
            .finish()
    }
}

/// Returned by a successful subscribe; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) key: FeedKey,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn feed(&self) -> FeedKey {
        self.key
    }
}

/// Decodes an event body and hands it to the subscriber's callback.
pub(crate) type EventCallback = Arc<dyn Fn(&[u8]) -> Result<(), DecodeError> + Send + Sync>;

struct ActiveSubscription {
    key: FeedKey,
    callback: EventCallback,
}

pub(crate) enum Route {
    Deliver(EventCallback),
    /// The subscription was cancelled recently; late events are expected.
    Cancelled,
    Unknown,
    FeedMismatch { expected: FeedKey },
}

/// Subscriptions this side holds on the peer.
pub(crate) struct SubscriptionTable {
    next_id: AtomicU64,
    active: DashMap<u64, ActiveSubscription>,
    cancelled: Mutex<VecDeque<u64>>,
    memory: usize,
}

impl SubscriptionTable {
    pub(crate) fn new(memory: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: DashMap::new(),
            cancelled: Mutex::new(VecDeque::with_capacity(memory)),
            memory,
        }
    }

    pub(crate) fn allocate(&self, key: FeedKey, callback: EventCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.insert(id, ActiveSubscription { key, callback });
        id
    }

    /// Ends a subscription and remembers its id for a while, so events
    /// already in flight are dropped quietly.
    pub(crate) fn remove(&self, id: u64) -> Option<FeedKey> {
        let (_, subscription) = self.active.remove(&id)?;
        if self.memory > 0 {
            let mut cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
            if cancelled.len() == self.memory {
                cancelled.pop_front();
            }
            cancelled.push_back(id);
        }
        Some(subscription.key)
    }

    /// Forgets a subscription the peer never accepted.
    pub(crate) fn discard(&self, id: u64) {
        self.active.remove(&id);
    }

    pub(crate) fn route(&self, id: u64, key: FeedKey) -> Route {
        if let Some(subscription) = self.active.get(&id) {
            if subscription.key != key {
                return Route::FeedMismatch {
                    expected: subscription.key,
                };
            }
            return Route::Deliver(Arc::clone(&subscription.callback));
        }
        let cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        if cancelled.contains(&id) {
            Route::Cancelled
        } else {
            Route::Unknown
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn clear(&self) {
        self.active.clear();
    }
}
