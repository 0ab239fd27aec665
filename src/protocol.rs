//! A protocol is a namespace of callables and feeds, addressed by protocol id.
//!
//! Protocols are assembled before serving starts and never change afterwards,
//! so dispatch reads them without any locking.
//!
//! Member functions of an object are exposed by capturing the object in the
//! closure:
//!
//! ```
//! use rpcservice::Protocol;
//! use std::sync::{Arc, Mutex};
//!
//! #[derive(Default)]
//! struct Counter(Mutex<u64>);
//!
//! impl Counter {
//!     fn bump(&self, by: u64) -> u64 {
//!         let mut n = self.0.lock().unwrap();
//!         *n += by;
//!         *n
//!     }
//! }
//!
//! let counter = Arc::new(Counter::default());
//! let mut protocol = Protocol::new();
//! let c = Arc::clone(&counter);
//! protocol.expose(1, move |by: u64| c.bump(by)).unwrap();
//! ```

use crate::{
    calling::{Async, DynamicCallable, Handler, TypedCallable, WithClient},
    feed::Publisher,
};
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("function {function_id} is already exposed")]
    MemberExists { function_id: u64 },

    #[error("feed {feed_id} is already registered")]
    FeedExists { feed_id: u64 },

    #[error("protocol {protocol_id} is already registered")]
    ProtocolExists { protocol_id: u64 },
}

/// Callables and feeds of one protocol.
#[derive(Default)]
pub struct Protocol {
    members: HashMap<u64, Arc<dyn DynamicCallable>>,
    feeds: HashMap<u64, Publisher>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposes a synchronous function. It runs on the blocking thread pool.
    pub fn expose<H, Args>(&mut self, function_id: u64, handler: H) -> Result<&mut Self, RegistryError>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        self.insert(function_id, Arc::new(TypedCallable::new(handler)))
    }

    /// Exposes a function returning a future. It runs as a task.
    pub fn expose_async<F, Args>(&mut self, function_id: u64, handler: F) -> Result<&mut Self, RegistryError>
    where
        Async<F>: Handler<Args>,
        Args: 'static,
    {
        self.expose(function_id, Async(handler))
    }

    /// Exposes a function that receives the calling connection's handle as
    /// its first argument. The handle never travels on the wire.
    pub fn expose_with_client<F, Args>(
        &mut self,
        function_id: u64,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        WithClient<F>: Handler<Args>,
        Args: 'static,
    {
        self.expose(function_id, WithClient(handler))
    }

    /// Registers a feed clients can subscribe to. Events are published
    /// through `publisher` once the protocol is part of a built server.
    pub fn register_feed(&mut self, feed_id: u64, publisher: &Publisher) -> Result<&mut Self, RegistryError> {
        match self.feeds.entry(feed_id) {
            Entry::Occupied(_) => Err(RegistryError::FeedExists { feed_id }),
            Entry::Vacant(slot) => {
                slot.insert(publisher.clone());
                Ok(self)
            }
        }
    }

    fn insert(&mut self, function_id: u64, callable: Arc<dyn DynamicCallable>) -> Result<&mut Self, RegistryError> {
        match self.members.entry(function_id) {
            Entry::Occupied(_) => Err(RegistryError::MemberExists { function_id }),
            Entry::Vacant(slot) => {
                slot.insert(callable);
                Ok(self)
            }
        }
    }

    pub(crate) fn member(&self, function_id: u64) -> Option<&Arc<dyn DynamicCallable>> {
        self.members.get(&function_id)
    }

    pub(crate) fn has_feed(&self, feed_id: u64) -> bool {
        self.feeds.contains_key(&feed_id)
    }

    pub(crate) fn feeds(&self) -> impl Iterator<Item = (u64, &Publisher)> {
        self.feeds.iter().map(|(id, publisher)| (*id, publisher))
    }

    /// Exposed function ids, ascending.
    pub fn function_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.members.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registered feed ids, ascending.
    pub fn feed_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.feeds.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;

    #[test]
    fn exposing_the_same_id_twice_fails() {
        let mut protocol = Protocol::new();
        protocol.expose(42, |a: i64, b: i64| a + b).unwrap();
        let err = protocol.expose(42, || ()).err().unwrap();
        assert_eq!(err, RegistryError::MemberExists { function_id: 42 });
    }

    #[test]
    fn registrations_chain() {
        let mut protocol = Protocol::new();
        protocol
            .expose(1, || 1u8)
            .and_then(|p| p.expose_async(2, |s: String| async move { s.len() as u64 }))
            .and_then(|p| p.expose_with_client(3, |client: ConnectionHandle| client.as_u64()))
            .unwrap();
        assert_eq!(protocol.function_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn feeds_are_unique_per_protocol() {
        let mut protocol = Protocol::new();
        let publisher = Publisher::new();
        protocol.register_feed(5, &publisher).unwrap();
        let err = protocol.register_feed(5, &Publisher::new()).err().unwrap();
        assert_eq!(err, RegistryError::FeedExists { feed_id: 5 });
        assert!(protocol.has_feed(5));
        assert_eq!(protocol.feed_ids(), vec![5]);
    }
}
