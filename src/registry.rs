//! Registry of live connections.
//!
//! `ConnectionRegistry` stores non-owning weak references, so looking a
//! connection up never keeps it alive past its teardown. Entries whose
//! connection is gone are pruned lazily on lookup and iteration.

use dashmap::DashMap;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// Identifier assigned to a connection when it enters a registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionHandle {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Handle-keyed map of weak connection references.
///
/// Handles increase monotonically and are never reused by the same registry,
/// even after the connection they named has left.
pub struct ConnectionRegistry<C> {
    next_handle: AtomicU64,
    entries: DashMap<ConnectionHandle, Weak<C>>,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a fresh handle, builds the connection with it and registers it.
    pub fn enter<F>(&self, make: F) -> Arc<C>
    where
        F: FnOnce(ConnectionHandle) -> Arc<C>,
    {
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let connection = make(handle);
        self.entries.insert(handle, Arc::downgrade(&connection));
        connection
    }

    /// Removes an entry. Returns whether it was present.
    pub fn leave(&self, handle: ConnectionHandle) -> bool {
        self.entries.remove(&handle).is_some()
    }

    pub fn lookup(&self, handle: ConnectionHandle) -> Option<Arc<C>> {
        let connection = self.entries.get(&handle).and_then(|weak| weak.upgrade());
        if connection.is_none() {
            self.entries.remove_if(&handle, |_, weak| weak.strong_count() == 0);
        }
        connection
    }

    /// Live connections, pruning dead entries on the way.
    pub fn active(&self) -> Vec<(ConnectionHandle, Arc<C>)> {
        let mut live = Vec::with_capacity(self.entries.len());
        self.entries.retain(|handle, weak| match weak.upgrade() {
            Some(connection) => {
                live.push((*handle, connection));
                true
            }
            None => false,
        });
        live
    }

    pub fn active_handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<ConnectionHandle> =
            self.active().into_iter().map(|(handle, _)| handle).collect();
        handles.sort_unstable();
        handles
    }

    /// Calls `f` for every live connection. No map guard is held while `f`
    /// runs, so `f` may enter or leave connections itself.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(ConnectionHandle, &Arc<C>),
    {
        for (handle, connection) in self.active() {
            f(handle, &connection);
        }
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::thread;

    #[fixture]
    fn registry() -> ConnectionRegistry<String> {
        ConnectionRegistry::new()
    }

    #[rstest]
    fn lookup_finds_live_connection(registry: ConnectionRegistry<String>) {
        let conn = registry.enter(|handle| Arc::new(format!("peer {handle}")));
        let handle = registry.active_handles()[0];
        assert_eq!(registry.lookup(handle).as_deref(), Some(&*conn));
    }

    #[rstest]
    fn dropped_connection_is_not_found(registry: ConnectionRegistry<String>) {
        let conn = registry.enter(|_| Arc::new("a".to_owned()));
        let handle = registry.active_handles()[0];
        drop(conn);
        assert!(registry.lookup(handle).is_none());
        assert!(registry.is_empty());
    }

    #[rstest]
    fn handles_are_never_reused(registry: ConnectionRegistry<String>) {
        let mut seen = Vec::new();
        for _ in 0..3 {
            let mut handle = None;
            let conn = registry.enter(|h| {
                handle = Some(h);
                Arc::new(String::new())
            });
            let handle = handle.unwrap();
            assert!(registry.leave(handle));
            assert!(!registry.leave(handle));
            drop(conn);
            seen.push(handle);
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[rstest]
    fn for_each_visits_live_connections_only(registry: ConnectionRegistry<String>) {
        let a = registry.enter(|_| Arc::new("a".to_owned()));
        let b = registry.enter(|_| Arc::new("b".to_owned()));
        drop(b);
        let mut visited = Vec::new();
        registry.for_each(|_, conn| visited.push(conn.as_str().to_owned()));
        assert_eq!(visited, vec!["a".to_owned()]);
        drop(a);
    }

    #[test]
    fn concurrent_enter_yields_distinct_handles() {
        let registry = Arc::new(ConnectionRegistry::<u32>::new());
        let keep: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..50)
                        .map(|n| registry.enter(|_| Arc::new(n)))
                        .collect::<Vec<_>>()
                })
            })
            .flat_map(|t| t.join().unwrap())
            .collect();
        assert_eq!(registry.active_handles().len(), keep.len());
    }
}
