//! Outstanding calls, keyed by correlation id.
//!
//! Every call issued on a connection gets a fresh id from the connection's
//! [`PromiseTable`]. The RESULT or ERROR that echoes the id resolves the
//! matching [`Promise`], in whatever order the replies arrive.

use crate::{
    codec::{decode_from_bytes, Decode},
    error::CallError,
};
use bytes::Bytes;
use dashmap::DashMap;
use std::{
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, time};

/// Final state of a call: the encoded result, or why there is none.
pub type Outcome = Result<Bytes, CallError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    #[error("no outstanding call with correlation id {0}")]
    NotFound(u64),
}

pub(crate) struct PendingCall {
    id: u64,
    state: watch::Sender<Option<Outcome>>,
}

impl PendingCall {
    fn new(id: u64) -> Self {
        let (state, _) = watch::channel(None);
        Self { id, state }
    }

    /// Records the outcome unless one is already there. Returns whether this
    /// call won.
    fn settle(&self, outcome: Outcome) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
            true
        })
    }

    fn outcome(&self) -> Option<Outcome> {
        self.state.borrow().clone()
    }

    async fn wait(&self) -> Outcome {
        let mut rx = self.state.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(state) => (*state).clone().unwrap_or(Err(CallError::ConnectionClosed)),
            Err(_) => Err(CallError::ConnectionClosed),
        };
        outcome
    }
}

/// Pending calls of one connection.
pub struct PromiseTable {
    next_id: AtomicU64,
    pending: DashMap<u64, Arc<PendingCall>>,
    closed: AtomicBool,
}

impl Default for PromiseTable {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }
}

impl PromiseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending call. On a closed table the promise comes
    /// back already failed with [`CallError::ConnectionClosed`].
    pub fn issue<T>(table: &Arc<Self>) -> Promise<T> {
        let id = table.next_id.fetch_add(1, Ordering::Relaxed);
        let call = Arc::new(PendingCall::new(id));
        table.pending.insert(id, Arc::clone(&call));
        if table.closed.load(Ordering::SeqCst) {
            if let Some((_, call)) = table.pending.remove(&id) {
                call.settle(Err(CallError::ConnectionClosed));
            }
        }
        Promise {
            call,
            table: Arc::downgrade(table),
            _result: PhantomData,
        }
    }

    pub fn fulfill(&self, id: u64, payload: Bytes) -> Result<(), PromiseError> {
        self.resolve(id, Ok(payload))
    }

    pub fn fail(&self, id: u64, error: CallError) -> Result<(), PromiseError> {
        self.resolve(id, Err(error))
    }

    pub fn cancel(&self, id: u64) -> Result<(), PromiseError> {
        self.resolve(id, Err(CallError::Cancelled))
    }

    fn resolve(&self, id: u64, outcome: Outcome) -> Result<(), PromiseError> {
        let (_, call) = self.pending.remove(&id).ok_or(PromiseError::NotFound(id))?;
        call.settle(outcome);
        Ok(())
    }

    /// Fails every pending call with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: CallError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                call.settle(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Fails everything pending and refuses new calls from now on.
    pub fn close(&self, error: CallError) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_all(error)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn forget(&self, id: u64) {
        self.pending.remove(&id);
    }
}

/// Result of a remote call that may not have arrived yet.
///
/// Dropping an unresolved promise cancels it locally; a reply that arrives
/// afterwards is discarded.
pub struct Promise<T> {
    call: Arc<PendingCall>,
    table: Weak<PromiseTable>,
    _result: PhantomData<fn() -> T>,
}

impl<T> Promise<T> {
    /// A promise that has already failed, for calls that never left.
    pub fn failed(error: CallError) -> Self {
        let call = Arc::new(PendingCall::new(0));
        call.settle(Err(error));
        Self {
            call,
            table: Weak::new(),
            _result: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.call.id
    }

    pub fn is_ready(&self) -> bool {
        self.call.state.borrow().is_some()
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(*self.call.state.borrow(), Some(Ok(_)))
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.call.state.borrow(), Some(Err(_)))
    }

    /// Settles the call locally with `error` and drops it from the table.
    fn abandon(&self, error: CallError) {
        if let Some(table) = self.table.upgrade() {
            table.forget(self.call.id);
        }
        self.call.settle(Err(error));
    }

    /// Cancels the call. Any reply that arrives later is dropped.
    pub fn cancel(self) {
        self.abandon(CallError::Cancelled);
    }
}

impl<T: Decode> Promise<T> {
    pub async fn wait(self) -> Result<T, CallError> {
        let payload = self.call.wait().await?;
        Ok(decode_from_bytes(&payload)?)
    }

    /// Waits at most `timeout`. On expiry the call is failed locally with
    /// [`CallError::Timeout`] unless a reply won the race.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<T, CallError> {
        let outcome = match time::timeout(timeout, self.call.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.abandon(CallError::Timeout);
                self.call.outcome().unwrap_or(Err(CallError::Timeout))
            }
        };
        Ok(decode_from_bytes(&outcome?)?)
    }

    /// Non-blocking check. `None` while the call is still pending.
    pub fn try_take(&self) -> Option<Result<T, CallError>> {
        let outcome = self.call.outcome()?;
        Some(outcome.and_then(|payload| Ok(decode_from_bytes(&payload)?)))
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.is_ready() {
            self.abandon(CallError::Cancelled);
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.call.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}
