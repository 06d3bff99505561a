use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared outcome of one in-flight call. `None` until it settles.
pub type Outcome<T, E> = watch::Receiver<Option<Result<T, E>>>;

/// What a caller gets when it asks to run `key`.
pub enum Claim<T, E> {
    /// Nobody is running `key`; the caller must run it and publish through the guard.
    Lead(PendingGuard<T, E>),
    /// Someone already is; wait on this receiver.
    Join(Outcome<T, E>),
    /// Something is in flight under `key` but with a different result type.
    Bypass,
}

/// In-flight calls by key.
///
/// Values are type-erased so one map serves every `T`/`E` pair; a lookup
/// only coalesces with an entry of the same result type.
#[derive(Clone, Default)]
pub struct Deduplicator {
    pending: Arc<DashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically joins the in-flight call for `key` or registers a new one.
    pub fn claim<T, E>(&self, key: &str) -> Claim<T, E>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(slot) => match slot.get().downcast_ref::<Outcome<T, E>>() {
                Some(outcome) => Claim::Join(outcome.clone()),
                None => Claim::Bypass,
            },
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(Box::new(rx));
                Claim::Lead(PendingGuard {
                    pending: self.pending.clone(),
                    key: key.to_string(),
                    tx,
                    settled: false,
                })
            }
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Leadership of one in-flight key.
///
/// Dropping it without `settle` (the call panicked) still clears the
/// entry; waiters then see a closed channel.
pub struct PendingGuard<T, E> {
    pending: Arc<DashMap<String, Box<dyn Any + Send + Sync>>>,
    key: String,
    tx: watch::Sender<Option<Result<T, E>>>,
    settled: bool,
}

impl<T, E> PendingGuard<T, E> {
    /// Removes the entry, then hands `result` to every joined caller.
    pub fn settle(mut self, result: Result<T, E>) -> Result<T, E>
    where
        T: Clone,
        E: Clone,
    {
        self.pending.remove(&self.key);
        self.settled = true;
        self.tx.send_replace(Some(result.clone()));
        result
    }
}

impl<T, E> Drop for PendingGuard<T, E> {
    fn drop(&mut self) {
        if !self.settled {
            self.pending.remove(&self.key);
        }
    }
}
