//! Request coalescing.
//!
//! A [`Group`] runs at most one call per key at a time. The first caller for
//! a key (the leader) drives the work; callers arriving while it runs wait
//! for the leader's result instead of starting their own. If the leader's
//! future is dropped before finishing, every waiter gets
//! [`FsError::Cancelled`]. A waiter that stops waiting affects nobody else.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use super::error::{FsError, FsResult};

type Slot<T> = watch::Receiver<Option<FsResult<T>>>;

enum Call<T> {
    InFlight { id: u64, rx: Slot<T> },
    /// Successful result kept until forgotten.
    Done(T),
}

/// What a caller found under its key, decided under the lock.
enum Entry<T> {
    Remembered(T),
    Follow(Slot<T>),
    Lead(u64, watch::Sender<Option<FsResult<T>>>),
}

/// Coalescing gate keyed by string.
pub struct Group<T> {
    calls: Mutex<HashMap<String, Call<T>>>,
    remember: Option<fn(&T) -> bool>,
    next_id: AtomicU64,
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            remember: None,
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + Sync> Group<T> {
    /// Gate that forgets every result once its call completes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate that keeps successful results accepted by `keep` until
    /// [`Group::forget`] is called for the key.
    pub fn remembering(keep: fn(&T) -> bool) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            remember: Some(keep),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `f` unless a call for `key` is already in flight (or remembered),
    /// in which case its result is shared.
    pub async fn work<F, Fut>(&self, key: &str, f: F) -> FsResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FsResult<T>>,
    {
        let entry = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(Call::Done(value)) => Entry::Remembered(value.clone()),
                Some(Call::InFlight { rx, .. }) => Entry::Follow(rx.clone()),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), Call::InFlight { id, rx });
                    Entry::Lead(id, tx)
                }
            }
        };

        let (id, tx) = match entry {
            Entry::Remembered(value) => {
                trace!(key, "singleflight remembered");
                return Ok(value);
            }
            Entry::Follow(rx) => {
                trace!(key, "singleflight shared");
                return wait(rx).await;
            }
            Entry::Lead(id, tx) => (id, tx),
        };

        let guard = Leader {
            group: self,
            key,
            id,
            tx: Some(tx),
        };
        let result = f().await;
        guard.finish(result.clone());
        result
    }

    /// Drop whatever is stored for `key`.
    pub fn forget(&self, key: &str) {
        self.calls.lock().remove(key);
    }

    /// Drop the remembered result for `key` if `pred` accepts it.
    pub fn forget_if(&self, key: &str, pred: impl FnOnce(&T) -> bool) {
        let mut calls = self.calls.lock();
        if let Some(Call::Done(value)) = calls.get(key) {
            if pred(value) {
                calls.remove(key);
            }
        }
    }

    /// Drop every remembered result whose key `pred` accepts. Calls in
    /// flight are left alone.
    pub fn forget_matching(&self, pred: impl Fn(&str) -> bool) {
        self.calls
            .lock()
            .retain(|key, call| !(matches!(call, Call::Done(_)) && pred(key)));
    }

    /// Number of keys in flight or remembered.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

async fn wait<T: Clone>(mut rx: Slot<T>) -> FsResult<T> {
    match rx.wait_for(Option::is_some).await {
        Ok(value) => value.clone().unwrap_or(Err(FsError::Cancelled)),
        Err(_) => Err(FsError::Cancelled),
    }
}

/// Publishes the leader's outcome; dropping it unfinished cancels waiters.
struct Leader<'a, T: Clone + Send + Sync> {
    group: &'a Group<T>,
    key: &'a str,
    id: u64,
    tx: Option<watch::Sender<Option<FsResult<T>>>>,
}

impl<T: Clone + Send + Sync> Leader<'_, T> {
    /// Whether the map still holds this leader's call (not a forgotten or
    /// newer one).
    fn is_current(&self, calls: &HashMap<String, Call<T>>) -> bool {
        matches!(calls.get(self.key), Some(Call::InFlight { id, .. }) if *id == self.id)
    }

    fn finish(mut self, result: FsResult<T>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        {
            let mut calls = self.group.calls.lock();
            let ours = self.is_current(&calls);
            if ours {
                let keep = match (&result, self.group.remember) {
                    (Ok(value), Some(keep)) => keep(value),
                    _ => false,
                };
                match (&result, keep) {
                    (Ok(value), true) => {
                        calls.insert(self.key.to_string(), Call::Done(value.clone()));
                    }
                    _ => {
                        calls.remove(self.key);
                    }
                }
            }
        }
        tx.send_replace(Some(result));
    }
}

impl<T: Clone + Send + Sync> Drop for Leader<'_, T> {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        {
            let mut calls = self.group.calls.lock();
            let ours = self.is_current(&calls);
            if ours {
                calls.remove(self.key);
            }
        }
        trace!(key = self.key, "singleflight leader dropped");
        tx.send_replace(Some(Err(FsError::Cancelled)));
    }
}
