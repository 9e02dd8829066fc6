//! In-flight request collapsing.
//!
//! # Responsibilities
//! - Derive a canonical key from a URL and its parameters
//! - Hand every concurrent caller of a key the same shared outcome
//! - Forget the key as soon as the outcome settles
//!
//! # Design Decisions
//! - The pending entry is inserted before the operation is started
//! - Operations are spawned, so they finish even if every caller goes away
//! - Removal happens in a drop guard inside the task, before waiters are woken
//! - A task cancelled by runtime shutdown settles every waiter with `RequestCancelled`

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use thiserror::Error;

use super::CallError;
use crate::observability::metrics;

/// Awaitable outcome shared by every caller of a deduplication key.
pub type SharedOutcome<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Canonical key for a request: `"{url}::{params}"`, with absent params as "".
///
/// Object keys are serialized in sorted order, so equal parameter sets
/// always produce the same key.
pub fn request_key(url: &str, params: Option<&Value>) -> String {
    let params = params.map(|p| p.to_string()).unwrap_or_default();
    format!("{}::{}", url, params)
}

/// The shared operation ended without producing an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deduplicated request was cancelled before completing")]
pub struct RequestCancelled;

impl<E> From<RequestCancelled> for CallError<E> {
    fn from(_: RequestCancelled) -> Self {
        CallError::Cancelled
    }
}

struct PendingEntry<T, E> {
    generation: u64,
    outcome: SharedOutcome<T, E>,
}

type PendingMap<T, E> = DashMap<String, PendingEntry<T, E>>;

/// Removes its pending entry when the operation's task ends, however it ends.
struct PendingGuard<T, E> {
    pending: Arc<PendingMap<T, E>>,
    key: String,
    generation: u64,
}

impl<T, E> Drop for PendingGuard<T, E> {
    fn drop(&mut self) {
        // A cleared-then-reissued key belongs to a newer operation.
        self.pending
            .remove_if(&self.key, |_, entry| entry.generation == self.generation);
    }
}

/// Collapses concurrent identical operations into a single execution.
pub struct RequestDeduplicator<T, E> {
    pending: Arc<PendingMap<T, E>>,
    next_generation: AtomicU64,
}

impl<T, E> Default for RequestDeduplicator<T, E> {
    fn default() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<T, E> RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<RequestCancelled> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight operation for this request, or start one with `f`.
    ///
    /// `f` is invoked at most once per settled outcome and is called while the
    /// key is reserved, so it must not re-enter this deduplicator synchronously.
    /// Must be called from within a tokio runtime.
    pub fn deduplicate<F, Fut>(&self, url: &str, params: Option<&Value>, f: F) -> SharedOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = request_key(url, params);

        match self.pending.entry(key.clone()) {
            Entry::Occupied(existing) => {
                tracing::debug!(key = %key, "Joining in-flight request");
                metrics::record_dedup("shared");
                existing.get().outcome.clone()
            }
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let guard = PendingGuard {
                    pending: self.pending.clone(),
                    key,
                    generation,
                };

                let operation = f();
                let task = tokio::spawn(async move {
                    let _guard = guard;
                    operation.await
                });

                let outcome = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(_) => {
                            tracing::warn!("Deduplicated request was cancelled");
                            Err(RequestCancelled.into())
                        }
                    }
                }
                .boxed()
                .shared();

                metrics::record_dedup("started");
                slot.insert(PendingEntry {
                    generation,
                    outcome: outcome.clone(),
                });
                outcome
            }
        }
    }

    /// Wrap `f` so that every call goes through this deduplicator.
    pub fn with_deduplication<F, Fut>(self: &Arc<Self>, f: F) -> impl Fn(&str, Option<&Value>) -> SharedOutcome<T, E>
    where
        F: Fn(&str, Option<&Value>) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let dedup = Arc::clone(self);
        move |url: &str, params: Option<&Value>| dedup.deduplicate(url, params, || f(url, params))
    }

    /// Forget the pending entry for a request. The operation itself keeps running.
    pub fn clear(&self, url: &str, params: Option<&Value>) {
        self.pending.remove(&request_key(url, params));
    }

    /// Forget every pending entry.
    pub fn clear_all(&self) {
        self.pending.clear();
    }

    pub fn is_pending(&self, url: &str, params: Option<&Value>) -> bool {
        self.pending.contains_key(&request_key(url, params))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    type Dedup = RequestDeduplicator<String, CallError<String>>;

    #[test]
    fn test_request_key() {
        assert_eq!(request_key("/x", None), "/x::");
        assert_eq!(
            request_key("/x", Some(&json!({"b": 1, "a": [1, 2]}))),
            "/x::{\"a\":[1,2],\"b\":1}"
        );
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_invocation() {
        let dedup = Dedup::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();

        let c = calls.clone();
        let first = dedup.deduplicate("/x", None, move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = rx.await;
            Ok("payload".to_string())
        });
        let c = calls.clone();
        let second = dedup.deduplicate("/x", None, move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok("other".to_string())
        });

        assert!(dedup.is_pending("/x", None));
        assert_eq!(dedup.pending_count(), 1);

        tx.send(()).unwrap();
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a, Ok("payload".to_string()));
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Settled entries are gone before any waiter observes the outcome.
        assert!(!dedup.is_pending("/x", None));

        let c = calls.clone();
        let third = dedup
            .deduplicate("/x", None, move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok("fresh".to_string())
            })
            .await;
        assert_eq!(third, Ok("fresh".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_cleared() {
        let dedup = Dedup::new();
        let (tx, rx) = oneshot::channel::<()>();

        let first = dedup.deduplicate("/x", Some(&json!({"id": 7})), move || async move {
            let _ = rx.await;
            Err(CallError::Transport("502 Bad Gateway".to_string()))
        });
        let second = dedup.deduplicate("/x", Some(&json!({"id": 7})), || async { Ok("unused".to_string()) });
        // Different params, different key.
        let other = dedup.deduplicate("/x", Some(&json!({"id": 8})), || async { Ok("eight".to_string()) });

        tx.send(()).unwrap();
        let failure = Err(CallError::Transport("502 Bad Gateway".to_string()));
        assert_eq!(first.await, failure);
        assert_eq!(second.await, failure);
        assert_eq!(other.await, Ok("eight".to_string()));
        assert_eq!(dedup.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_operation_survives_abandoned_callers() {
        let dedup = Dedup::new();
        let done = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();

        let d = done.clone();
        drop(dedup.deduplicate("/slow", None, move || async move {
            let _ = rx.await;
            d.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        }));

        tx.send(()).unwrap();
        for _ in 0..100 {
            if !dedup.is_pending("/slow", None) {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!dedup.is_pending("/slow", None));
    }

    #[tokio::test]
    async fn test_clear_does_not_evict_newer_operation() {
        let dedup = Dedup::new();
        let (tx_old, rx_old) = oneshot::channel::<()>();
        let (tx_new, rx_new) = oneshot::channel::<()>();

        let old = dedup.deduplicate("/k", None, move || async move {
            let _ = rx_old.await;
            Ok("old".to_string())
        });
        dedup.clear("/k", None);
        assert!(!dedup.is_pending("/k", None));

        let new = dedup.deduplicate("/k", None, move || async move {
            let _ = rx_new.await;
            Ok("new".to_string())
        });

        tx_old.send(()).unwrap();
        assert_eq!(old.await, Ok("old".to_string()));
        assert!(dedup.is_pending("/k", None));

        tx_new.send(()).unwrap();
        assert_eq!(new.await, Ok("new".to_string()));
        assert!(!dedup.is_pending("/k", None));
    }

    #[tokio::test]
    async fn test_with_deduplication() {
        let dedup = Arc::new(Dedup::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let fetch = dedup.with_deduplication(move |url: &str, _params: Option<&Value>| {
            c.fetch_add(1, Ordering::SeqCst);
            let url = url.to_string();
            async move {
                tokio::task::yield_now().await;
                Ok(format!("fetched {}", url))
            }
        });

        let a = fetch("/customers", None);
        let b = fetch("/customers", None);
        assert_eq!(a.await, Ok("fetched /customers".to_string()));
        assert_eq!(b.await, Ok("fetched /customers".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_runtime_shutdown_settles_waiters_as_cancelled() {
        let dedup = Dedup::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (first, second) = runtime.block_on(async {
            let first = dedup.deduplicate("/hang", None, std::future::pending);
            let second = dedup.deduplicate("/hang", None, || async { Ok("unused".to_string()) });
            (first, second)
        });
        assert!(dedup.is_pending("/hang", None));

        // Shutting down drops the spawned task and its guard.
        drop(runtime);
        assert!(!dedup.is_pending("/hang", None));

        let waiter = tokio::runtime::Runtime::new().unwrap();
        assert_eq!(waiter.block_on(first), Err(CallError::Cancelled));
        assert_eq!(waiter.block_on(second), Err(CallError::Cancelled));
    }
}
