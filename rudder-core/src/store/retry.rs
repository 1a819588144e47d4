//! Retry of transient metadata store failures.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::store::{CreateMode, MetadataStore, SessionState, StoreResult, WatchSender};

/// The default maximum interval between two attempts of an operation.
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(5);
/// The default total time an operation is retried for before its error is surfaced.
const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(30);

/// A store client which retries transient failures of the wrapped client with an exponential
/// backoff.
///
/// Non-transient errors, such as an expired session, are returned immediately.
pub struct Retrying<S: MetadataStore + ?Sized> {
    inner: Arc<S>,
    max_interval: Duration,
    max_elapsed: Option<Duration>,
}

impl<S: MetadataStore + ?Sized> Retrying<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_elapsed: Some(DEFAULT_MAX_ELAPSED),
        }
    }

    /// Bound the total time an operation is retried for; `None` retries forever.
    pub fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, path: &str, mut f: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let backoff = backoff::ExponentialBackoff {
            max_interval: self.max_interval,
            max_elapsed_time: self.max_elapsed,
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = f();
            async move {
                fut.await.map_err(|err| {
                    if err.is_transient() {
                        tracing::warn!(error = ?err, op, path, "transient metadata store error, will retry");
                        backoff::Error::Transient(err)
                    } else {
                        backoff::Error::Permanent(err)
                    }
                })
            }
        })
        .await
    }
}

#[async_trait]
impl<S: MetadataStore + ?Sized> MetadataStore for Retrying<S> {
    fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.inner.session_state()
    }

    async fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        self.retry("read", path, || self.inner.read(path)).await
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.retry("children", path, || self.inner.children(path)).await
    }

    async fn write(&self, path: &str, value: Vec<u8>, mode: CreateMode) -> StoreResult<()> {
        self.retry("write", path, || self.inner.write(path, value.clone(), mode)).await
    }

    async fn create_if_absent(&self, path: &str, value: Vec<u8>, mode: CreateMode) -> StoreResult<bool> {
        self.retry("create_if_absent", path, || self.inner.create_if_absent(path, value.clone(), mode))
            .await
    }

    async fn delete_recursive(&self, path: &str) -> StoreResult<()> {
        self.retry("delete_recursive", path, || self.inner.delete_recursive(path)).await
    }

    async fn watch(&self, path: &str, tx: WatchSender) -> StoreResult<()> {
        self.retry("watch", path, || self.inner.watch(path, tx.clone())).await
    }
}
