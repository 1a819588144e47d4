//! The metadata store interface.
//!
//! The metadata store is a hierarchical key-value store with sessions, ephemeral nodes and
//! subtree watches. Every component of the cluster communicates exclusively through it.

mod database;
mod memory;
mod retry;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use database::{Database, DEFAULT_DATA_PATH};
pub use memory::{MemoryStore, StoreSession};
pub use retry::Retrying;

/// Metadata store error variants.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The session of the client has expired, all of its ephemeral nodes are gone.
    #[error("session {0} has expired")]
    SessionExpired(String),
    /// The store could not be reached; the operation may be retried.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
    /// The given path is not a valid store path.
    #[error("invalid path {0}")]
    InvalidPath(String),
    /// The record stored at the given path could not be decoded.
    #[error("invalid record at {path}: {source}")]
    InvalidRecord { path: String, source: serde_json::Error },
    /// An error from the underlying storage.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl StoreError {
    /// Check if the operation which produced this error may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StoreResult<T> = ::std::result::Result<T, StoreError>;

/// The lifetime of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// The node lives until it is deleted.
    Persistent,
    /// The node is deleted when the session which wrote it ends.
    Ephemeral,
}

/// The state of a client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Expired,
}

/// The kind of change observed by a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Changed,
    Deleted,
}

/// A change notification for a node within a watched subtree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// The channel over which watch notifications are delivered.
pub type WatchSender = mpsc::UnboundedSender<WatchEvent>;

/// A client session of a metadata store.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// The ID of this client's session.
    fn session_id(&self) -> &str;

    /// A channel tracking the state of this client's session.
    fn session_state(&self) -> watch::Receiver<SessionState>;

    /// Read the value of the node at the given path.
    async fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>>;

    /// List the names of the immediate children of the given path, in sorted order.
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Write the value of the node at the given path, creating it if needed.
    async fn write(&self, path: &str, value: Vec<u8>, mode: CreateMode) -> StoreResult<()>;

    /// Create the node at the given path only if it does not exist, returning `true` if created.
    async fn create_if_absent(&self, path: &str, value: Vec<u8>, mode: CreateMode) -> StoreResult<bool>;

    /// Delete the node at the given path along with all of its descendants.
    async fn delete_recursive(&self, path: &str) -> StoreResult<()>;

    /// Register a persistent watch on the subtree rooted at the given path.
    ///
    /// Every change to a node at or below the path is delivered on the given channel until it is
    /// closed.
    async fn watch(&self, path: &str, tx: WatchSender) -> StoreResult<()>;
}

/// Read and decode the record at the given path.
pub async fn read_record<T: DeserializeOwned>(store: &dyn MetadataStore, path: &str) -> StoreResult<Option<T>> {
    match store.read(path).await? {
        Some(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| StoreError::InvalidRecord { path: path.into(), source }),
        None => Ok(None),
    }
}

/// Encode and write the given record at the given path.
pub async fn write_record<T: Serialize + Sync>(store: &dyn MetadataStore, path: &str, record: &T, mode: CreateMode) -> StoreResult<()> {
    let data = serde_json::to_vec(record).map_err(|source| StoreError::InvalidRecord { path: path.into(), source })?;
    store.write(path, data, mode).await
}

/// Encode and create the given record at the given path only if it does not exist.
pub async fn create_record<T: Serialize + Sync>(store: &dyn MetadataStore, path: &str, record: &T, mode: CreateMode) -> StoreResult<bool> {
    let data = serde_json::to_vec(record).map_err(|source| StoreError::InvalidRecord { path: path.into(), source })?;
    store.create_if_absent(path, data, mode).await
}
