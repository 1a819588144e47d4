//! An in-process metadata store.
//!
//! Nodes live in an ordered map keyed by path, parents are implicit. Ephemeral nodes are owned by
//! the session which wrote them and vanish with it. Persistent nodes may optionally be backed by
//! a durable `Database`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{watch, Mutex, MutexGuard};
use uuid::Uuid;

use crate::store::{CreateMode, Database, MetadataStore, SessionState, StoreError, StoreResult, WatchEvent, WatchEventKind, WatchSender};

/// An in-process metadata store shared by any number of client sessions.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreState>>,
    /// The durable backing of persistent nodes, if any.
    db: Option<Database>,
}

struct StoreState {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<String, watch::Sender<SessionState>>,
    /// Registered subtree watches as `(root path, channel)` pairs.
    watchers: Vec<(String, WatchSender)>,
    available: bool,
}

struct Node {
    data: Vec<u8>,
    /// The owning session of an ephemeral node.
    owner: Option<String>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            sessions: HashMap::new(),
            watchers: vec![],
            available: true,
        }
    }

    /// Deliver a notification to every watcher of a subtree containing the given path.
    fn notify(&mut self, path: &str, kind: WatchEventKind) {
        self.watchers.retain(|(root, tx)| {
            if !is_within(root, path) {
                return !tx.is_closed();
            }
            tx.send(WatchEvent { path: path.into(), kind }).is_ok()
        });
    }

    /// Ensure the given session may perform operations.
    fn check_session(&self, session_id: &str) -> StoreResult<()> {
        if !self.available {
            return Err(StoreError::Unavailable("metadata store is not reachable".into()));
        }
        if !self.sessions.contains_key(session_id) {
            return Err(StoreError::SessionExpired(session_id.into()));
        }
        Ok(())
    }

    /// The paths of the node at the given path and all of its descendants.
    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        let mut paths: Vec<String> = self.nodes.get_key_value(path).map(|(key, _)| key.clone()).into_iter().collect();
        paths.extend(
            self.nodes
                .range::<String, _>(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone()),
        );
        paths
    }
}

/// Check if `path` is `root` or one of its descendants.
fn is_within(root: &str, path: &str) -> bool {
    path == root || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

/// Validate the given node path.
fn validate_path(path: &str) -> StoreResult<()> {
    let valid = path.len() > 1 && path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(|segment| segment.is_empty());
    if !valid {
        return Err(StoreError::InvalidPath(path.into()));
    }
    Ok(())
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new purely in-memory store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreState::new())),
            db: None,
        }
    }

    /// Open a store whose persistent nodes are durably stored at the given path.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let db = Database::open(path).await.context("error opening store database")?;
        let mut state = StoreState::new();
        for (path, data) in db.load_nodes().await? {
            state.nodes.insert(path, Node { data, owner: None });
        }
        tracing::debug!(nodes = state.nodes.len(), "loaded persistent nodes from database");
        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
            db: Some(db),
        })
    }

    /// Open a new client session.
    pub async fn connect(&self) -> StoreSession {
        let session_id = Uuid::new_v4().to_string();
        let (tx, state_rx) = watch::channel(SessionState::Connected);
        self.inner.lock().await.sessions.insert(session_id.clone(), tx);
        tracing::debug!(session = %session_id, "new store session connected");
        StoreSession {
            store: self.clone(),
            session_id,
            state_rx,
        }
    }

    /// Expire the given session, deleting all of its ephemeral nodes.
    pub async fn expire_session(&self, session_id: &str) {
        let mut state = self.inner.lock().await;
        let tx = match state.sessions.remove(session_id) {
            Some(tx) => tx,
            None => return,
        };
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.owner.as_deref() == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            state.nodes.remove(&path);
            state.notify(&path, WatchEventKind::Deleted);
        }
        drop(state);
        let _ = tx.send(SessionState::Expired);
        tracing::debug!(session = %session_id, "store session expired");
    }

    /// Toggle the reachability of the store for all sessions.
    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.available = available;
    }

    /// Flush durable state to disk, if any.
    pub async fn flush(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.flush().await?;
        }
        Ok(())
    }

    async fn lock_for(&self, session_id: &str) -> StoreResult<MutexGuard<'_, StoreState>> {
        let state = self.inner.lock().await;
        state.check_session(session_id)?;
        Ok(state)
    }

    async fn persist(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<()> {
        let db = match &self.db {
            Some(db) => db,
            None => return Ok(()),
        };
        let res = match mode {
            CreateMode::Persistent => db.put(path, data).await,
            // Ephemeral nodes never outlive the process.
            CreateMode::Ephemeral => db.remove(path).await,
        };
        res.map_err(|err| StoreError::Storage(err.0))
    }
}

/// A client session of a `MemoryStore`.
pub struct StoreSession {
    store: MemoryStore,
    session_id: String,
    state_rx: watch::Receiver<SessionState>,
}

impl StoreSession {
    /// Close this session, deleting all of its ephemeral nodes.
    pub async fn close(&self) {
        self.store.expire_session(&self.session_id).await;
    }

    /// The store this session belongs to.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl MetadataStore for StoreSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    async fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_path(path)?;
        let state = self.store.lock_for(&self.session_id).await?;
        Ok(state.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        validate_path(path)?;
        let state = self.store.lock_for(&self.session_id).await?;
        let prefix = format!("{}/", path);
        let children: BTreeSet<String> = state
            .nodes
            .range::<String, _>(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next().map(String::from))
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn write(&self, path: &str, value: Vec<u8>, mode: CreateMode) -> StoreResult<()> {
        validate_path(path)?;
        let mut state = self.store.lock_for(&self.session_id).await?;
        self.store.persist(path, &value, mode).await?;
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session_id.clone()),
        };
        state.nodes.insert(path.into(), Node { data: value, owner });
        state.notify(path, WatchEventKind::Changed);
        Ok(())
    }

    async fn create_if_absent(&self, path: &str, value: Vec<u8>, mode: CreateMode) -> StoreResult<bool> {
        validate_path(path)?;
        let mut state = self.store.lock_for(&self.session_id).await?;
        if state.nodes.contains_key(path) {
            return Ok(false);
        }
        self.store.persist(path, &value, mode).await?;
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session_id.clone()),
        };
        state.nodes.insert(path.into(), Node { data: value, owner });
        state.notify(path, WatchEventKind::Changed);
        Ok(true)
    }

    async fn delete_recursive(&self, path: &str) -> StoreResult<()> {
        validate_path(path)?;
        let mut state = self.store.lock_for(&self.session_id).await?;
        let removed = state.subtree(path);
        if removed.is_empty() {
            return Ok(());
        }
        if let Some(db) = &self.store.db {
            db.remove_prefix(path).await.map_err(|err| StoreError::Storage(err.0))?;
        }
        for path in removed {
            state.nodes.remove(&path);
            state.notify(&path, WatchEventKind::Deleted);
        }
        Ok(())
    }

    async fn watch(&self, path: &str, tx: WatchSender) -> StoreResult<()> {
        validate_path(path)?;
        let mut state = self.store.lock_for(&self.session_id).await?;
        state.watchers.push((path.into(), tx));
        Ok(())
    }
}
