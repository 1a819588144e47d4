//! Durable storage of persistent nodes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec, Tree};

use crate::error::{ShutdownError, ShutdownResult};

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/rudder/db";
/// The DB tree used for persistent nodes.
const TREE_NODES: &str = "nodes";

/// An abstraction over the durable node database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
    /// The tree holding all persistent nodes, keyed by path.
    nodes: Tree,
}

impl Database {
    /// Open the database at the given path for usage.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let dbpath = path.into();
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for rudder database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let nodes = db
                .open_tree(IVec::from(TREE_NODES))
                .map_err(|err| anyhow!("could not open DB tree {} {}", TREE_NODES, err))?;
            let inner = Arc::new(DatabaseInner { db, nodes });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Load all persistent nodes.
    pub async fn load_nodes(&self) -> ShutdownResult<Vec<(String, Vec<u8>)>> {
        let tree = self.inner.nodes.clone();
        Self::spawn_blocking(move || -> Result<Vec<(String, Vec<u8>)>> {
            let mut nodes = vec![];
            for kv_res in tree.iter() {
                let (key, val) = kv_res.context("error iterating persistent nodes")?;
                let path = String::from_utf8(key.to_vec()).context("invalid node path in database")?;
                nodes.push((path, val.to_vec()));
            }
            Ok(nodes)
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))
    }

    /// Write the value of a persistent node.
    pub async fn put(&self, path: &str, value: &[u8]) -> ShutdownResult<()> {
        let (tree, path, value) = (self.inner.nodes.clone(), path.to_string(), value.to_vec());
        Self::spawn_blocking(move || -> Result<()> {
            tree.insert(path.as_bytes(), value)
                .with_context(|| format!("error writing node {}", path))?;
            Ok(())
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))
    }

    /// Remove the node at the given path.
    pub async fn remove(&self, path: &str) -> ShutdownResult<()> {
        let (tree, path) = (self.inner.nodes.clone(), path.to_string());
        Self::spawn_blocking(move || -> Result<()> {
            tree.remove(path.as_bytes())
                .with_context(|| format!("error removing node {}", path))?;
            Ok(())
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))
    }

    /// Remove the node at the given path along with all of its descendants.
    pub async fn remove_prefix(&self, path: &str) -> ShutdownResult<()> {
        let (tree, path) = (self.inner.nodes.clone(), path.to_string());
        Self::spawn_blocking(move || -> Result<()> {
            let mut batch = sled::Batch::default();
            batch.remove(path.as_bytes());
            let prefix = format!("{}/", path);
            for kv_res in tree.scan_prefix(prefix.as_bytes()) {
                let (key, _) = kv_res.context("error scanning nodes for removal")?;
                batch.remove(key);
            }
            tree.apply_batch(batch)
                .with_context(|| format!("error removing nodes under {}", path))?;
            Ok(())
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> ShutdownResult<()> {
        self.inner
            .db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|err| ShutdownError(anyhow!("error flushing database {}", err)))
    }
}
