//! The participant manager.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::prelude::*;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream, WatchStream};

use crate::engine::{EngineContext, StateMachineEngine, WorkerEvent};
use crate::handler::HandlerRegistry;
use rudder_core::model::{InstanceConfig, LiveInstance, Message};
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{create_record, read_record, CreateMode, MetadataStore, SessionState, StoreError};

/// Participant runtime config.
#[derive(Clone, Debug)]
pub struct ParticipantConfig {
    /// The name of the cluster to join.
    pub cluster: String,
    /// The name of the instance hosted by this participant.
    pub instance: String,
    /// The hostname recorded in the live instance record.
    pub hostname: String,
    /// The interval of periodic re-scans of the message queue.
    pub rescan_interval: Duration,
}

/// A participant of a cluster, hosting the partition replicas of a single instance.
pub struct Participant {
    /// Runtime config.
    config: Arc<ParticipantConfig>,
    /// The metadata store client of this participant.
    store: Arc<dyn MetadataStore>,
    /// The transition handlers of this participant.
    handlers: HandlerRegistry,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Participant {
    /// Create a new instance.
    pub fn new(config: Arc<ParticipantConfig>, store: Arc<dyn MetadataStore>, handlers: HandlerRegistry, shutdown_tx: &broadcast::Sender<()>) -> Self {
        Self {
            config,
            store,
            handlers,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        self.register().await.context("error registering participant")?;
        tracing::info!(
            instance = %self.config.instance,
            state_models = ?self.handlers.state_models(),
            "participant registered"
        );

        let messages_root = path(PropertyType::Messages, &self.config.cluster, &[&self.config.instance]);
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        self.store
            .watch(&messages_root, watch_tx)
            .await
            .context("error watching message queue")?;
        let mut watch_events = UnboundedReceiverStream::new(watch_rx);
        let mut session_state = WatchStream::new(self.store.session_state());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut worker_events = UnboundedReceiverStream::new(events_rx);
        let ctx = Arc::new(EngineContext {
            cluster: self.config.cluster.clone(),
            instance: self.config.instance.clone(),
            session_id: self.store.session_id().to_string(),
            store: self.store.clone(),
            handlers: self.handlers.clone(),
        });
        let mut engine = StateMachineEngine::new(ctx, events_tx);
        let mut rescan = tokio::time::interval(self.config.rescan_interval);

        loop {
            tokio::select! {
                Some(_) = watch_events.next() => {
                    // Every change re-scans the whole queue, drain all queued notifications.
                    while let Some(Some(_)) = watch_events.next().now_or_never() {}
                    self.scan(&mut engine, &messages_root).await;
                }
                Some(event) = worker_events.next() => {
                    let completed = matches!(event, WorkerEvent::Completed { .. });
                    engine.handle_worker_event(event);
                    if completed {
                        self.scan(&mut engine, &messages_root).await;
                    }
                }
                _ = rescan.tick() => self.scan(&mut engine, &messages_root).await,
                Some(state) = session_state.next() => {
                    if state == SessionState::Expired {
                        tracing::error!(instance = %self.config.instance, "store session expired, participant stopping");
                        break;
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        engine.shutdown().await;
        self.deregister().await;
        tracing::info!(instance = %self.config.instance, "participant shutdown");
        Ok(())
    }

    /// Announce this participant's session as the live session of its instance.
    ///
    /// Current states of previous sessions of the instance are deleted.
    #[tracing::instrument(level = "debug", skip(self), fields(instance = %self.config.instance))]
    async fn register(&self) -> Result<()> {
        let (cluster, instance) = (&self.config.cluster, &self.config.instance);
        let cfg_path = path(PropertyType::ParticipantConfigs, cluster, &[instance]);
        if create_record(self.store.as_ref(), &cfg_path, &InstanceConfig::new(instance.as_str()), CreateMode::Persistent).await? {
            tracing::info!(%instance, "instance added to cluster");
        }

        let session_id = self.store.session_id().to_string();
        let live_path = path(PropertyType::LiveInstances, cluster, &[instance]);
        let live = LiveInstance {
            instance: instance.clone(),
            session_id: session_id.clone(),
            hostname: self.config.hostname.clone(),
        };
        if !create_record(self.store.as_ref(), &live_path, &live, CreateMode::Ephemeral).await? {
            let holder: Option<LiveInstance> = read_record(self.store.as_ref(), &live_path).await?;
            match holder {
                Some(holder) if holder.session_id != session_id => {
                    bail!("instance {} is already live in session {}", instance, holder.session_id)
                }
                _ => (),
            }
        }

        let sessions_root = path(PropertyType::CurrentStates, cluster, &[instance]);
        for session in self.store.children(&sessions_root).await? {
            if session == session_id {
                continue;
            }
            let stale_path = path(PropertyType::CurrentStates, cluster, &[instance, &session]);
            self.store.delete_recursive(&stale_path).await?;
            tracing::debug!(%session, "deleted current states of previous session");
        }
        Ok(())
    }

    /// Remove the live instance record of this session.
    async fn deregister(&self) {
        let live_path = path(PropertyType::LiveInstances, &self.config.cluster, &[&self.config.instance]);
        let holder: Result<Option<LiveInstance>, StoreError> = read_record(self.store.as_ref(), &live_path).await;
        match holder {
            Ok(Some(holder)) if holder.session_id == self.store.session_id() => {
                if let Err(err) = self.store.delete_recursive(&live_path).await {
                    tracing::error!(error = ?err, "error removing live instance record");
                }
            }
            Ok(_) => (),
            Err(err) => tracing::debug!(error = ?err, "error reading live instance record during shutdown"),
        }
    }

    /// Route every queued message which is not yet held by a worker.
    #[tracing::instrument(level = "trace", skip(self, engine))]
    async fn scan(&self, engine: &mut StateMachineEngine, messages_root: &str) {
        let ids = match self.store.children(messages_root).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::error!(error = ?err, "error listing queued messages");
                return;
            }
        };
        for id in ids {
            if engine.is_in_flight(&id) {
                continue;
            }
            let msg_path = path(PropertyType::Messages, &self.config.cluster, &[&self.config.instance, &id]);
            match read_record::<Message>(self.store.as_ref(), &msg_path).await {
                Ok(Some(message)) => engine.dispatch(message).await,
                Ok(None) => (),
                Err(StoreError::InvalidRecord { path, source }) => {
                    tracing::warn!(error = ?source, %path, "discarding malformed message");
                    if let Err(err) = self.store.delete_recursive(&path).await {
                        tracing::error!(error = ?err, "error deleting malformed message");
                    }
                }
                Err(err) => {
                    tracing::error!(error = ?err, "error reading queued message");
                    return;
                }
            }
        }
    }
}
