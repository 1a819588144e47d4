use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::server::spawn_prom_server;
use rudder_controller::monitor::MetricsMonitor;
use rudder_controller::{Controller, ControllerConfig};
use rudder_core::admin::ClusterAdmin;
use rudder_core::model::StateModelDefinition;
use rudder_core::store::{MemoryStore, Retrying, StoreSession};
use rudder_participant::{HandlerRegistry, LoggingHandler, Participant, ParticipantConfig};

/// The application object for when Rudder is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The metadata store hosted by this node.
    store: MemoryStore,
    /// The store sessions of all components of this node.
    sessions: Vec<Arc<StoreSession>>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the controller candidate, if enabled.
    controller_handle: Option<JoinHandle<Result<()>>>,
    /// The join handle of the participant, if enabled.
    participant_handle: Option<JoinHandle<Result<()>>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        // Initialize this node's storage.
        let store = MemoryStore::open(&config.storage_data_path).await.context("error opening metadata store")?;

        let admin_session = Arc::new(store.connect().await);
        let admin = ClusterAdmin::new(Arc::new(Retrying::new(admin_session.clone())), config.cluster_name.clone());
        admin.setup_cluster().await.context("error setting up cluster")?;
        for def in [StateModelDefinition::master_slave(), StateModelDefinition::online_offline()] {
            admin.add_state_model_def(def).await?;
        }
        let mut sessions = vec![admin_session];

        let controller_handle = if config.controller_enabled {
            let session = Arc::new(store.connect().await);
            sessions.push(session.clone());
            let controller_config = Arc::new(ControllerConfig {
                cluster: config.cluster_name.clone(),
                identity: config.instance_name.clone(),
                leader_retry: config.leader_retry(),
                rebalance_interval: config.rebalance_interval(),
            });
            let controller = Controller::new(controller_config, Arc::new(Retrying::new(session)), Arc::new(MetricsMonitor::new()), shutdown_tx.clone());
            Some(supervise(controller.spawn(), shutdown_tx.clone()))
        } else {
            None
        };

        let participant_handle = if config.participant_enabled {
            let session = Arc::new(store.connect().await);
            sessions.push(session.clone());
            let handlers = config
                .state_models
                .iter()
                .fold(HandlerRegistry::new(), |handlers, model| handlers.with_default(model.as_str(), Arc::new(LoggingHandler)));
            let participant_config = Arc::new(ParticipantConfig {
                cluster: config.cluster_name.clone(),
                instance: config.instance_name.clone(),
                hostname: config.hostname.clone(),
                rescan_interval: config.rebalance_interval(),
            });
            let participant = Participant::new(participant_config, Arc::new(Retrying::new(session)), handlers, &shutdown_tx);
            Some(supervise(participant.spawn(), shutdown_tx.clone()))
        } else {
            None
        };

        let metrics_server = spawn_prom_server(&config, metrics, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            store,
            sessions,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            controller_handle,
            participant_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Rudder is shutting down");
        if let Some(handle) = self.participant_handle.take() {
            if let Err(err) = handle.await.context("error joining participant handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down participant");
            }
        }
        if let Some(handle) = self.controller_handle.take() {
            if let Err(err) = handle.await.context("error joining controller handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down controller");
            }
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        for session in self.sessions.iter() {
            session.close().await;
        }
        if let Err(err) = self.store.flush().await {
            tracing::error!(error = ?err, "error flushing metadata store");
        }

        tracing::debug!("Rudder shutdown complete");
        Ok(())
    }
}

/// Trigger a graceful shutdown of the node once the given task stops.
fn supervise(handle: JoinHandle<Result<()>>, shutdown_tx: broadcast::Sender<()>) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let res = handle.await.context("error joining task").and_then(|res| res);
        let _ = shutdown_tx.send(());
        res
    })
}
