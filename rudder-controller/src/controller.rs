//! The cluster controller.
//!
//! Every controller instance is a leadership candidate. While leading, the controller watches
//! the cluster's metadata and runs the pipeline for every batch of changes. All watch
//! notifications feed a single channel which is drained by a single consumer, so at most one
//! pipeline run is ever in flight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::prelude::*;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use crate::cache::ClusterDataCache;
use crate::election::{LeaderElectionConfig, LeaderElector, LeaderState};
use crate::monitor::StatusMonitor;
use crate::pipeline::{attrs, ChangeSet, ClusterEvent, ClusterEventType, Pipeline, StageContext, StageError};
use crate::stages::default_pipeline;
use rudder_core::store::{MetadataStore, WatchEvent};

const METRIC_PIPELINE_RUNS: &str = "rudder_controller_pipeline_runs";
const METRIC_PIPELINE_FAILURES: &str = "rudder_controller_pipeline_failures";

/// Controller runtime config.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// The name of the cluster to manage.
    pub cluster: String,
    /// The unique identity of this controller.
    pub identity: String,
    /// The duration which leadership candidates wait between re-checks of the leader node.
    pub leader_retry: Duration,
    /// The interval of periodic pipeline runs while leading.
    pub rebalance_interval: Duration,
}

/// A controller of a cluster.
pub struct Controller {
    /// Runtime config.
    config: Arc<ControllerConfig>,
    /// The metadata store client of this controller.
    store: Arc<dyn MetadataStore>,
    /// The monitor receiving cluster status updates.
    monitor: Arc<dyn StatusMonitor>,
    /// The pipeline run for each batch of changes.
    pipeline: Pipeline,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The currently known leader state.
    leader_state: LeaderState,
    /// The cluster data cache, present only while leading.
    cache: Option<ClusterDataCache>,
    /// The sender of store watch notifications, present only while leading.
    events_tx: Option<mpsc::UnboundedSender<WatchEvent>>,
    /// The receiver of store watch notifications, present only while leading.
    events_rx: Option<mpsc::UnboundedReceiver<WatchEvent>>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(config: Arc<ControllerConfig>, store: Arc<dyn MetadataStore>, monitor: Arc<dyn StatusMonitor>, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_PIPELINE_RUNS, metrics::Unit::Count, "the number of pipeline runs of this controller");
        metrics::register_counter!(METRIC_PIPELINE_FAILURES, metrics::Unit::Count, "the number of failed pipeline runs of this controller");
        Self {
            config,
            store,
            monitor,
            pipeline: default_pipeline(vec![]),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            leader_state: LeaderState::Standby,
            cache: None,
            events_tx: None,
            events_rx: None,
        }
    }

    /// Replace the pipeline run by this controller.
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let elect_config = LeaderElectionConfig::new(&self.config.cluster, self.config.identity.clone(), self.config.leader_retry)
            .context("invalid leader election config")?;
        let (elector, state_rx_raw) = LeaderElector::new(elect_config, self.store.clone(), self.shutdown_tx.subscribe());
        let (mut elector, mut state_rx) = (elector.spawn(), WatchStream::new(state_rx_raw.clone()));

        let ctx = StageContext {
            cluster: Arc::new(self.config.cluster.clone()),
            identity: Arc::new(self.config.identity.clone()),
            store: self.store.clone(),
            leader_state: state_rx_raw,
            monitor: self.monitor.clone(),
        };
        self.pipeline.init(&ctx);
        let mut rebalance = tokio::time::interval(self.config.rebalance_interval);
        rebalance.tick().await; // First tick completes immediately.

        tracing::info!(cluster = %self.config.cluster, identity = %self.config.identity, "controller initialized");
        let elector_res = loop {
            tokio::select! {
                Some(new_leader_state) = state_rx.next() => self.handle_leader_state(new_leader_state).await,
                Some(event) = Self::next_event(&mut self.events_rx) => self.handle_watch_events(event).await,
                _ = rebalance.tick() => self.run_pipeline(ClusterEventType::PeriodicRebalance, ChangeSet::full()).await,
                res = &mut elector => break Some(res),
                _ = self.shutdown_rx.next() => break None,
            }
        };
        let res = match elector_res {
            Some(res) => res,
            None => elector.await,
        };
        let res = res.context("error joining leader elector task").and_then(|res| res);

        self.pipeline.release();
        self.handle_leader_state(LeaderState::Standby).await;
        match res {
            Ok(()) => {
                tracing::info!("controller shutdown");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = ?err, "leader elector stopped, controller can no longer contend for leadership");
                Err(err.context("controller stopped"))
            }
        }
    }

    /// Receive the next watch notification, if leading.
    async fn next_event(events_rx: &mut Option<mpsc::UnboundedReceiver<WatchEvent>>) -> Option<WatchEvent> {
        match events_rx {
            Some(rx) => rx.recv().await,
            None => future::pending().await,
        }
    }

    /// Handle a change in leadership.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_leader_state(&mut self, state: LeaderState) {
        let was_leading = matches!(self.leader_state, LeaderState::Leading);
        self.leader_state = state;
        match (&self.leader_state, was_leading) {
            (LeaderState::Leading, false) => {
                // Rebuild all cluster data from scratch, the previous leader may have left work
                // in any state.
                tracing::info!("controller is now active");
                let (tx, rx) = mpsc::unbounded_channel();
                self.cache = Some(ClusterDataCache::new(self.config.cluster.clone(), tx.clone()));
                self.events_tx = Some(tx);
                self.events_rx = Some(rx);
                self.run_pipeline(ClusterEventType::LeadershipAcquired, ChangeSet::full()).await;
            }
            (LeaderState::Leading, true) => (),
            (_, true) => {
                tracing::info!("controller is now passive");
                self.cache = None;
                self.events_tx = None;
                self.events_rx = None;
            }
            (_, false) => (),
        }
    }

    /// Handle a watch notification, coalescing it with all other queued notifications.
    async fn handle_watch_events(&mut self, event: WatchEvent) {
        let mut changes = ChangeSet::default();
        changes.record(&self.config.cluster, &event);
        if let Some(rx) = self.events_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                changes.record(&self.config.cluster, &event);
            }
        }
        if changes.is_empty() {
            return;
        }
        self.run_pipeline(ClusterEventType::DataChange, changes).await;
    }

    /// Run the pipeline once, if leading.
    async fn run_pipeline(&mut self, kind: ClusterEventType, changes: ChangeSet) {
        if !matches!(self.leader_state, LeaderState::Leading) {
            return;
        }
        let cache = match (self.cache.take(), self.events_tx.as_ref()) {
            (Some(cache), _) => cache,
            (None, Some(tx)) => ClusterDataCache::new(self.config.cluster.clone(), tx.clone()),
            (None, None) => return,
        };
        let mut event = ClusterEvent::new(kind, changes);
        event.insert(attrs::CLUSTER_DATA, cache);

        metrics::increment_counter!(METRIC_PIPELINE_RUNS);
        let res = self.pipeline.handle(&mut event).await;
        let mut cache = event.take::<ClusterDataCache>(attrs::CLUSTER_DATA);
        match res {
            Ok(()) => tracing::debug!(?kind, "pipeline run finished"),
            Err(err) if err.is_benign() => tracing::debug!(error = %err, "pipeline run aborted"),
            Err(err) => {
                metrics::increment_counter!(METRIC_PIPELINE_FAILURES);
                tracing::error!(error = ?err, ?kind, "error running pipeline, will retry on next event");
                if matches!(err, StageError::Store(_)) {
                    if let Some(cache) = cache.as_mut() {
                        cache.invalidate();
                    }
                }
            }
        }
        self.cache = cache;
    }
}
