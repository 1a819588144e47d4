//! Controller leader election.
//!
//! All controller candidates of a cluster race to create the ephemeral leader node. The candidate
//! which creates it is the leader until its session ends, at which point the node vanishes and
//! the remaining candidates, all watching the node, race again.
//!
//! Candidates also re-check the node on a jittered retry period, so that a missed notification
//! can never leave the cluster leaderless.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use futures::prelude::*;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream, WatchStream};

use rudder_core::model::LeaderRecord;
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{create_record, read_record, CreateMode, MetadataStore, SessionState, WatchEvent};
use rudder_core::utils;

const JITTER_FACTOR: f64 = 1.2;

const METRIC_IS_LEADER: &str = "rudder_controller_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "rudder_controller_num_leadership_changes";

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This controller is the leader.
    Leading,
    /// A different controller is currently the leader, identified by the encapsulated string.
    Following(String),
    /// The leadership state is unknown, or the elector is starting or stopping.
    Standby,
}

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// The name of the cluster whose leadership is contended.
    cluster: String,
    /// The identity recorded in the leader node when leadership is acquired.
    identity: String,
    /// The duration which candidates wait between re-checks of the leader node.
    retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Create a new `LeaderElectionConfig` instance, validating given inputs.
    pub fn new(cluster: impl AsRef<str>, identity: String, retry_period: Duration) -> Result<Self> {
        ensure!(!cluster.as_ref().is_empty(), "cluster name must not be empty");
        ensure!(!identity.is_empty(), "controller identity must not be empty");
        ensure!(retry_period >= Duration::from_millis(10), "retry_period must be at least 10 milliseconds");
        Ok(Self {
            cluster: cluster.as_ref().to_string(),
            identity,
            retry_period,
        })
    }
}

/// A task which is responsible for acquiring the leader node of a cluster.
pub struct LeaderElector {
    /// The metadata store client of this candidate.
    store: Arc<dyn MetadataStore>,
    /// Leader election config.
    config: LeaderElectionConfig,
    /// The path of the leader node.
    leader_path: String,
    /// Sender for the current state of the leadership coordination system.
    state_tx: watch::Sender<LeaderState>,
    /// The last known leader state.
    state: LeaderState,
    /// A broadcast channel used to trigger task shutdown.
    shutdown: BroadcastStream<()>,
    /// The number of times this candidate has acquired leadership.
    num_changes: u64,
}

impl LeaderElector {
    /// Create a new `LeaderElector` instance.
    pub fn new(config: LeaderElectionConfig, store: Arc<dyn MetadataStore>, shutdown: broadcast::Receiver<()>) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of leadership changes in the controller group");
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this controller is the leader, where 1.0 indicates leadership, any other value does not"
        );
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        let leader_path = path(PropertyType::Leader, &config.cluster, &[]);
        (
            LeaderElector {
                store,
                config,
                leader_path,
                state_tx,
                state: LeaderState::Standby,
                shutdown: BroadcastStream::new(shutdown),
                num_changes: 0,
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Contend for leadership until shutdown.
    ///
    /// Returns an error if the store session of this candidate expires, as a candidate can never
    /// contend again on an expired session.
    async fn run(mut self) -> Result<()> {
        tracing::info!(identity = %self.config.identity, "leader elector task started");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut events = UnboundedReceiverStream::new(events_rx);
        let controller_path = path(PropertyType::Controller, &self.config.cluster, &[]);
        let mut watching = match self.store.watch(&controller_path, events_tx.clone()).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(error = ?err, "error watching leader node, will retry");
                false
            }
        };
        let mut session_state = WatchStream::new(self.store.session_state());

        self.try_acquire().await;
        let mut expired = false;
        loop {
            let delay = self.get_next_retry_delay();
            tokio::select! {
                Some(event) = events.next() => self.handle_watch_event(event).await,
                Some(state) = session_state.next() => {
                    if state == SessionState::Expired {
                        tracing::warn!("store session expired, leader elector stopping");
                        expired = true;
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    if !watching {
                        watching = match self.store.watch(&controller_path, events_tx.clone()).await {
                            Ok(()) => true,
                            Err(err) => {
                                tracing::error!(error = ?err, "error watching leader node, will retry");
                                false
                            }
                        };
                    }
                    self.try_acquire().await;
                }
                _ = self.shutdown.next() => {
                    self.relinquish().await;
                    break;
                }
            }
        }

        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector task stopped");
        if expired {
            bail!("store session {} of controller {} expired", self.store.session_id(), self.config.identity);
        }
        Ok(())
    }

    /// Handle a notification from the leader node watch.
    #[tracing::instrument(level = "debug", skip(self, event))]
    async fn handle_watch_event(&mut self, event: WatchEvent) {
        if event.path != self.leader_path {
            return;
        }
        tracing::debug!(kind = ?event.kind, "leader node change observed");
        self.try_acquire().await;
    }

    /// Attempt to acquire the leader node, or observe its current holder.
    async fn try_acquire(&mut self) {
        match self.try_acquire_inner().await {
            Ok(Some(state)) => self.set_state(state),
            Ok(None) => (),
            Err(err) => {
                tracing::error!(error = ?err, "error during call to try_acquire");
                if !matches!(&self.state, LeaderState::Standby) {
                    self.set_state(LeaderState::Standby);
                }
            }
        }
    }

    async fn try_acquire_inner(&mut self) -> Result<Option<LeaderState>> {
        let record = LeaderRecord {
            identity: self.config.identity.clone(),
            session_id: self.store.session_id().to_string(),
            acquired_at: utils::now_millis(),
        };
        let created = create_record(self.store.as_ref(), &self.leader_path, &record, CreateMode::Ephemeral)
            .await
            .context("error creating leader node")?;
        if created {
            tracing::info!(identity = %self.config.identity, "leadership acquired");
            self.num_changes += 1;
            metrics::gauge!(METRIC_LEADERSHIP_CHANGE, self.num_changes as f64);
            return Ok(Some(LeaderState::Leading));
        }

        let holder: Option<LeaderRecord> = read_record(self.store.as_ref(), &self.leader_path)
            .await
            .context("error reading leader node")?;
        let state = match holder {
            Some(holder) if holder.session_id == self.store.session_id() => LeaderState::Leading,
            Some(holder) => LeaderState::Following(holder.identity),
            // The node vanished after the create attempt, the deletion will be observed shortly.
            None => return Ok(None),
        };
        if state == self.state {
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Delete the leader node if it is held by this candidate.
    async fn relinquish(&mut self) {
        if !matches!(self.state, LeaderState::Leading) {
            return;
        }
        let holder: Result<Option<LeaderRecord>, _> = read_record(self.store.as_ref(), &self.leader_path).await;
        match holder {
            Ok(Some(holder)) if holder.session_id == self.store.session_id() => {
                if let Err(err) = self.store.delete_recursive(&self.leader_path).await {
                    tracing::error!(error = ?err, "error relinquishing leadership");
                    return;
                }
                tracing::info!("leadership relinquished");
            }
            Ok(_) => (),
            Err(err) => tracing::error!(error = ?err, "error reading leader node during shutdown"),
        }
    }

    /// Get the jittered duration to delay before re-checking the leader node.
    fn get_next_retry_delay(&self) -> Duration {
        let jitter = 1.0 + rand::random::<f64>() * (JITTER_FACTOR - 1.0);
        self.config.retry_period.mul_f64(jitter)
    }

    /// Set the current leader state & emit a state update.
    fn set_state(&mut self, state: LeaderState) {
        if state != self.state {
            tracing::debug!(?state, "leader state changed");
        }
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
        let is_leader = if matches!(self.state, LeaderState::Leading) { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_LEADER, is_leader);
    }
}
