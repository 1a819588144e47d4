//! The partition state machine engine.
//!
//! Every partition hosted by the participant is owned by a dedicated worker task which holds the
//! local state of its replica and executes its transitions strictly in order. Workers accept a
//! single queued transition at a time. All current state records are written by a single
//! publisher task, so that concurrent workers of one resource never overwrite each other's
//! updates.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::handler::HandlerRegistry;
use rudder_core::model::{CurrentState, Message, Partition, StateModel, StateModelDefinition, UNINITIALIZED};
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{read_record, write_record, CreateMode, MetadataStore, StoreError};

pub(crate) const METRIC_TRANSITIONS: &str = "rudder_participant_transitions";
pub(crate) const METRIC_TRANSITION_FAILURES: &str = "rudder_participant_transition_failures";
pub(crate) const METRIC_STALE_MESSAGES: &str = "rudder_participant_stale_messages";
pub(crate) const METRIC_PARTITIONS: &str = "rudder_participant_partitions";

/// Handles shared by the engine, its workers and its publisher.
pub struct EngineContext {
    pub cluster: String,
    pub instance: String,
    /// The session of this participant; messages addressed to other sessions are stale.
    pub session_id: String,
    pub store: Arc<dyn MetadataStore>,
    pub handlers: HandlerRegistry,
}

impl EngineContext {
    /// Delete the given message from this instance's queue.
    async fn delete_message(&self, id: &str) {
        let msg_path = path(PropertyType::Messages, &self.cluster, &[&self.instance, id]);
        if let Err(err) = self.store.delete_recursive(&msg_path).await {
            tracing::error!(error = ?err, %id, "error deleting processed message");
        }
    }
}

/// A notification from a partition worker to the engine.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker is finished with the given message.
    Completed { message_id: String },
    /// The worker has stopped, its partition was dropped.
    Stopped { partition: Partition, worker_id: u64 },
}

/// A transition queued for a partition worker.
struct Transition {
    message: Message,
    model: Arc<StateModel>,
}

/// A handle to a running partition worker.
struct WorkerHandle {
    id: u64,
    tx: mpsc::Sender<Transition>,
    handle: JoinHandle<()>,
}

/// Routes transition messages to the worker of their partition.
pub struct StateMachineEngine {
    ctx: Arc<EngineContext>,
    workers: HashMap<Partition, WorkerHandle>,
    next_worker_id: u64,
    /// IDs of messages currently held by a worker.
    in_flight: HashSet<String>,
    /// Compiled state models by name.
    models: HashMap<String, Arc<StateModel>>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    publisher_tx: mpsc::Sender<PublishRequest>,
    publisher: JoinHandle<()>,
}

impl StateMachineEngine {
    /// Create a new instance, spawning its publisher. Worker notifications are sent on `events_tx`.
    pub fn new(ctx: Arc<EngineContext>, events_tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        metrics::register_counter!(METRIC_TRANSITIONS, metrics::Unit::Count, "the number of state transitions executed");
        metrics::register_counter!(METRIC_TRANSITION_FAILURES, metrics::Unit::Count, "the number of state transitions which failed");
        metrics::register_counter!(METRIC_STALE_MESSAGES, metrics::Unit::Count, "the number of stale transition messages discarded");
        metrics::register_gauge!(METRIC_PARTITIONS, metrics::Unit::Count, "the number of partitions hosted by this participant");
        let (publisher_tx, publisher_rx) = mpsc::channel(100);
        let publisher = CurrentStatePublisher {
            ctx: ctx.clone(),
            rx: publisher_rx,
            states: HashMap::new(),
        }
        .spawn();
        Self {
            ctx,
            workers: HashMap::new(),
            next_worker_id: 0,
            in_flight: HashSet::new(),
            models: HashMap::new(),
            events_tx,
            publisher_tx,
            publisher,
        }
    }

    /// Check if the given message is currently held by a worker.
    pub fn is_in_flight(&self, message_id: &str) -> bool {
        self.in_flight.contains(message_id)
    }

    /// Route the given message to the worker of its partition.
    ///
    /// Messages which can not be routed right now are left in the store to be picked up by a
    /// later scan.
    #[tracing::instrument(level = "debug", skip(self, message), fields(id = %message.id))]
    pub async fn dispatch(&mut self, message: Message) {
        if message.session_id != self.ctx.session_id {
            tracing::info!(session = %message.session_id, "discarding message addressed to another session");
            metrics::increment_counter!(METRIC_STALE_MESSAGES);
            self.ctx.delete_message(&message.id).await;
            return;
        }
        let partition = match message.partition() {
            Some(partition) if partition.resource == message.resource_name => partition,
            _ => {
                tracing::warn!(partition = %message.partition_name, "discarding message with malformed partition name");
                self.ctx.delete_message(&message.id).await;
                return;
            }
        };
        let model = match self.state_model(&message.state_model_def).await {
            Ok(model) => model,
            Err(err) => {
                tracing::error!(error = ?err, state_model = %message.state_model_def, "error loading state model, will retry");
                return;
            }
        };

        if !self.workers.contains_key(&partition) {
            let worker = self.spawn_worker(partition.clone());
            self.workers.insert(partition.clone(), worker);
            metrics::gauge!(METRIC_PARTITIONS, self.workers.len() as f64);
        }
        let worker = match self.workers.get(&partition) {
            Some(worker) => worker,
            None => return,
        };
        let id = message.id.clone();
        match worker.tx.try_send(Transition { message, model }) {
            Ok(()) => {
                self.in_flight.insert(id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(%partition, "partition worker busy, will retry");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(%partition, "partition worker stopped, will retry");
                self.workers.remove(&partition);
            }
        }
    }

    /// Handle a notification from a worker.
    pub fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Completed { message_id } => {
                self.in_flight.remove(&message_id);
            }
            WorkerEvent::Stopped { partition, worker_id } => {
                if self.workers.get(&partition).map(|worker| worker.id) == Some(worker_id) {
                    self.workers.remove(&partition);
                    metrics::gauge!(METRIC_PARTITIONS, self.workers.len() as f64);
                    tracing::debug!(%partition, "partition worker stopped");
                }
            }
        }
    }

    /// Stop all workers & the publisher, waiting for in-flight transitions to finish.
    pub async fn shutdown(self) {
        let Self { workers, publisher_tx, publisher, .. } = self;
        for (partition, worker) in workers {
            drop(worker.tx);
            if let Err(err) = worker.handle.await {
                tracing::error!(error = ?err, %partition, "error joining partition worker");
            }
        }
        drop(publisher_tx);
        if let Err(err) = publisher.await {
            tracing::error!(error = ?err, "error joining current state publisher");
        }
    }

    /// Get the compiled state model of the given name, loading it from the store if needed.
    async fn state_model(&mut self, name: &str) -> Result<Arc<StateModel>> {
        if let Some(model) = self.models.get(name) {
            return Ok(model.clone());
        }
        let def_path = path(PropertyType::StateModelDefs, &self.ctx.cluster, &[name]);
        let def: StateModelDefinition = read_record(self.ctx.store.as_ref(), &def_path)
            .await
            .context("error reading state model definition")?
            .ok_or_else(|| anyhow!("state model {} is not defined", name))?;
        let model = Arc::new(StateModel::compile(def)?);
        self.models.insert(name.into(), model.clone());
        Ok(model)
    }

    fn spawn_worker(&mut self, partition: Partition) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let handle = PartitionWorker {
            id,
            partition,
            state: UNINITIALIZED.into(),
            ctx: self.ctx.clone(),
            rx,
            events_tx: self.events_tx.clone(),
            publisher_tx: self.publisher_tx.clone(),
        }
        .spawn();
        WorkerHandle { id, tx, handle }
    }
}

/// The owner of the local state of a single partition replica.
struct PartitionWorker {
    id: u64,
    partition: Partition,
    /// The local state of the replica.
    state: String,
    ctx: Arc<EngineContext>,
    rx: mpsc::Receiver<Transition>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    publisher_tx: mpsc::Sender<PublishRequest>,
}

impl PartitionWorker {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(partition = %self.partition, "partition worker started");
        while let Some(transition) = self.rx.recv().await {
            let id = transition.message.id.clone();
            let dropped = self.handle_transition(transition).await;
            let _ = self.events_tx.send(WorkerEvent::Completed { message_id: id });
            if dropped {
                break;
            }
        }
        // Release anything queued behind the final transition, it is redelivered to a new worker.
        self.rx.close();
        while let Ok(transition) = self.rx.try_recv() {
            let _ = self.events_tx.send(WorkerEvent::Completed {
                message_id: transition.message.id,
            });
        }
        let _ = self.events_tx.send(WorkerEvent::Stopped {
            partition: self.partition.clone(),
            worker_id: self.id,
        });
    }

    /// Execute the given transition, returning `true` if the replica has been dropped.
    #[tracing::instrument(level = "debug", skip(self, transition), fields(partition = %self.partition, id = %transition.message.id))]
    async fn handle_transition(&mut self, transition: Transition) -> bool {
        let Transition { message, model } = transition;
        let local = model.normalize(&self.state).to_string();
        if model.normalize(&message.from_state) != local {
            tracing::info!(
                from = %message.from_state,
                to = %message.to_state,
                state = %local,
                "discarding stale transition message"
            );
            metrics::increment_counter!(METRIC_STALE_MESSAGES);
            self.ctx.delete_message(&message.id).await;
            return false;
        }

        let new_state = match self.execute(&message, &model, &local).await {
            Ok(()) => {
                metrics::increment_counter!(METRIC_TRANSITIONS);
                message.to_state.clone()
            }
            Err(err) => {
                tracing::error!(error = ?err, from = %local, to = %message.to_state, "state transition failed");
                metrics::increment_counter!(METRIC_TRANSITION_FAILURES);
                model.error_state().to_string()
            }
        };
        let dropped = new_state == model.dropped_state();

        let published = self
            .publish(PartitionUpdate {
                resource: message.resource_name.clone(),
                partition: message.partition_name.clone(),
                state_model_def: model.name().into(),
                state: if dropped { None } else { Some(new_state.clone()) },
            })
            .await;
        if let Err(err) = published {
            // The message stays queued and is redelivered with the unchanged local state.
            tracing::error!(error = ?err, "error publishing current state");
            return false;
        }
        tracing::debug!(from = %local, to = %new_state, "partition state changed");
        self.state = new_state;
        self.ctx.delete_message(&message.id).await;
        dropped
    }

    /// Invoke the handler of the given transition.
    async fn execute(&self, message: &Message, model: &StateModel, from: &str) -> Result<()> {
        let handler = match self.ctx.handlers.get(model.name(), from, &message.to_state) {
            Some(handler) => handler,
            None if from == model.error_state() && message.to_state == model.recovery_state() => return Ok(()),
            None => {
                return Err(anyhow!(
                    "no handler registered for transition {} of state model {}",
                    model.transition_name(from, &message.to_state),
                    model.name()
                ))
            }
        };
        match AssertUnwindSafe(handler.on_transition(message)).catch_unwind().await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("transition handler panicked")),
        }
    }

    async fn publish(&self, update: PartitionUpdate) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.publisher_tx
            .send(PublishRequest { update, tx })
            .await
            .map_err(|_| anyhow!("current state publisher has stopped"))?;
        rx.await.context("current state publisher dropped request")?.map_err(anyhow::Error::from)
    }
}

/// A change to the state of one partition.
#[derive(Debug)]
struct PartitionUpdate {
    resource: String,
    partition: String,
    state_model_def: String,
    /// The new state, or `None` if the partition has been dropped.
    state: Option<String>,
}

struct PublishRequest {
    update: PartitionUpdate,
    tx: oneshot::Sender<Result<(), StoreError>>,
}

/// The single writer of this session's current state records.
struct CurrentStatePublisher {
    ctx: Arc<EngineContext>,
    rx: mpsc::Receiver<PublishRequest>,
    /// The last published record of each resource.
    states: HashMap<String, CurrentState>,
}

impl CurrentStatePublisher {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(req) = self.rx.recv().await {
            let res = self.publish(req.update).await;
            let _ = req.tx.send(res);
        }
        tracing::debug!("current state publisher stopped");
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn publish(&mut self, update: PartitionUpdate) -> Result<(), StoreError> {
        let mut record = self.states.get(&update.resource).cloned().unwrap_or_else(|| CurrentState {
            resource: update.resource.clone(),
            session_id: self.ctx.session_id.clone(),
            state_model_def: update.state_model_def.clone(),
            partitions: Default::default(),
        });
        match &update.state {
            Some(state) => {
                record.partitions.insert(update.partition.clone(), state.clone());
            }
            None => {
                record.partitions.remove(&update.partition);
            }
        }

        let cs_path = path(
            PropertyType::CurrentStates,
            &self.ctx.cluster,
            &[&self.ctx.instance, &self.ctx.session_id, &update.resource],
        );
        if record.partitions.is_empty() {
            self.ctx.store.delete_recursive(&cs_path).await?;
            self.states.remove(&update.resource);
        } else {
            write_record(self.ctx.store.as_ref(), &cs_path, &record, CreateMode::Persistent).await?;
            self.states.insert(update.resource, record);
        }
        Ok(())
    }
}
