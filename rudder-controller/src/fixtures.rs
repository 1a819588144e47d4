//! Test fixtures shared across the controller's test modules.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::sync::{mpsc, watch};

use crate::cache::ClusterDataCache;
use crate::election::LeaderState;
use crate::monitor::{ClusterStatus, ResourceStatus, StatusMonitor};
use crate::pipeline::{attrs, ChangeSet, ClusterEvent, ClusterEventType, Pipeline, StageContext, StageError};
use crate::stages::default_pipeline;
use rudder_core::admin::ClusterAdmin;
use rudder_core::model::{CurrentState, IdealState, LiveInstance, Message, StateModelDefinition};
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{read_record, write_record, CreateMode, MemoryStore, MetadataStore, StoreSession, WatchEvent};

pub const CLUSTER: &str = "test_cluster";

/// A status monitor which records every update.
#[derive(Default)]
pub struct RecordingMonitor {
    pub cluster: Mutex<Vec<ClusterStatus>>,
    pub resources: Mutex<Vec<ResourceStatus>>,
    pub removed: Mutex<Vec<String>>,
}

impl StatusMonitor for RecordingMonitor {
    fn cluster_status(&self, status: &ClusterStatus) {
        self.cluster.lock().unwrap().push(status.clone());
    }

    fn external_view_updated(&self, status: &ResourceStatus) {
        self.resources.lock().unwrap().push(status.clone());
    }

    fn resource_removed(&self, resource: &str) {
        self.removed.lock().unwrap().push(resource.to_string());
    }
}

/// A pipeline bound to a leading controller session over an in-memory store.
pub struct PipelineFixture {
    pub store: MemoryStore,
    pub session: Arc<dyn MetadataStore>,
    pub admin: ClusterAdmin,
    pub leader_tx: watch::Sender<LeaderState>,
    pub monitor: Arc<RecordingMonitor>,
    pipeline: Pipeline,
    cache: Option<ClusterDataCache>,
    events_rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl PipelineFixture {
    /// Create a cluster with the MasterSlave state model & a pipeline leading it.
    pub async fn new() -> Result<Self> {
        Self::with_pipeline(default_pipeline(vec![])).await
    }

    pub async fn with_pipeline(mut pipeline: Pipeline) -> Result<Self> {
        let store = MemoryStore::new();
        let session: Arc<dyn MetadataStore> = Arc::new(store.connect().await);
        let admin = ClusterAdmin::new(session.clone(), CLUSTER);
        admin.setup_cluster().await?;
        admin.add_state_model_def(StateModelDefinition::master_slave()).await?;

        let (leader_tx, leader_rx) = watch::channel(LeaderState::Leading);
        let monitor = Arc::new(RecordingMonitor::default());
        let ctx = StageContext {
            cluster: Arc::new(CLUSTER.into()),
            identity: Arc::new("controller-0".into()),
            store: session.clone(),
            leader_state: leader_rx,
            monitor: monitor.clone(),
        };
        pipeline.init(&ctx);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            store,
            session,
            admin,
            leader_tx,
            monitor,
            pipeline,
            cache: Some(ClusterDataCache::new(CLUSTER, events_tx)),
            events_rx,
        })
    }

    /// Register and bring up a participant session for the given instance.
    pub async fn join(&self, instance: &str) -> Result<SimParticipant> {
        self.admin.add_instance(instance).await?;
        SimParticipant::join(&self.store, instance).await
    }

    /// Run the pipeline once over a full refresh of cluster data, returning the event.
    pub async fn run(&mut self) -> (ClusterEvent, Result<(), StageError>) {
        self.run_with(ClusterEventType::DataChange, ChangeSet::full()).await
    }

    /// Run the pipeline once for the given event, returning the event.
    pub async fn run_with(&mut self, kind: ClusterEventType, changes: ChangeSet) -> (ClusterEvent, Result<(), StageError>) {
        let mut event = ClusterEvent::new(kind, changes);
        if let Some(cache) = self.cache.take() {
            event.insert(attrs::CLUSTER_DATA, cache);
        }
        let res = self.pipeline.handle(&mut event).await;
        self.cache = event.take(attrs::CLUSTER_DATA);
        (event, res)
    }

    /// Run the pipeline once over a full refresh, returning the number of dispatched messages.
    pub async fn run_dispatched(&mut self) -> Result<usize> {
        self.run_dispatched_with(ClusterEventType::DataChange, ChangeSet::full()).await
    }

    /// Run the pipeline once for the given event, returning the number of dispatched messages.
    pub async fn run_dispatched_with(&mut self, kind: ClusterEventType, changes: ChangeSet) -> Result<usize> {
        let (event, res) = self.run_with(kind, changes).await;
        res?;
        Ok(*event.get::<usize>(attrs::MESSAGES_DISPATCHED)?)
    }

    /// Drain all watch notifications delivered so far into a change set.
    pub fn pending_changes(&mut self) -> ChangeSet {
        let mut changes = ChangeSet::default();
        while let Ok(event) = self.events_rx.try_recv() {
            changes.record(CLUSTER, &event);
        }
        changes
    }

    /// The cluster data cache as of the last run.
    pub fn cache(&self) -> Option<&ClusterDataCache> {
        self.cache.as_ref()
    }
}

/// A participant which applies transition messages directly to its current state.
pub struct SimParticipant {
    pub instance: String,
    pub session: StoreSession,
}

impl SimParticipant {
    /// Connect a new session & publish its live instance record.
    pub async fn join(store: &MemoryStore, instance: &str) -> Result<Self> {
        let session = store.connect().await;
        let live = LiveInstance {
            instance: instance.into(),
            session_id: session.session_id().into(),
            hostname: "localhost".into(),
        };
        let live_path = path(PropertyType::LiveInstances, CLUSTER, &[instance]);
        write_record(&session, &live_path, &live, CreateMode::Ephemeral).await?;
        Ok(Self {
            instance: instance.into(),
            session,
        })
    }

    /// The transition messages currently queued for this instance.
    pub async fn messages(&self) -> Result<Vec<Message>> {
        let root = path(PropertyType::Messages, CLUSTER, &[&self.instance]);
        let mut messages = vec![];
        for id in self.session.children(&root).await? {
            let msg_path = path(PropertyType::Messages, CLUSTER, &[&self.instance, &id]);
            if let Some(msg) = read_record(&self.session, &msg_path).await? {
                messages.push(msg);
            }
        }
        Ok(messages)
    }

    /// Apply every queued message, returning the number applied.
    pub async fn execute_all(&self) -> Result<usize> {
        let messages = self.messages().await?;
        for msg in messages.iter() {
            let state = if msg.to_state == "DROPPED" { None } else { Some(msg.to_state.as_str()) };
            self.set_state(&msg.resource_name, &msg.partition_name, &msg.state_model_def, state).await?;
            let msg_path = path(PropertyType::Messages, CLUSTER, &[&self.instance, &msg.id]);
            self.session.delete_recursive(&msg_path).await?;
        }
        Ok(messages.len())
    }

    /// Report the state of a partition, removing it when `state` is `None`.
    pub async fn set_state(&self, resource: &str, partition: &str, state_model_def: &str, state: Option<&str>) -> Result<()> {
        let cs_path = path(PropertyType::CurrentStates, CLUSTER, &[&self.instance, self.session.session_id(), resource]);
        let mut current: CurrentState = read_record(&self.session, &cs_path).await?.unwrap_or_else(|| CurrentState {
            resource: resource.into(),
            session_id: self.session.session_id().into(),
            state_model_def: state_model_def.into(),
            partitions: Default::default(),
        });
        match state {
            Some(state) => {
                current.partitions.insert(partition.into(), state.into());
            }
            None => {
                current.partitions.remove(partition);
            }
        }
        write_record(&self.session, &cs_path, &current, CreateMode::Persistent).await?;
        Ok(())
    }
}

/// A single partition MasterSlave ideal state from the given `(instance, state)` pairs.
pub fn ideal_state(resource: &str, assignments: &[(&str, &str)]) -> IdealState {
    let partition = format!("{}_0", resource);
    IdealState {
        resource: resource.into(),
        state_model_def: "MasterSlave".into(),
        num_partitions: 1,
        replicas: assignments.len() as u32,
        partitions: std::iter::once((
            partition,
            assignments.iter().map(|(instance, state)| (instance.to_string(), state.to_string())).collect(),
        ))
        .collect(),
    }
}

/// Poll the given check until it passes, failing after a few seconds.
pub async fn eventually<F, Fut>(mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await? {
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("condition not met within deadline");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
