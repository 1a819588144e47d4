//! Test fixtures shared across the participant's test modules.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::handler::{HandlerRegistry, TransitionHandler};
use crate::participant::{Participant, ParticipantConfig};
use rudder_core::admin::ClusterAdmin;
use rudder_core::model::{CurrentState, Message, Partition, StateModelDefinition};
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{read_record, write_record, CreateMode, MemoryStore, MetadataStore, StoreSession};

pub const CLUSTER: &str = "test_cluster";

/// A transition handler which records every call, failing if so configured.
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransitionHandler for RecordingHandler {
    async fn on_transition(&self, message: &Message) -> Result<()> {
        self.calls.lock().unwrap().push((message.from_state.clone(), message.to_state.clone()));
        if self.fail {
            bail!("transition {}-{} failed", message.from_state, message.to_state);
        }
        Ok(())
    }
}

/// An in-memory cluster with the MasterSlave state model.
pub struct Cluster {
    pub store: MemoryStore,
    pub admin_session: Arc<StoreSession>,
    pub admin: ClusterAdmin,
}

impl Cluster {
    pub async fn new() -> Result<Self> {
        let store = MemoryStore::new();
        let admin_session = Arc::new(store.connect().await);
        let admin = ClusterAdmin::new(admin_session.clone(), CLUSTER);
        admin.setup_cluster().await?;
        admin.add_state_model_def(StateModelDefinition::master_slave()).await?;
        Ok(Self { store, admin_session, admin })
    }

    /// Start a participant for the given instance on a new session.
    pub async fn start_participant(&self, instance: &str, handlers: HandlerRegistry) -> (Arc<StoreSession>, broadcast::Sender<()>, JoinHandle<Result<()>>) {
        let session = Arc::new(self.store.connect().await);
        let (shutdown_tx, _) = broadcast::channel(1);
        let config = Arc::new(ParticipantConfig {
            cluster: CLUSTER.into(),
            instance: instance.into(),
            hostname: "localhost".into(),
            rescan_interval: Duration::from_millis(100),
        });
        let handle = Participant::new(config, session.clone(), handlers, &shutdown_tx).spawn();
        (session, shutdown_tx, handle)
    }

    /// Queue a transition message of partition `db_<index>` for the given instance session.
    pub async fn send(&self, instance: &str, session_id: &str, index: u32, from: &str, to: &str) -> Result<Message> {
        let message = Message::new_transition(&Partition::new("db", index), instance, session_id, "MasterSlave", from, to, "test");
        let msg_path = path(PropertyType::Messages, CLUSTER, &[instance, &message.id]);
        write_record(self.admin_session.as_ref(), &msg_path, &message, CreateMode::Persistent).await?;
        Ok(message)
    }

    /// Check if the given message is still queued.
    pub async fn is_queued(&self, message: &Message) -> Result<bool> {
        let msg_path = path(PropertyType::Messages, CLUSTER, &[&message.instance_name, &message.id]);
        Ok(self.admin_session.read(&msg_path).await?.is_some())
    }

    /// The current state of resource `db` reported by the given instance session.
    pub async fn current_state(&self, instance: &str, session_id: &str) -> Result<Option<CurrentState>> {
        let cs_path = path(PropertyType::CurrentStates, CLUSTER, &[instance, session_id, "db"]);
        Ok(read_record(self.admin_session.as_ref(), &cs_path).await?)
    }

    /// The reported state of partition `db_<index>` on the given instance session.
    pub async fn partition_state(&self, instance: &str, session_id: &str, index: u32) -> Result<Option<String>> {
        let state = self.current_state(instance, session_id).await?;
        Ok(state.and_then(|state| state.partitions.get(&format!("db_{}", index)).cloned()))
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
