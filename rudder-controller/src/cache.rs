//! Cluster data cache.
//!
//! An in-memory snapshot of all cluster metadata used by a single pipeline run. The cache is owned
//! by the controller's pipeline runner and threaded through each run as an event attribute. It
//! is refreshed at the start of every run, re-reading only the subtrees named by the run's
//! change set whenever that is safe.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::monitor::ResourceStatus;
use crate::pipeline::ChangeSet;
use rudder_core::model::{ClusterConfig, CurrentState, ExternalView, IdealState, InstanceConfig, LiveInstance, Message, StateModel, StateModelDefinition};
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{read_record, MetadataStore, StoreError, StoreResult, WatchSender};

/// A snapshot of cluster metadata.
pub struct ClusterDataCache {
    cluster: String,
    /// The channel on which watch notifications are delivered.
    watch_tx: WatchSender,
    /// All paths on which a watch has already been registered.
    watched: HashSet<String>,
    /// False until the next full refresh completes.
    initialized: bool,

    ideal_states: BTreeMap<String, IdealState>,
    live_instances: BTreeMap<String, LiveInstance>,
    instance_configs: BTreeMap<String, InstanceConfig>,
    cluster_config: ClusterConfig,
    state_models: BTreeMap<String, Arc<StateModel>>,
    /// Current states of the live session of each instance: `instance -> resource -> state`.
    current_states: BTreeMap<String, BTreeMap<String, CurrentState>>,
    /// Pending messages of each instance: `instance -> id -> message`.
    messages: BTreeMap<String, BTreeMap<String, Message>>,
    external_views: BTreeMap<String, ExternalView>,
    /// The last status reported to the monitor for each resource.
    resource_statuses: BTreeMap<String, ResourceStatus>,
}

impl ClusterDataCache {
    /// Create a new empty cache, registering watches on the given channel.
    pub fn new(cluster: impl Into<String>, watch_tx: WatchSender) -> Self {
        Self {
            cluster: cluster.into(),
            watch_tx,
            watched: HashSet::new(),
            initialized: false,
            ideal_states: BTreeMap::new(),
            live_instances: BTreeMap::new(),
            instance_configs: BTreeMap::new(),
            cluster_config: ClusterConfig::default(),
            state_models: BTreeMap::new(),
            current_states: BTreeMap::new(),
            messages: BTreeMap::new(),
            external_views: BTreeMap::new(),
            resource_statuses: BTreeMap::new(),
        }
    }

    /// Force a full refresh on the next call to `refresh`.
    pub fn invalidate(&mut self) {
        self.initialized = false;
    }

    /// Refresh this cache according to the given change set.
    #[tracing::instrument(level = "debug", skip(self, store, changes), fields(cluster = %self.cluster))]
    pub async fn refresh(&mut self, store: &dyn MetadataStore, changes: &ChangeSet) -> StoreResult<()> {
        let full = !self.initialized || changes.full;
        tracing::debug!(full, "refreshing cluster data cache");
        // Mark the cache for a full refresh until this one completes.
        self.initialized = false;

        if full || changes.state_model_defs {
            self.refresh_state_models(store).await?;
        }
        if full || changes.cluster_config {
            let cfg_path = path(PropertyType::ClusterConfig, &self.cluster, &[&self.cluster]);
            self.ensure_watch(store, &path(PropertyType::Configs, &self.cluster, &[])).await?;
            self.cluster_config = read_lenient::<ClusterConfig>(store, &cfg_path).await?.unwrap_or_default();
        }
        if full || changes.instance_configs {
            let root = path(PropertyType::ParticipantConfigs, &self.cluster, &[]);
            self.ensure_watch(store, &path(PropertyType::Configs, &self.cluster, &[])).await?;
            self.instance_configs = read_children(store, &root).await?;
        }
        if full || changes.ideal_states {
            let root = path(PropertyType::IdealStates, &self.cluster, &[]);
            self.ensure_watch(store, &root).await?;
            self.ideal_states = read_children(store, &root).await?;
        }

        let mut current_state_refresh: BTreeSet<String> = changes.current_states.clone();
        let mut message_refresh: BTreeSet<String> = changes.messages.clone();
        if full || changes.live_instances {
            let root = path(PropertyType::LiveInstances, &self.cluster, &[]);
            self.ensure_watch(store, &root).await?;
            let live: BTreeMap<String, LiveInstance> = read_children(store, &root).await?;
            for (instance, record) in live.iter() {
                let session_changed = self.live_instances.get(instance).map_or(true, |prev| prev.session_id != record.session_id);
                if full || session_changed {
                    current_state_refresh.insert(instance.clone());
                    message_refresh.insert(instance.clone());
                }
            }
            self.current_states.retain(|instance, _| live.contains_key(instance));
            self.messages.retain(|instance, _| live.contains_key(instance));
            self.live_instances = live;
        }
        for instance in current_state_refresh {
            self.refresh_current_states(store, &instance).await?;
        }
        for instance in message_refresh {
            self.refresh_messages(store, &instance).await?;
        }
        if full {
            let root = path(PropertyType::ExternalView, &self.cluster, &[]);
            self.external_views = read_children(store, &root).await?;
        }

        self.initialized = true;
        Ok(())
    }

    async fn refresh_state_models(&mut self, store: &dyn MetadataStore) -> StoreResult<()> {
        let root = path(PropertyType::StateModelDefs, &self.cluster, &[]);
        self.ensure_watch(store, &root).await?;
        let defs: BTreeMap<String, StateModelDefinition> = read_children(store, &root).await?;
        self.state_models = defs
            .into_iter()
            .filter_map(|(name, def)| match StateModel::compile(def) {
                Ok(model) => Some((name, Arc::new(model))),
                Err(err) => {
                    tracing::error!(error = ?err, state_model = %name, "invalid state model definition, ignoring");
                    None
                }
            })
            .collect();
        Ok(())
    }

    /// Re-read the current states of the live session of the given instance.
    async fn refresh_current_states(&mut self, store: &dyn MetadataStore, instance: &str) -> StoreResult<()> {
        let session = match self.live_instances.get(instance) {
            Some(live) => live.session_id.clone(),
            None => {
                self.current_states.remove(instance);
                return Ok(());
            }
        };
        self.ensure_watch(store, &path(PropertyType::CurrentStates, &self.cluster, &[instance])).await?;
        let root = path(PropertyType::CurrentStates, &self.cluster, &[instance, &session]);
        let states: BTreeMap<String, CurrentState> = read_children(store, &root).await?;
        let states = states.into_iter().filter(|(_, state)| state.session_id == session).collect();
        self.current_states.insert(instance.into(), states);
        Ok(())
    }

    /// Re-read the pending messages of the given instance.
    async fn refresh_messages(&mut self, store: &dyn MetadataStore, instance: &str) -> StoreResult<()> {
        if !self.live_instances.contains_key(instance) {
            self.messages.remove(instance);
            return Ok(());
        }
        let root = path(PropertyType::Messages, &self.cluster, &[instance]);
        self.ensure_watch(store, &root).await?;
        let messages = read_children(store, &root).await?;
        self.messages.insert(instance.into(), messages);
        Ok(())
    }

    /// Register a watch on the given subtree, unless one is already registered.
    async fn ensure_watch(&mut self, store: &dyn MetadataStore, root: &str) -> StoreResult<()> {
        if self.watched.contains(root) {
            return Ok(());
        }
        store.watch(root, self.watch_tx.clone()).await?;
        self.watched.insert(root.into());
        Ok(())
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn ideal_states(&self) -> &BTreeMap<String, IdealState> {
        &self.ideal_states
    }

    pub fn live_instances(&self) -> &BTreeMap<String, LiveInstance> {
        &self.live_instances
    }

    pub fn is_live(&self, instance: &str) -> bool {
        self.live_instances.contains_key(instance)
    }

    pub fn instance_configs(&self) -> &BTreeMap<String, InstanceConfig> {
        &self.instance_configs
    }

    /// Check if the given partition may be brought up on the given instance.
    ///
    /// Instances without a config are treated as enabled.
    pub fn is_partition_enabled(&self, instance: &str, partition: &str) -> bool {
        self.instance_configs
            .get(instance)
            .map_or(true, |cfg| cfg.is_partition_enabled(partition))
    }

    pub fn cluster_config(&self) -> &ClusterConfig {
        &self.cluster_config
    }

    pub fn state_model(&self, name: &str) -> Option<Arc<StateModel>> {
        self.state_models.get(name).cloned()
    }

    pub fn current_states(&self) -> &BTreeMap<String, BTreeMap<String, CurrentState>> {
        &self.current_states
    }

    pub fn messages(&self) -> &BTreeMap<String, BTreeMap<String, Message>> {
        &self.messages
    }

    pub fn external_view(&self, resource: &str) -> Option<&ExternalView> {
        self.external_views.get(resource)
    }

    pub fn external_views(&self) -> &BTreeMap<String, ExternalView> {
        &self.external_views
    }

    /// Record a message which has been written to the message queue of its instance.
    pub fn record_message(&mut self, message: Message) {
        self.messages
            .entry(message.instance_name.clone())
            .or_default()
            .insert(message.id.clone(), message);
    }

    /// Record an external view which has been written to the store.
    pub fn set_external_view(&mut self, view: ExternalView) {
        self.external_views.insert(view.resource.clone(), view);
    }

    /// Forget an external view which has been removed from the store.
    pub fn remove_external_view(&mut self, resource: &str) {
        self.external_views.remove(resource);
        self.resource_statuses.remove(resource);
    }

    pub fn resource_status(&self, resource: &str) -> Option<&ResourceStatus> {
        self.resource_statuses.get(resource)
    }

    /// Record a resource status which has been reported to the monitor.
    pub fn set_resource_status(&mut self, status: ResourceStatus) {
        self.resource_statuses.insert(status.resource.clone(), status);
    }
}

/// Read a record, treating an undecodable record as absent.
async fn read_lenient<T: DeserializeOwned>(store: &dyn MetadataStore, path: &str) -> StoreResult<Option<T>> {
    match read_record(store, path).await {
        Err(StoreError::InvalidRecord { path, source }) => {
            tracing::warn!(error = ?source, %path, "ignoring undecodable record");
            Ok(None)
        }
        res => res,
    }
}

/// Read every child record of the given path, keyed by child name.
async fn read_children<T: DeserializeOwned>(store: &dyn MetadataStore, root: &str) -> StoreResult<BTreeMap<String, T>> {
    let mut records = BTreeMap::new();
    for child in store.children(root).await? {
        let child_path = format!("{}/{}", root, child);
        if let Some(record) = read_lenient(store, &child_path).await? {
            records.insert(child, record);
        }
    }
    Ok(records)
}
