//! Cluster administration.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::model::{ClusterConfig, ExternalView, IdealState, InstanceConfig, StateModel, StateModelDefinition};
use crate::paths::{path, PropertyType};
use crate::store::{create_record, read_record, write_record, CreateMode, MetadataStore};

/// Administrative operations over the metadata of a cluster.
#[derive(Clone)]
pub struct ClusterAdmin {
    store: Arc<dyn MetadataStore>,
    cluster: String,
}

impl ClusterAdmin {
    pub fn new(store: Arc<dyn MetadataStore>, cluster: impl Into<String>) -> Self {
        Self { store, cluster: cluster.into() }
    }

    /// Create the base configuration of the cluster, if it does not already exist.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.cluster))]
    pub async fn setup_cluster(&self) -> Result<()> {
        let cfg_path = path(PropertyType::ClusterConfig, &self.cluster, &[&self.cluster]);
        let created = create_record(self.store.as_ref(), &cfg_path, &ClusterConfig::default(), CreateMode::Persistent)
            .await
            .context("error creating cluster config")?;
        if created {
            tracing::info!(cluster = %self.cluster, "cluster created");
        }
        Ok(())
    }

    /// Validate and store the given state model definition.
    pub async fn add_state_model_def(&self, def: StateModelDefinition) -> Result<()> {
        let model = StateModel::compile(def).context("invalid state model definition")?;
        let def_path = path(PropertyType::StateModelDefs, &self.cluster, &[model.name()]);
        write_record(self.store.as_ref(), &def_path, model.definition(), CreateMode::Persistent)
            .await
            .with_context(|| format!("error storing state model definition {}", model.name()))
    }

    /// Register a new instance with the cluster, returning `false` if it already exists.
    pub async fn add_instance(&self, instance: &str) -> Result<bool> {
        let cfg_path = path(PropertyType::ParticipantConfigs, &self.cluster, &[instance]);
        create_record(self.store.as_ref(), &cfg_path, &InstanceConfig::new(instance), CreateMode::Persistent)
            .await
            .with_context(|| format!("error adding instance {}", instance))
    }

    /// List the names of all registered instances.
    pub async fn list_instances(&self) -> Result<Vec<String>> {
        let cfgs_path = path(PropertyType::ParticipantConfigs, &self.cluster, &[]);
        self.store.children(&cfgs_path).await.context("error listing instances")
    }

    /// Enable or disable all partitions of an instance.
    pub async fn enable_instance(&self, instance: &str, enabled: bool) -> Result<()> {
        self.update_instance_config(instance, |cfg| cfg.enabled = enabled).await
    }

    /// Enable or disable a single partition on an instance.
    pub async fn enable_partition(&self, instance: &str, partition: &str, enabled: bool) -> Result<()> {
        self.update_instance_config(instance, |cfg| {
            if enabled {
                cfg.disabled_partitions.remove(partition);
            } else {
                cfg.disabled_partitions.insert(partition.to_string());
            }
        })
        .await
    }

    async fn update_instance_config(&self, instance: &str, f: impl FnOnce(&mut InstanceConfig) + Send) -> Result<()> {
        let cfg_path = path(PropertyType::ParticipantConfigs, &self.cluster, &[instance]);
        let mut cfg: InstanceConfig = match read_record(self.store.as_ref(), &cfg_path)
            .await
            .with_context(|| format!("error reading config of instance {}", instance))?
        {
            Some(cfg) => cfg,
            None => bail!("instance {} is not registered with cluster {}", instance, self.cluster),
        };
        f(&mut cfg);
        write_record(self.store.as_ref(), &cfg_path, &cfg, CreateMode::Persistent)
            .await
            .with_context(|| format!("error writing config of instance {}", instance))
    }

    /// Set the desired assignment of a resource.
    pub async fn set_ideal_state(&self, ideal: &IdealState) -> Result<()> {
        if ideal.resource.is_empty() {
            bail!("resource name must not be empty");
        }
        if let Err(err) = ideal.partitions() {
            bail!("invalid ideal state: {}", err);
        }
        let def_path = path(PropertyType::StateModelDefs, &self.cluster, &[&ideal.state_model_def]);
        let def: Option<StateModelDefinition> = read_record(self.store.as_ref(), &def_path)
            .await
            .context("error reading state model definition")?;
        let model = match def {
            Some(def) => StateModel::compile(def)?,
            None => bail!("state model {} is not defined in cluster {}", ideal.state_model_def, self.cluster),
        };
        for (partition, assignment) in ideal.partitions.iter() {
            if let Some((instance, state)) = assignment.iter().find(|(_, state)| model.state_priority(state).is_none()) {
                bail!("partition {} assigns undeclared state {} to instance {}", partition, state, instance);
            }
        }
        let ideal_path = path(PropertyType::IdealStates, &self.cluster, &[&ideal.resource]);
        write_record(self.store.as_ref(), &ideal_path, ideal, CreateMode::Persistent)
            .await
            .with_context(|| format!("error writing ideal state of resource {}", ideal.resource))
    }

    /// Remove a resource; its replicas are subsequently dropped by the controller.
    pub async fn drop_resource(&self, resource: &str) -> Result<()> {
        let ideal_path = path(PropertyType::IdealStates, &self.cluster, &[resource]);
        self.store
            .delete_recursive(&ideal_path)
            .await
            .with_context(|| format!("error dropping resource {}", resource))
    }

    /// Replace the cluster config.
    pub async fn set_cluster_config(&self, config: &ClusterConfig) -> Result<()> {
        let cfg_path = path(PropertyType::ClusterConfig, &self.cluster, &[&self.cluster]);
        write_record(self.store.as_ref(), &cfg_path, config, CreateMode::Persistent)
            .await
            .context("error writing cluster config")
    }

    /// Read the external view of a resource.
    pub async fn get_external_view(&self, resource: &str) -> Result<Option<ExternalView>> {
        let view_path = path(PropertyType::ExternalView, &self.cluster, &[resource]);
        read_record(self.store.as_ref(), &view_path)
            .await
            .with_context(|| format!("error reading external view of resource {}", resource))
    }
}
