use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::ClusterDataCache;
use crate::pipeline::{attrs, ClusterEvent, Stage, StageError};
use rudder_core::model::{Partition, StateModel};

/// A resource managed in a pipeline run.
#[derive(Clone, Debug)]
pub struct Resource {
    pub name: String,
    pub state_model: Arc<StateModel>,
    /// All partitions of the resource, from its ideal state and from reported current states.
    pub partitions: Vec<Partition>,
    /// False once the resource's ideal state has been removed; its replicas are being dropped.
    pub has_ideal_state: bool,
}

/// All resources of a run, keyed by name.
pub type ResourceMap = BTreeMap<String, Resource>;

/// Computes the set of resources and partitions to be managed in a run.
///
/// Resources with a current state but no ideal state are included so that their replicas are
/// dropped. Resources whose state model is unknown are skipped.
pub struct ResourceComputationStage;

#[async_trait]
impl Stage for ResourceComputationStage {
    fn name(&self) -> &'static str {
        "ResourceComputationStage"
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        let cache = event.get::<ClusterDataCache>(attrs::CLUSTER_DATA)?;
        let mut partitions: BTreeMap<String, (Arc<StateModel>, BTreeSet<Partition>, bool)> = BTreeMap::new();

        for (name, ideal) in cache.ideal_states() {
            let model = match cache.state_model(&ideal.state_model_def) {
                Some(model) => model,
                None => {
                    tracing::error!(resource = %name, state_model = %ideal.state_model_def, "state model of resource is not defined, skipping");
                    continue;
                }
            };
            let ideal_partitions = ideal.partitions().map_err(StageError::InvalidInput)?;
            partitions.insert(name.clone(), (model, ideal_partitions.into_iter().collect(), true));
        }

        for states in cache.current_states().values() {
            for (name, state) in states {
                if !partitions.contains_key(name) {
                    let model = match cache.state_model(&state.state_model_def) {
                        Some(model) => model,
                        None => {
                            tracing::error!(resource = %name, state_model = %state.state_model_def, "state model of current state is not defined, skipping");
                            continue;
                        }
                    };
                    partitions.insert(name.clone(), (model, BTreeSet::new(), false));
                }
                let entry = match partitions.get_mut(name) {
                    Some(entry) => entry,
                    None => continue,
                };
                for partition_name in state.partitions.keys() {
                    match Partition::parse(partition_name) {
                        Some(partition) if &partition.resource == name => {
                            entry.1.insert(partition);
                        }
                        _ => tracing::warn!(resource = %name, partition = %partition_name, "ignoring malformed partition in current state"),
                    }
                }
            }
        }

        let resources: ResourceMap = partitions
            .into_iter()
            .map(|(name, (state_model, partitions, has_ideal_state))| {
                let resource = Resource {
                    name: name.clone(),
                    state_model,
                    partitions: partitions.into_iter().collect(),
                    has_ideal_state,
                };
                (name, resource)
            })
            .collect();
        event.insert(attrs::RESOURCES, resources);
        Ok(())
    }
}
