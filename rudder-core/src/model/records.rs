use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::Partition;

/// The desired assignment of a resource: `partition -> instance -> state`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdealState {
    pub resource: String,
    pub state_model_def: String,
    #[serde(default)]
    pub num_partitions: u32,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub partitions: BTreeMap<String, BTreeMap<String, String>>,
}

impl IdealState {
    /// All partitions of this resource in index order.
    ///
    /// Includes every index below `num_partitions` as well as every partition carrying an
    /// explicit assignment. Assigned partition names which do not belong to this resource are
    /// returned as errors.
    pub fn partitions(&self) -> Result<Vec<Partition>, String> {
        let mut partitions: BTreeSet<Partition> = (0..self.num_partitions).map(|idx| Partition::new(&self.resource, idx)).collect();
        for name in self.partitions.keys() {
            match Partition::parse(name) {
                Some(partition) if partition.resource == self.resource => {
                    partitions.insert(partition);
                }
                _ => return Err(format!("partition {} does not belong to resource {}", name, self.resource)),
            }
        }
        Ok(partitions.into_iter().collect())
    }

    /// The desired `instance -> state` mapping of the given partition.
    pub fn instance_state_map(&self, partition: &str) -> Option<&BTreeMap<String, String>> {
        self.partitions.get(partition)
    }
}

/// The states of the partitions of one resource as reported by one instance session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    pub resource: String,
    pub session_id: String,
    pub state_model_def: String,
    #[serde(default)]
    pub partitions: BTreeMap<String, String>,
}

/// The ephemeral liveness record of a participant session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveInstance {
    pub instance: String,
    pub session_id: String,
    #[serde(default)]
    pub hostname: String,
}

fn default_enabled() -> bool {
    true
}

/// Per-instance configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub instance: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub disabled_partitions: BTreeSet<String>,
}

impl InstanceConfig {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            enabled: true,
            disabled_partitions: Default::default(),
        }
    }

    /// Check if the given partition may be brought up on this instance.
    pub fn is_partition_enabled(&self, partition: &str) -> bool {
        self.enabled && !self.disabled_partitions.contains(partition)
    }
}

/// A limit on the number of concurrent transitions into a state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionLimit {
    /// The resource this limit applies to, or every resource when absent.
    #[serde(default)]
    pub resource: Option<String>,
    /// The target state being limited.
    pub state: String,
    /// The maximum number of outstanding transitions into `state`.
    pub max: usize,
}

impl TransitionLimit {
    pub fn applies_to(&self, resource: &str, state: &str) -> bool {
        self.state == state && self.resource.as_deref().map_or(true, |res| res == resource)
    }
}

/// Cluster-wide configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub transition_limits: Vec<TransitionLimit>,
    #[serde(default)]
    pub max_transitions_per_instance: Option<usize>,
}

/// The aggregated current states of a resource: `partition -> instance -> state`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalView {
    pub resource: String,
    #[serde(default)]
    pub partitions: BTreeMap<String, BTreeMap<String, String>>,
}

/// The content of the ephemeral leader node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderRecord {
    pub identity: String,
    pub session_id: String,
    pub acquired_at: i64,
}
