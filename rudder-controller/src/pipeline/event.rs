use std::any::Any;
use std::collections::{BTreeSet, HashMap};

use rudder_core::paths::{classify, PropertyType};
use rudder_core::store::WatchEvent;

use crate::pipeline::StageError;

/// Well-known names of event attributes.
pub mod attrs {
    /// The `ClusterDataCache` of the run.
    pub const CLUSTER_DATA: &str = "ClusterDataCache";
    /// The resources to be managed in the run, as computed by the resource computation stage.
    pub const RESOURCES: &str = "RESOURCES";
    /// The merged current states of all live instances.
    pub const CURRENT_STATE: &str = "CURRENT_STATE";
    /// The best possible state of every replica.
    pub const BEST_POSSIBLE_STATE: &str = "BEST_POSSIBLE_STATE";
    /// All messages generated in the run.
    pub const MESSAGES_ALL: &str = "MESSAGES_ALL";
    /// The messages admitted for dispatch in the run.
    pub const MESSAGES_SELECTED: &str = "MESSAGES_SELECTED";
    /// The number of messages written to the store in the run.
    pub const MESSAGES_DISPATCHED: &str = "MESSAGES_DISPATCHED";
}

/// The trigger of a pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterEventType {
    /// This controller has just become the cluster leader.
    LeadershipAcquired,
    /// Cluster data has changed in the metadata store.
    DataChange,
    /// A periodic rebalance.
    PeriodicRebalance,
}

/// The subtrees of cluster data which have changed since the last run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// All cluster data must be re-read.
    pub full: bool,
    pub ideal_states: bool,
    pub live_instances: bool,
    pub instance_configs: bool,
    pub cluster_config: bool,
    pub state_model_defs: bool,
    /// Instances whose current states have changed.
    pub current_states: BTreeSet<String>,
    /// Instances whose messages have changed.
    pub messages: BTreeSet<String>,
}

impl ChangeSet {
    /// A change set requiring a full re-read of all cluster data.
    pub fn full() -> Self {
        Self { full: true, ..Default::default() }
    }

    /// Check if this change set names no changes at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Record the given store notification for the given cluster.
    pub fn record(&mut self, cluster: &str, event: &WatchEvent) {
        let (ty, keys) = match classify(cluster, &event.path) {
            Some(classified) => classified,
            None => {
                self.full = true;
                return;
            }
        };
        match ty {
            PropertyType::IdealStates => self.ideal_states = true,
            PropertyType::ClusterConfig => self.cluster_config = true,
            PropertyType::ParticipantConfigs => self.instance_configs = true,
            PropertyType::StateModelDefs => self.state_model_defs = true,
            PropertyType::LiveInstances => self.live_instances = true,
            PropertyType::CurrentStates => {
                if let Some(instance) = keys.into_iter().next() {
                    self.current_states.insert(instance);
                }
            }
            PropertyType::Messages => {
                if let Some(instance) = keys.into_iter().next() {
                    self.messages.insert(instance);
                }
            }
            // Written by controllers only, and tracked by the elector.
            PropertyType::Leader | PropertyType::Controller | PropertyType::ControllerMessages | PropertyType::ExternalView => (),
            PropertyType::Configs | PropertyType::Instances => self.full = true,
        }
    }
}

/// A transient pipeline trigger carrying the typed attributes exchanged between stages.
pub struct ClusterEvent {
    kind: ClusterEventType,
    changes: ChangeSet,
    attributes: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl ClusterEvent {
    pub fn new(kind: ClusterEventType, changes: ChangeSet) -> Self {
        Self {
            kind,
            changes,
            attributes: HashMap::new(),
        }
    }

    pub fn kind(&self) -> ClusterEventType {
        self.kind
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Set the named attribute, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: &'static str, value: T) {
        self.attributes.insert(name, Box::new(value));
    }

    /// Get a reference to the named attribute.
    pub fn get<T: Any>(&self, name: &'static str) -> Result<&T, StageError> {
        self.attributes
            .get(name)
            .and_then(|val| val.downcast_ref::<T>())
            .ok_or(StageError::MissingAttribute(name))
    }

    /// Get a mutable reference to the named attribute.
    pub fn get_mut<T: Any>(&mut self, name: &'static str) -> Result<&mut T, StageError> {
        self.attributes
            .get_mut(name)
            .and_then(|val| val.downcast_mut::<T>())
            .ok_or(StageError::MissingAttribute(name))
    }

    /// Remove the named attribute from this event.
    pub fn take<T: Any>(&mut self, name: &'static str) -> Option<T> {
        let val = self.attributes.remove(name)?;
        match val.downcast::<T>() {
            Ok(val) => Some(*val),
            Err(val) => {
                self.attributes.insert(name, val);
                None
            }
        }
    }
}
