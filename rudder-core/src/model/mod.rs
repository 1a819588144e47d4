//! Cluster data models.
//!
//! Every record is persisted in the metadata store as JSON with camelCase field names.

mod message;
mod records;
mod state_model;
#[cfg(test)]
mod state_model_test;

use std::fmt;

pub use message::{Message, MessageType};
pub use records::{ClusterConfig, CurrentState, ExternalView, IdealState, InstanceConfig, LeaderRecord, LiveInstance, TransitionLimit};
pub use state_model::{StateModel, StateModelDefinition, TieBreak, Transition, UNINITIALIZED};

/// A partition of a resource, named `<resource>_<index>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    pub resource: String,
    pub index: u32,
}

impl Partition {
    pub fn new(resource: impl Into<String>, index: u32) -> Self {
        Self { resource: resource.into(), index }
    }

    /// Parse a partition name of the form `<resource>_<index>`.
    ///
    /// Resource names may themselves contain underscores, only the last one separates the index.
    pub fn parse(name: &str) -> Option<Self> {
        let (resource, index) = name.rsplit_once('_')?;
        if resource.is_empty() {
            return None;
        }
        let index = index.parse().ok()?;
        Some(Self::new(resource, index))
    }

    /// The name of this partition.
    pub fn name(&self) -> String {
        format!("{}_{}", self.resource, self.index)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.resource, self.index)
    }
}
