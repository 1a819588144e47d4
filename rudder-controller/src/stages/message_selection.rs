//! Admission control of generated messages.
//!
//! Messages are considered in a deterministic order (resource, partition index, instance) and a
//! message is admitted only if every admission policy accepts it. Policies see the outstanding
//! messages of prior runs as well as the messages admitted so far in the current run. Rejected
//! messages are simply not dispatched, they are generated again by a later run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::ClusterDataCache;
use crate::pipeline::{attrs, ClusterEvent, Stage, StageError};
use crate::stages::{CurrentStateOutput, MessageGenerationOutput, ResourceMap};
use rudder_core::model::{Message, Partition, StateModel, TransitionLimit};

/// A predicate deciding if a message may be dispatched.
pub trait AdmissionPolicy: Send + Sync {
    /// The name of this policy, used in logs.
    fn name(&self) -> &'static str;

    /// Check if the given message may be admitted given the currently outstanding messages.
    fn can_admit(&self, message: &Message, outstanding: &OutstandingCounts) -> bool;
}

/// Counts of outstanding transitions, and of replicas per state.
#[derive(Clone, Debug, Default)]
pub struct OutstandingCounts {
    /// Replicas with an outstanding message.
    replicas: HashSet<(Partition, String)>,
    /// Outstanding transitions by `(resource, target state)`.
    by_resource_state: HashMap<(String, String), usize>,
    /// Outstanding transitions by target state across all resources.
    by_state: HashMap<String, usize>,
    /// Outstanding transitions by instance.
    by_instance: HashMap<String, usize>,
    /// Replicas of a partition in a state, or with an outstanding transition into it.
    in_state: HashMap<(Partition, String), usize>,
}

impl OutstandingCounts {
    /// Build the counts of the given current state output, including its pending messages.
    pub fn from_current(current: &CurrentStateOutput) -> Self {
        let mut counts = Self::default();
        for (partition, _, state) in current.replicas() {
            *counts.in_state.entry((partition.clone(), state.to_string())).or_default() += 1;
        }
        for message in current.pending_messages() {
            counts.admit(message);
        }
        counts
    }

    /// Record the given message as outstanding.
    pub fn admit(&mut self, message: &Message) {
        let partition = match message.partition() {
            Some(partition) => partition,
            None => return,
        };
        self.replicas.insert((partition.clone(), message.instance_name.clone()));
        *self
            .by_resource_state
            .entry((message.resource_name.clone(), message.to_state.clone()))
            .or_default() += 1;
        *self.by_state.entry(message.to_state.clone()).or_default() += 1;
        *self.by_instance.entry(message.instance_name.clone()).or_default() += 1;
        *self.in_state.entry((partition, message.to_state.clone())).or_default() += 1;
    }

    /// Check if the given replica has an outstanding message.
    pub fn has_outstanding(&self, partition: &Partition, instance: &str) -> bool {
        self.replicas.contains(&(partition.clone(), instance.to_string()))
    }

    /// The number of outstanding transitions into the given state, for the given resource or
    /// across all resources.
    pub fn into_state(&self, resource: Option<&str>, state: &str) -> usize {
        match resource {
            Some(resource) => self
                .by_resource_state
                .get(&(resource.to_string(), state.to_string()))
                .copied()
                .unwrap_or(0),
            None => self.by_state.get(state).copied().unwrap_or(0),
        }
    }

    /// The number of outstanding transitions on the given instance.
    pub fn for_instance(&self, instance: &str) -> usize {
        self.by_instance.get(instance).copied().unwrap_or(0)
    }

    /// The number of replicas of the given partition in the given state, or with an outstanding
    /// transition into it.
    pub fn replicas_in_state(&self, partition: &Partition, state: &str) -> usize {
        self.in_state.get(&(partition.clone(), state.to_string())).copied().unwrap_or(0)
    }
}

/// Allows at most one outstanding message per replica.
pub struct OneOutstandingPerReplica;

impl AdmissionPolicy for OneOutstandingPerReplica {
    fn name(&self) -> &'static str {
        "OneOutstandingPerReplica"
    }

    fn can_admit(&self, message: &Message, outstanding: &OutstandingCounts) -> bool {
        match message.partition() {
            Some(partition) => !outstanding.has_outstanding(&partition, &message.instance_name),
            None => false,
        }
    }
}

/// Bounds the number of concurrent transitions into a state.
pub struct TransitionLimitPolicy {
    limits: Vec<TransitionLimit>,
}

impl TransitionLimitPolicy {
    pub fn new(limits: Vec<TransitionLimit>) -> Self {
        Self { limits }
    }
}

impl AdmissionPolicy for TransitionLimitPolicy {
    fn name(&self) -> &'static str {
        "TransitionLimitPolicy"
    }

    fn can_admit(&self, message: &Message, outstanding: &OutstandingCounts) -> bool {
        self.limits
            .iter()
            .filter(|limit| limit.applies_to(&message.resource_name, &message.to_state))
            .all(|limit| outstanding.into_state(limit.resource.as_deref(), &limit.state) < limit.max)
    }
}

/// Bounds the number of concurrent transitions on a single instance.
pub struct InstanceLimitPolicy {
    max: usize,
}

impl InstanceLimitPolicy {
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl AdmissionPolicy for InstanceLimitPolicy {
    fn name(&self) -> &'static str {
        "InstanceLimitPolicy"
    }

    fn can_admit(&self, message: &Message, outstanding: &OutstandingCounts) -> bool {
        outstanding.for_instance(&message.instance_name) < self.max
    }
}

/// Enforces the per-partition upper bounds of state models while replicas hand over a state.
pub struct UpperBoundPolicy {
    /// The state model of each resource.
    models: BTreeMap<String, Arc<StateModel>>,
}

impl UpperBoundPolicy {
    pub fn new(models: BTreeMap<String, Arc<StateModel>>) -> Self {
        Self { models }
    }
}

impl AdmissionPolicy for UpperBoundPolicy {
    fn name(&self) -> &'static str {
        "UpperBoundPolicy"
    }

    fn can_admit(&self, message: &Message, outstanding: &OutstandingCounts) -> bool {
        let bound = match self.models.get(&message.resource_name).and_then(|model| model.upper_bound(&message.to_state)) {
            Some(bound) => bound as usize,
            None => return true,
        };
        match message.partition() {
            Some(partition) => outstanding.replicas_in_state(&partition, &message.to_state) < bound,
            None => false,
        }
    }
}

/// Selects the generated messages which may be dispatched in this run.
pub struct MessageSelectionStage {
    /// Policies applied in addition to the built-in policies.
    policies: Vec<Arc<dyn AdmissionPolicy>>,
}

impl MessageSelectionStage {
    pub fn new(policies: Vec<Arc<dyn AdmissionPolicy>>) -> Self {
        Self { policies }
    }

    /// The built-in policies for the given cluster data.
    fn builtin_policies(cache: &ClusterDataCache, resources: &ResourceMap) -> Vec<Arc<dyn AdmissionPolicy>> {
        let config = cache.cluster_config();
        let mut policies: Vec<Arc<dyn AdmissionPolicy>> = vec![
            Arc::new(OneOutstandingPerReplica),
            Arc::new(TransitionLimitPolicy::new(config.transition_limits.clone())),
            Arc::new(UpperBoundPolicy::new(
                resources
                    .iter()
                    .map(|(name, resource)| (name.clone(), resource.state_model.clone()))
                    .collect(),
            )),
        ];
        if let Some(max) = config.max_transitions_per_instance {
            policies.push(Arc::new(InstanceLimitPolicy::new(max)));
        }
        policies
    }
}

#[async_trait]
impl Stage for MessageSelectionStage {
    fn name(&self) -> &'static str {
        "MessageSelectionStage"
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        let cache = event.get::<ClusterDataCache>(attrs::CLUSTER_DATA)?;
        let resources = event.get::<ResourceMap>(attrs::RESOURCES)?;
        let current = event.get::<CurrentStateOutput>(attrs::CURRENT_STATE)?;
        let generated = event.get::<MessageGenerationOutput>(attrs::MESSAGES_ALL)?;

        let mut policies = Self::builtin_policies(cache, resources);
        policies.extend(self.policies.iter().cloned());
        let mut outstanding = OutstandingCounts::from_current(current);
        let mut selected: Vec<Message> = vec![];
        for message in generated.iter() {
            match policies.iter().find(|policy| !policy.can_admit(message, &outstanding)) {
                Some(policy) => tracing::debug!(
                    policy = policy.name(),
                    partition = %message.partition_name,
                    instance = %message.instance_name,
                    from = %message.from_state,
                    to = %message.to_state,
                    "transition withheld"
                ),
                None => {
                    outstanding.admit(message);
                    selected.push(message.clone());
                }
            }
        }

        tracing::debug!(generated = generated.len(), selected = selected.len(), "messages selected");
        event.insert(attrs::MESSAGES_SELECTED, selected);
        Ok(())
    }
}
