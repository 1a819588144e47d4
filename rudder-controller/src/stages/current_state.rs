use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::cache::ClusterDataCache;
use crate::pipeline::{attrs, ClusterEvent, Stage, StageError};
use crate::stages::ResourceMap;
use rudder_core::model::{Message, Partition};

/// The merged current states and pending messages of all live instances.
#[derive(Clone, Debug, Default)]
pub struct CurrentStateOutput {
    /// `partition -> instance -> state`.
    states: BTreeMap<Partition, BTreeMap<String, String>>,
    /// `partition -> instance -> message`.
    pending: BTreeMap<Partition, BTreeMap<String, Message>>,
}

impl CurrentStateOutput {
    pub fn set_state(&mut self, partition: Partition, instance: impl Into<String>, state: impl Into<String>) {
        self.states.entry(partition).or_default().insert(instance.into(), state.into());
    }

    /// Record a pending message, keeping the first message seen for a replica.
    pub fn set_pending(&mut self, partition: Partition, message: Message) {
        self.pending
            .entry(partition)
            .or_default()
            .entry(message.instance_name.clone())
            .or_insert(message);
    }

    /// The reported state of the given replica.
    pub fn state(&self, partition: &Partition, instance: &str) -> Option<&str> {
        self.states.get(partition)?.get(instance).map(String::as_str)
    }

    /// The reported `instance -> state` mapping of the given partition.
    pub fn instance_states(&self, partition: &Partition) -> Option<&BTreeMap<String, String>> {
        self.states.get(partition)
    }

    /// The pending message of the given replica.
    pub fn pending(&self, partition: &Partition, instance: &str) -> Option<&Message> {
        self.pending.get(partition)?.get(instance)
    }

    /// All replicas with a reported state, as `(partition, instance, state)`.
    pub fn replicas(&self) -> impl Iterator<Item = (&Partition, &str, &str)> {
        self.states
            .iter()
            .flat_map(|(partition, states)| states.iter().map(move |(instance, state)| (partition, instance.as_str(), state.as_str())))
    }

    /// All pending messages.
    pub fn pending_messages(&self) -> impl Iterator<Item = &Message> {
        self.pending.values().flat_map(|messages| messages.values())
    }
}

/// Merges the current states and pending messages reported by live instances.
pub struct CurrentStateComputationStage;

#[async_trait]
impl Stage for CurrentStateComputationStage {
    fn name(&self) -> &'static str {
        "CurrentStateComputationStage"
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        let cache = event.get::<ClusterDataCache>(attrs::CLUSTER_DATA)?;
        let resources = event.get::<ResourceMap>(attrs::RESOURCES)?;
        let mut output = CurrentStateOutput::default();

        for (instance, states) in cache.current_states() {
            if !cache.is_live(instance) {
                continue;
            }
            for (resource, state) in states.iter().filter(|(resource, _)| resources.contains_key(*resource)) {
                for (partition_name, partition_state) in state.partitions.iter() {
                    if let Some(partition) = Partition::parse(partition_name).filter(|partition| &partition.resource == resource) {
                        output.set_state(partition, instance, partition_state);
                    }
                }
            }
        }

        for (instance, messages) in cache.messages() {
            let session = match cache.live_instances().get(instance) {
                Some(live) => &live.session_id,
                None => continue,
            };
            for message in messages.values() {
                if &message.session_id != session || !resources.contains_key(&message.resource_name) {
                    continue;
                }
                if let Some(partition) = message.partition() {
                    output.set_pending(partition, message.clone());
                }
            }
        }

        event.insert(attrs::CURRENT_STATE, output);
        Ok(())
    }
}
