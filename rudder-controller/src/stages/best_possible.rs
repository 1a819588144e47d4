use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::cache::ClusterDataCache;
use crate::pipeline::{attrs, ClusterEvent, Stage, StageError};
use crate::stages::ResourceMap;
use rudder_core::model::{Partition, StateModel};

/// The best possible state of every replica: `partition -> instance -> state`.
#[derive(Clone, Debug, Default)]
pub struct BestPossibleStateOutput {
    states: BTreeMap<Partition, BTreeMap<String, String>>,
}

impl BestPossibleStateOutput {
    pub fn set(&mut self, partition: Partition, states: BTreeMap<String, String>) {
        self.states.insert(partition, states);
    }

    /// The best possible `instance -> state` mapping of the given partition.
    pub fn instance_states(&self, partition: &Partition) -> Option<&BTreeMap<String, String>> {
        self.states.get(partition)
    }

    /// The best possible state of the given replica.
    pub fn state(&self, partition: &Partition, instance: &str) -> Option<&str> {
        self.states.get(partition)?.get(instance).map(String::as_str)
    }
}

/// Computes the target state of every replica.
///
/// The ideal state mapping is restricted to live instances. Replicas on a disabled instance, or of
/// a partition disabled on its instance, target the initial state. Replicas in excess of a state's
/// upper bound are demoted to the next lower state, in instance name order.
pub struct BestPossibleStateCalcStage;

#[async_trait]
impl Stage for BestPossibleStateCalcStage {
    fn name(&self) -> &'static str {
        "BestPossibleStateCalcStage"
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        let cache = event.get::<ClusterDataCache>(attrs::CLUSTER_DATA)?;
        let resources = event.get::<ResourceMap>(attrs::RESOURCES)?;
        let mut output = BestPossibleStateOutput::default();

        for resource in resources.values().filter(|resource| resource.has_ideal_state) {
            let ideal = match cache.ideal_states().get(&resource.name) {
                Some(ideal) => ideal,
                None => continue,
            };
            let model = resource.state_model.as_ref();
            for partition in resource.partitions.iter() {
                let partition_name = partition.name();
                let mut states = BTreeMap::new();
                for (instance, state) in ideal.instance_state_map(&partition_name).into_iter().flatten() {
                    if !cache.is_live(instance) {
                        continue;
                    }
                    if model.state_priority(state).is_none() {
                        return Err(StageError::InvalidInput(format!(
                            "ideal state of {} assigns undeclared state {} to instance {}",
                            partition_name, state, instance
                        )));
                    }
                    let target = if cache.is_partition_enabled(instance, &partition_name) {
                        state.clone()
                    } else {
                        model.initial_state().to_string()
                    };
                    states.insert(instance.clone(), target);
                }
                apply_upper_bounds(model, &mut states);
                output.set(partition.clone(), states);
            }
        }

        event.insert(attrs::BEST_POSSIBLE_STATE, output);
        Ok(())
    }
}

/// Demote replicas in excess of each state's upper bound, highest priority state first.
fn apply_upper_bounds(model: &StateModel, states: &mut BTreeMap<String, String>) {
    for state in model.states() {
        let (bound, lower) = match (model.upper_bound(state), model.next_lower_state(state)) {
            (Some(bound), Some(lower)) => (bound as usize, lower),
            _ => continue,
        };
        let excess: Vec<String> = states
            .iter()
            .filter(|(_, assigned)| *assigned == state)
            .map(|(instance, _)| instance.clone())
            .skip(bound)
            .collect();
        for instance in excess {
            states.insert(instance, lower.to_string());
        }
    }
}
