use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::cache::ClusterDataCache;
use crate::pipeline::{attrs, ClusterEvent, Stage, StageContext, StageError};
use crate::stages::{require_ctx, BestPossibleStateOutput, CurrentStateOutput, ResourceMap};
use rudder_core::model::{Message, Partition};

/// All generated messages: `resource -> partition -> messages`.
#[derive(Clone, Debug, Default)]
pub struct MessageGenerationOutput {
    messages: BTreeMap<String, BTreeMap<Partition, Vec<Message>>>,
}

impl MessageGenerationOutput {
    pub fn add(&mut self, partition: &Partition, message: Message) {
        self.messages
            .entry(partition.resource.clone())
            .or_default()
            .entry(partition.clone())
            .or_default()
            .push(message);
    }

    /// The messages generated for the given partition.
    pub fn messages(&self, partition: &Partition) -> &[Message] {
        self.messages
            .get(&partition.resource)
            .and_then(|partitions| partitions.get(partition))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// All messages in resource, partition index & instance order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.values().flat_map(|partitions| partitions.values()).flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Diffs the best possible state against the current state of every replica, emitting a single
/// hop transition for every replica not yet in its target state.
#[derive(Default)]
pub struct MessageGenerationStage {
    ctx: Option<StageContext>,
}

#[async_trait]
impl Stage for MessageGenerationStage {
    fn name(&self) -> &'static str {
        "MessageGenerationStage"
    }

    fn init(&mut self, ctx: &StageContext) {
        self.ctx = Some(ctx.clone());
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        let ctx = require_ctx(&self.ctx, self.name())?;
        let cache = event.get::<ClusterDataCache>(attrs::CLUSTER_DATA)?;
        let resources = event.get::<ResourceMap>(attrs::RESOURCES)?;
        let current = event.get::<CurrentStateOutput>(attrs::CURRENT_STATE)?;
        let best = event.get::<BestPossibleStateOutput>(attrs::BEST_POSSIBLE_STATE)?;
        let mut output = MessageGenerationOutput::default();

        for resource in resources.values() {
            let model = resource.state_model.as_ref();
            for partition in resource.partitions.iter() {
                let mut instances: BTreeSet<&String> = BTreeSet::new();
                instances.extend(best.instance_states(partition).into_iter().flat_map(|states| states.keys()));
                instances.extend(current.instance_states(partition).into_iter().flat_map(|states| states.keys()));

                for instance in instances {
                    let live = match cache.live_instances().get(instance.as_str()) {
                        Some(live) => live,
                        None => continue,
                    };
                    let desired = best.state(partition, instance).unwrap_or_else(|| model.dropped_state());
                    let current_state = current
                        .state(partition, instance)
                        .map(|state| model.normalize(state))
                        .unwrap_or_else(|| model.initial_state());
                    if current_state == desired {
                        continue;
                    }
                    let next = model.next_state(current_state, desired).ok_or_else(|| {
                        StageError::InvalidInput(format!(
                            "state {} of {} on {} can not reach state {} in state model {}",
                            current_state,
                            partition,
                            instance,
                            desired,
                            model.name()
                        ))
                    })?;
                    let message = Message::new_transition(partition, instance, &live.session_id, model.name(), current_state, next, &ctx.identity);
                    tracing::trace!(
                        partition = %partition,
                        instance = %instance,
                        from = current_state,
                        to = next,
                        "generated transition"
                    );
                    output.add(partition, message);
                }
            }
        }

        event.insert(attrs::MESSAGES_ALL, output);
        Ok(())
    }
}
