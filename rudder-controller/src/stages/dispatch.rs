use async_trait::async_trait;

use crate::cache::ClusterDataCache;
use crate::pipeline::{attrs, ClusterEvent, Stage, StageContext, StageError};
use crate::stages::require_ctx;
use rudder_core::model::Message;
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{create_record, CreateMode};

const METRIC_MESSAGES_DISPATCHED: &str = "rudder_controller_messages_dispatched";

/// Writes the selected messages to the message queues of their instances.
///
/// Leadership is checked before every write, a controller which has lost leadership stops
/// dispatching immediately. Every written message is recorded in the cache as outstanding.
#[derive(Default)]
pub struct MessageDispatchStage {
    ctx: Option<StageContext>,
}

#[async_trait]
impl Stage for MessageDispatchStage {
    fn name(&self) -> &'static str {
        "MessageDispatchStage"
    }

    fn init(&mut self, ctx: &StageContext) {
        metrics::register_counter!(METRIC_MESSAGES_DISPATCHED, metrics::Unit::Count, "the number of transition messages dispatched");
        self.ctx = Some(ctx.clone());
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        let ctx = require_ctx(&self.ctx, self.name())?;
        let selected = event.get::<Vec<Message>>(attrs::MESSAGES_SELECTED)?.clone();
        let mut dispatched = 0usize;
        for message in selected {
            ctx.ensure_leader()?;
            let msg_path = path(PropertyType::Messages, &ctx.cluster, &[&message.instance_name, &message.id]);
            let created = create_record(ctx.store.as_ref(), &msg_path, &message, CreateMode::Persistent).await?;
            if !created {
                tracing::warn!(id = %message.id, instance = %message.instance_name, "message already exists, skipping");
                continue;
            }
            tracing::debug!(
                id = %message.id,
                partition = %message.partition_name,
                instance = %message.instance_name,
                from = %message.from_state,
                to = %message.to_state,
                "transition dispatched"
            );
            event.get_mut::<ClusterDataCache>(attrs::CLUSTER_DATA)?.record_message(message);
            dispatched += 1;
        }
        metrics::counter!(METRIC_MESSAGES_DISPATCHED, dispatched as u64);
        event.insert(attrs::MESSAGES_DISPATCHED, dispatched);
        Ok(())
    }
}
