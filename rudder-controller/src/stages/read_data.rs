use async_trait::async_trait;

use crate::cache::ClusterDataCache;
use crate::pipeline::{attrs, ClusterEvent, Stage, StageContext, StageError};
use crate::stages::require_ctx;

/// Refreshes the run's `ClusterDataCache` from the metadata store.
#[derive(Default)]
pub struct ReadClusterDataStage {
    ctx: Option<StageContext>,
}

#[async_trait]
impl Stage for ReadClusterDataStage {
    fn name(&self) -> &'static str {
        "ReadClusterDataStage"
    }

    fn init(&mut self, ctx: &StageContext) {
        self.ctx = Some(ctx.clone());
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        let ctx = require_ctx(&self.ctx, self.name())?;
        let changes = event.changes().clone();
        let cache = event.get_mut::<ClusterDataCache>(attrs::CLUSTER_DATA)?;
        cache.refresh(ctx.store.as_ref(), &changes).await?;
        Ok(())
    }

    fn release(&mut self) {
        self.ctx = None;
    }
}
