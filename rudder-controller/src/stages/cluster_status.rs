use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::cache::ClusterDataCache;
use crate::monitor::ClusterStatus;
use crate::pipeline::{attrs, ClusterEvent, Stage, StageContext, StageError};
use crate::stages::require_ctx;

/// Reports instance counts of the cluster to the status monitor.
#[derive(Default)]
pub struct ClusterStatusStage {
    ctx: Option<StageContext>,
}

#[async_trait]
impl Stage for ClusterStatusStage {
    fn name(&self) -> &'static str {
        "ClusterStatusStage"
    }

    fn init(&mut self, ctx: &StageContext) {
        self.ctx = Some(ctx.clone());
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        let ctx = require_ctx(&self.ctx, self.name())?;
        let cache = event.get::<ClusterDataCache>(attrs::CLUSTER_DATA)?;
        let configs = cache.instance_configs();
        let all: BTreeSet<&String> = configs.keys().chain(cache.live_instances().keys()).collect();
        let status = ClusterStatus {
            live_instances: cache.live_instances().len(),
            total_instances: all.len(),
            disabled_instances: configs.values().filter(|cfg| !cfg.enabled).count(),
            disabled_partitions: configs.values().map(|cfg| cfg.disabled_partitions.len()).sum(),
        };
        tracing::trace!(?status, "cluster status");
        ctx.monitor.cluster_status(&status);
        Ok(())
    }
}
