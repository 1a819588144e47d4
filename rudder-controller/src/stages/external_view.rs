use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::cache::ClusterDataCache;
use crate::monitor::ResourceStatus;
use crate::pipeline::{attrs, ClusterEvent, Stage, StageContext, StageError};
use crate::stages::{require_ctx, CurrentStateOutput, ResourceMap};
use rudder_core::model::ExternalView;
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{write_record, CreateMode};

/// Aggregates the current states of every resource into its external view.
///
/// Views are only written when they have changed. Views of resources which are no longer managed
/// are removed. The status of a resource is reported whenever it differs from the last report.
#[derive(Default)]
pub struct ExternalViewComputeStage {
    ctx: Option<StageContext>,
}

#[async_trait]
impl Stage for ExternalViewComputeStage {
    fn name(&self) -> &'static str {
        "ExternalViewComputeStage"
    }

    fn init(&mut self, ctx: &StageContext) {
        self.ctx = Some(ctx.clone());
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        let ctx = require_ctx(&self.ctx, self.name())?;
        let cache = event.get::<ClusterDataCache>(attrs::CLUSTER_DATA)?;
        let resources = event.get::<ResourceMap>(attrs::RESOURCES)?;
        let current = event.get::<CurrentStateOutput>(attrs::CURRENT_STATE)?;

        let mut updated: Vec<ExternalView> = vec![];
        let mut statuses: Vec<ResourceStatus> = vec![];
        for resource in resources.values() {
            let mut view = ExternalView {
                resource: resource.name.clone(),
                partitions: BTreeMap::new(),
            };
            let ideal = cache.ideal_states().get(&resource.name);
            let mut status = ResourceStatus {
                resource: resource.name.clone(),
                partitions: resource.partitions.len(),
                ..Default::default()
            };
            for partition in resource.partitions.iter() {
                let partition_name = partition.name();
                let states = current.instance_states(partition).cloned().unwrap_or_default();
                let desired = ideal.and_then(|ideal| ideal.instance_state_map(&partition_name)).cloned().unwrap_or_default();
                if states != desired {
                    status.diverged_partitions += 1;
                }
                status.error_replicas += states.values().filter(|state| *state == resource.state_model.error_state()).count();
                if !states.is_empty() {
                    view.partitions.insert(partition_name, states);
                }
            }
            if cache.external_view(&resource.name) != Some(&view) {
                updated.push(view);
            }
            if cache.resource_status(&resource.name) != Some(&status) {
                statuses.push(status);
            }
        }
        let removed: Vec<String> = cache
            .external_views()
            .keys()
            .filter(|name| !resources.contains_key(*name))
            .cloned()
            .collect();

        for view in updated.iter() {
            ctx.ensure_leader()?;
            let view_path = path(PropertyType::ExternalView, &ctx.cluster, &[&view.resource]);
            write_record(ctx.store.as_ref(), &view_path, view, CreateMode::Persistent).await?;
        }
        for status in statuses.iter() {
            ctx.monitor.external_view_updated(status);
        }
        for resource in removed.iter() {
            ctx.ensure_leader()?;
            let view_path = path(PropertyType::ExternalView, &ctx.cluster, &[resource]);
            ctx.store.delete_recursive(&view_path).await?;
            ctx.monitor.resource_removed(resource);
            tracing::info!(%resource, "external view of removed resource deleted");
        }

        let cache = event.get_mut::<ClusterDataCache>(attrs::CLUSTER_DATA)?;
        for view in updated {
            cache.set_external_view(view);
        }
        for status in statuses {
            cache.set_resource_status(status);
        }
        for resource in removed {
            cache.remove_external_view(&resource);
        }
        Ok(())
    }
}
