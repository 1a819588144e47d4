//! The stages of the controller pipeline.

mod best_possible;
mod cluster_status;
mod current_state;
mod dispatch;
mod external_view;
mod message_generation;
mod message_selection;
mod read_data;
mod resource;

use std::sync::Arc;

pub use best_possible::{BestPossibleStateCalcStage, BestPossibleStateOutput};
pub use cluster_status::ClusterStatusStage;
pub use current_state::{CurrentStateComputationStage, CurrentStateOutput};
pub use dispatch::MessageDispatchStage;
pub use external_view::ExternalViewComputeStage;
pub use message_generation::{MessageGenerationOutput, MessageGenerationStage};
pub use message_selection::{
    AdmissionPolicy, InstanceLimitPolicy, MessageSelectionStage, OneOutstandingPerReplica, OutstandingCounts, TransitionLimitPolicy, UpperBoundPolicy,
};
pub use read_data::ReadClusterDataStage;
pub use resource::{Resource, ResourceComputationStage, ResourceMap};

use crate::pipeline::{Pipeline, StageContext, StageError};

/// Build the controller pipeline, admitting messages only if every given policy accepts them in
/// addition to the built-in policies.
pub fn default_pipeline(policies: Vec<Arc<dyn AdmissionPolicy>>) -> Pipeline {
    Pipeline::new()
        .with_stage(ReadClusterDataStage::default())
        .with_stage(ResourceComputationStage)
        .with_stage(CurrentStateComputationStage)
        .with_stage(BestPossibleStateCalcStage)
        .with_stage(MessageGenerationStage::default())
        .with_stage(MessageSelectionStage::new(policies))
        .with_stage(MessageDispatchStage::default())
        .with_stage(ExternalViewComputeStage::default())
        .with_stage(ClusterStatusStage::default())
}

/// Get the context given to a stage on init.
fn require_ctx<'a>(ctx: &'a Option<StageContext>, stage: &'static str) -> Result<&'a StageContext, StageError> {
    ctx.as_ref()
        .ok_or_else(|| StageError::InvalidInput(format!("stage {} used before init", stage)))
}
