//! The controller pipeline.
//!
//! A pipeline is an ordered chain of stages run against a single `ClusterEvent`. Stages never call
//! each other, they communicate only through the named attributes of the event.

mod event;
#[cfg(test)]
mod pipeline_test;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::election::LeaderState;
use crate::monitor::StatusMonitor;
use rudder_core::store::{MetadataStore, StoreError};

pub use event::{attrs, ChangeSet, ClusterEvent, ClusterEventType};

/// Stage error variants.
#[derive(Debug, Error)]
pub enum StageError {
    /// A required attribute was not produced by an earlier stage.
    #[error("missing required event attribute {0}")]
    MissingAttribute(&'static str),
    /// The cluster data given to a stage is invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// This controller is no longer the cluster leader.
    #[error("leadership lost")]
    LeadershipLost,
    /// An error from the metadata store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StageError {
    /// Check if this error is an expected part of normal operation.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::LeadershipLost)
    }
}

/// Handles shared by all stages of a pipeline.
#[derive(Clone)]
pub struct StageContext {
    /// The name of the cluster being managed.
    pub cluster: Arc<String>,
    /// The identity of this controller.
    pub identity: Arc<String>,
    /// The metadata store client of this controller.
    pub store: Arc<dyn MetadataStore>,
    /// The leadership state of this controller.
    pub leader_state: watch::Receiver<LeaderState>,
    /// The monitor receiving cluster status updates.
    pub monitor: Arc<dyn StatusMonitor>,
}

impl StageContext {
    /// Check that this controller is still the leader, returning `StageError::LeadershipLost`
    /// otherwise.
    pub fn ensure_leader(&self) -> Result<(), StageError> {
        let is_leader = matches!(*self.leader_state.borrow(), LeaderState::Leading);
        if !is_leader {
            return Err(StageError::LeadershipLost);
        }
        Ok(())
    }
}

/// A single stage of a pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The name of this stage.
    fn name(&self) -> &'static str;

    /// Initialize this stage before it processes any event.
    fn init(&mut self, _ctx: &StageContext) {}

    /// Called before each call to `process`.
    fn pre_process(&self) {}

    /// Process the given event.
    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError>;

    /// Called after each successful call to `process`.
    fn post_process(&self) {}

    /// Release any resources held by this stage.
    fn release(&mut self) {}
}

/// An ordered chain of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage to this pipeline.
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// The names of the stages of this pipeline, in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Initialize all stages.
    pub fn init(&mut self, ctx: &StageContext) {
        for stage in self.stages.iter_mut() {
            stage.init(ctx);
        }
    }

    /// Run every stage against the given event in order.
    ///
    /// The first stage error aborts the remaining stages.
    #[tracing::instrument(level = "debug", skip(self, event), fields(kind = ?event.kind()))]
    pub async fn handle(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        for stage in self.stages.iter() {
            let start = Instant::now();
            stage.pre_process();
            stage.process(event).await.map_err(|err| {
                if !err.is_benign() {
                    tracing::debug!(stage = stage.name(), error = %err, "stage failed");
                }
                err
            })?;
            stage.post_process();
            tracing::trace!(stage = stage.name(), elapsed = ?start.elapsed(), "stage finished");
        }
        Ok(())
    }

    /// Release all stages.
    pub fn release(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.release();
        }
    }
}
