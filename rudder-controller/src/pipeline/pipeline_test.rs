use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::pipeline::{attrs, ChangeSet, ClusterEvent, ClusterEventType, Pipeline, Stage, StageError};
use rudder_core::store::{WatchEvent, WatchEventKind};

/// A stage which records its runs and optionally fails.
struct RecordingStage {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    fail: bool,
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn process(&self, event: &mut ClusterEvent) -> Result<(), StageError> {
        self.log.lock().unwrap().push(self.name);
        if self.fail {
            return Err(StageError::InvalidInput("boom".into()));
        }
        let count = event.take::<usize>(attrs::MESSAGES_DISPATCHED).unwrap_or(0);
        event.insert(attrs::MESSAGES_DISPATCHED, count + 1);
        Ok(())
    }
}

fn recording_pipeline(fail_at: Option<usize>) -> (Pipeline, Arc<Mutex<Vec<&'static str>>>) {
    let log = Arc::new(Mutex::new(vec![]));
    let names = ["first", "second", "third"];
    let pipeline = names.iter().enumerate().fold(Pipeline::new(), |pipeline, (idx, name)| {
        pipeline.with_stage(RecordingStage {
            name: *name,
            log: log.clone(),
            fail: fail_at == Some(idx),
        })
    });
    (pipeline, log)
}

#[tokio::test]
async fn stages_run_in_order_and_share_attributes() -> Result<()> {
    let (pipeline, log) = recording_pipeline(None);
    let mut event = ClusterEvent::new(ClusterEventType::PeriodicRebalance, ChangeSet::default());
    pipeline.handle(&mut event).await?;

    let log = log.lock().unwrap().clone();
    assert_eq!(log, vec!["first", "second", "third"], "expected stages in order, got {:?}", log);
    let count = *event.get::<usize>(attrs::MESSAGES_DISPATCHED)?;
    assert_eq!(count, 3, "expected each stage to see the previous stage's output, got {}", count);
    Ok(())
}

#[tokio::test]
async fn first_stage_error_aborts_the_run() -> Result<()> {
    let (pipeline, log) = recording_pipeline(Some(1));
    let mut event = ClusterEvent::new(ClusterEventType::DataChange, ChangeSet::full());
    let res = pipeline.handle(&mut event).await;

    assert!(matches!(res, Err(StageError::InvalidInput(_))), "expected InvalidInput, got {:?}", res);
    let log = log.lock().unwrap().clone();
    assert_eq!(log, vec!["first", "second"], "expected the run to stop at the failing stage, got {:?}", log);
    Ok(())
}

#[tokio::test]
async fn missing_and_mistyped_attributes_are_errors() -> Result<()> {
    let mut event = ClusterEvent::new(ClusterEventType::DataChange, ChangeSet::default());
    let res = event.get::<usize>(attrs::RESOURCES);
    assert!(matches!(res, Err(StageError::MissingAttribute(attrs::RESOURCES))), "expected MissingAttribute, got {:?}", res);

    event.insert(attrs::RESOURCES, "not a resource map".to_string());
    let res = event.get::<usize>(attrs::RESOURCES);
    assert!(matches!(res, Err(StageError::MissingAttribute(_))), "expected MissingAttribute, got {:?}", res);
    assert!(event.take::<usize>(attrs::RESOURCES).is_none(), "expected mistyped take to fail");
    let val = event.take::<String>(attrs::RESOURCES);
    assert_eq!(val.as_deref(), Some("not a resource map"), "expected mistyped take to leave the value in place, got {:?}", val);
    Ok(())
}

#[tokio::test]
async fn change_sets_classify_and_coalesce_notifications() -> Result<()> {
    let changed = |path: &str| WatchEvent {
        path: path.into(),
        kind: WatchEventKind::Changed,
    };
    let mut changes = ChangeSet::default();
    changes.record("c", &changed("/c/IDEALSTATES/db"));
    changes.record("c", &changed("/c/INSTANCES/node-0/CURRENTSTATES/s0/db"));
    changes.record("c", &changed("/c/EXTERNALVIEW/db"));
    changes.record("c", &changed("/c/CONTROLLER/LEADER"));
    assert!(changes.ideal_states, "expected ideal state change to be recorded");
    assert!(changes.current_states.contains("node-0"), "expected current state change of node-0, got {:?}", changes.current_states);
    assert!(!changes.full, "expected no full refresh, got {:?}", changes);

    changes.record("c", &changed("/c/INSTANCES/node-1/MESSAGES/m0"));
    changes.record("c", &changed("/c/LIVEINSTANCES/node-1"));
    assert!(changes.ideal_states, "expected earlier changes to be kept when coalescing");
    assert!(changes.live_instances, "expected live instance change to be coalesced");
    assert!(changes.messages.contains("node-1"), "expected message change of node-1, got {:?}", changes.messages);

    let mut ignored = ChangeSet::default();
    ignored.record("c", &changed("/c/EXTERNALVIEW/db"));
    assert!(ignored.is_empty(), "expected external view changes to be ignored, got {:?}", ignored);
    ignored.record("c", &changed("/other/IDEALSTATES/db"));
    assert!(ignored.full, "expected unclassified paths to force a full refresh, got {:?}", ignored);
    Ok(())
}
