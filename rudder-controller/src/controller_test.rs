use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use maplit::btreemap;
use tokio::sync::broadcast;

use crate::controller::{Controller, ControllerConfig};
use crate::fixtures::{eventually, ideal_state, RecordingMonitor, SimParticipant, CLUSTER};
use rudder_core::admin::ClusterAdmin;
use rudder_core::model::{IdealState, LeaderRecord, StateModelDefinition};
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{read_record, MemoryStore, MetadataStore, StoreSession};

fn controller(identity: &str, session: Arc<StoreSession>, shutdown_tx: &broadcast::Sender<()>) -> Controller {
    let config = Arc::new(ControllerConfig {
        cluster: CLUSTER.into(),
        identity: identity.into(),
        leader_retry: Duration::from_millis(50),
        rebalance_interval: Duration::from_millis(200),
    });
    Controller::new(config, session, Arc::new(RecordingMonitor::default()), shutdown_tx.clone())
}

/// Apply queued messages until the external view of `db` matches the given ideal state.
async fn converge(admin: &ClusterAdmin, participants: &[&SimParticipant], ideal: &IdealState) -> Result<()> {
    eventually(move || async move {
        for participant in participants {
            participant.execute_all().await?;
        }
        let view = admin.get_external_view(&ideal.resource).await?;
        Ok::<_, anyhow::Error>(view.map_or(false, |view| view.partitions == ideal.partitions))
    })
    .await
}

#[tokio::test]
async fn controller_converges_cluster_and_fails_over() -> Result<()> {
    let store = MemoryStore::new();
    let admin = ClusterAdmin::new(Arc::new(store.connect().await), CLUSTER);
    admin.setup_cluster().await?;
    admin.add_state_model_def(StateModelDefinition::master_slave()).await?;
    admin.add_instance("node-0").await?;
    admin.add_instance("node-1").await?;
    let p0 = SimParticipant::join(&store, "node-0").await?;
    let p1 = SimParticipant::join(&store, "node-1").await?;
    let ideal = ideal_state("db", &[("node-0", "MASTER"), ("node-1", "SLAVE")]);
    admin.set_ideal_state(&ideal).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let (s0, s1) = (Arc::new(store.connect().await), Arc::new(store.connect().await));
    let sessions = btreemap! { s0.session_id().to_string() => "controller-0", s1.session_id().to_string() => "controller-1" };
    let mut handles = btreemap! {
        "controller-0" => controller("controller-0", s0.clone(), &shutdown_tx).spawn(),
        "controller-1" => controller("controller-1", s1.clone(), &shutdown_tx).spawn(),
    };
    converge(&admin, &[&p0, &p1], &ideal).await.context("error converging initial ideal state")?;

    let leader_path = path(PropertyType::Leader, CLUSTER, &[]);
    let leader: LeaderRecord = read_record(s0.as_ref(), &leader_path).await?.context("expected a leader")?;
    assert_eq!(sessions.get(&leader.session_id), Some(&leader.identity.as_str()), "expected leader record to match its session, got {:?}", leader);
    store.expire_session(&leader.session_id).await;

    // The surviving controller must pick up the hand-off of mastership.
    let ideal = ideal_state("db", &[("node-0", "SLAVE"), ("node-1", "MASTER")]);
    admin.set_ideal_state(&ideal).await?;
    converge(&admin, &[&p0, &p1], &ideal).await.context("error converging after failover")?;
    let survivor = if leader.identity == "controller-0" { &s1 } else { &s0 };
    let new_leader: LeaderRecord = read_record(survivor.as_ref(), &leader_path).await?.context("expected a new leader")?;
    assert_ne!(new_leader.identity, leader.identity, "expected leadership to move, got {:?}", new_leader);

    // A controller whose session expired can no longer contend and stops.
    let expired = handles.remove(leader.identity.as_str()).context("expected a handle of the old leader")?;
    let res = tokio::time::timeout(Duration::from_secs(5), expired).await.context("timeout joining expired controller")??;
    assert!(res.is_err(), "expected the controller of an expired session to stop with an error");

    let _ = shutdown_tx.send(());
    for (_, handle) in handles {
        tokio::time::timeout(Duration::from_secs(5), handle).await.context("timeout joining controller")???;
    }
    Ok(())
}

#[tokio::test]
async fn sole_controller_stops_when_its_session_expires() -> Result<()> {
    let store = MemoryStore::new();
    let session = Arc::new(store.connect().await);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = controller("controller-0", session.clone(), &shutdown_tx).spawn();

    let leader_path = &path(PropertyType::Leader, CLUSTER, &[]);
    let observer = &store.connect().await;
    eventually(move || async move {
        let leader: Option<LeaderRecord> = read_record(observer, leader_path).await?;
        Ok::<_, anyhow::Error>(leader.map_or(false, |leader| leader.identity == "controller-0"))
    })
    .await
    .context("error acquiring leadership")?;

    store.expire_session(session.session_id()).await;
    let res = tokio::time::timeout(Duration::from_secs(5), handle).await.context("timeout waiting for the controller to stop")??;
    assert!(res.is_err(), "expected the controller to stop with an error once its session expired, got {:?}", res);
    let leader: Option<LeaderRecord> = read_record(observer, leader_path).await?;
    assert!(leader.is_none(), "expected the leader node of the expired session to be gone, got {:?}", leader);
    Ok(())
}

#[tokio::test]
async fn controller_rejects_invalid_config() -> Result<()> {
    let store = MemoryStore::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    let config = Arc::new(ControllerConfig {
        cluster: CLUSTER.into(),
        identity: "".into(),
        leader_retry: Duration::from_millis(50),
        rebalance_interval: Duration::from_millis(200),
    });
    let handle = Controller::new(config, Arc::new(store.connect().await), Arc::new(RecordingMonitor::default()), shutdown_tx).spawn();
    let res = handle.await?;
    assert!(res.is_err(), "expected an empty identity to be rejected");
    Ok(())
}
