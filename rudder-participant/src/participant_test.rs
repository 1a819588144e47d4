use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::fixtures::{eventually, Cluster, RecordingHandler, CLUSTER};
use crate::handler::{HandlerRegistry, LoggingHandler};
use rudder_controller::monitor::MetricsMonitor;
use rudder_controller::{Controller, ControllerConfig};
use rudder_core::model::{CurrentState, IdealState, InstanceConfig, LiveInstance};
use rudder_core::paths::{path, PropertyType};
use rudder_core::store::{read_record, write_record, CreateMode, MetadataStore};

#[tokio::test]
async fn registration_replaces_previous_sessions() -> Result<()> {
    let cluster = &Cluster::new().await?;
    let stale_path = path(PropertyType::CurrentStates, CLUSTER, &["node-0", "old-session", "db"]);
    let stale = CurrentState {
        resource: "db".into(),
        session_id: "old-session".into(),
        state_model_def: "MasterSlave".into(),
        partitions: Default::default(),
    };
    write_record(cluster.admin_session.as_ref(), &stale_path, &stale, CreateMode::Persistent).await?;

    let (session, shutdown_tx, handle) = cluster.start_participant("node-0", HandlerRegistry::new()).await;
    let sid = session.session_id();
    let live_path = &path(PropertyType::LiveInstances, CLUSTER, &["node-0"]);
    eventually(move || async move {
        let live: Option<LiveInstance> = read_record(cluster.admin_session.as_ref(), live_path).await?;
        Ok::<_, anyhow::Error>(live.map_or(false, |live| live.session_id == sid))
    })
    .await?;

    let data = cluster.admin_session.read(&stale_path).await?;
    assert!(data.is_none(), "expected current states of the old session to be deleted");
    let cfg_path = path(PropertyType::ParticipantConfigs, CLUSTER, &["node-0"]);
    let cfg: Option<InstanceConfig> = read_record(cluster.admin_session.as_ref(), &cfg_path).await?;
    assert!(cfg.is_some(), "expected the instance to be added to the cluster");

    let _ = shutdown_tx.send(());
    handle.await??;
    let data = cluster.admin_session.read(live_path).await?;
    assert!(data.is_none(), "expected the live instance record to be removed on shutdown");
    Ok(())
}

#[tokio::test]
async fn a_live_instance_can_not_be_joined_twice() -> Result<()> {
    let cluster = Cluster::new().await?;
    let (session, shutdown_tx, handle) = cluster.start_participant("node-0", HandlerRegistry::new()).await;
    let live_path = path(PropertyType::LiveInstances, CLUSTER, &["node-0"]);
    let cluster = &cluster;
    let live_path = &live_path;
    eventually(move || async move { Ok::<_, anyhow::Error>(cluster.admin_session.read(live_path).await?.is_some()) }).await?;

    let (_, _shutdown, duplicate) = cluster.start_participant("node-0", HandlerRegistry::new()).await;
    let res = tokio::time::timeout(Duration::from_secs(5), duplicate).await.context("timeout joining duplicate")??;
    assert!(res.is_err(), "expected a second participant of a live instance to fail");

    let live: LiveInstance = read_record(cluster.admin_session.as_ref(), live_path).await?.context("expected a live instance")?;
    assert_eq!(live.session_id, session.session_id(), "expected the first session to remain live, got {:?}", live);
    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn controller_and_participants_converge() -> Result<()> {
    let cluster = &Cluster::new().await?;
    let handler = Arc::new(RecordingHandler::default());
    let handlers = HandlerRegistry::new().with_default("MasterSlave", handler.clone());
    let (_s0, shutdown0, p0) = cluster.start_participant("node-0", handlers.clone()).await;
    let (_s1, shutdown1, p1) = cluster.start_participant("node-1", HandlerRegistry::new().with_default("MasterSlave", Arc::new(LoggingHandler))).await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let config = Arc::new(ControllerConfig {
        cluster: CLUSTER.into(),
        identity: "controller-0".into(),
        leader_retry: Duration::from_millis(50),
        rebalance_interval: Duration::from_millis(200),
    });
    let controller = Controller::new(config, Arc::new(cluster.store.connect().await), Arc::new(MetricsMonitor::new()), shutdown_tx.clone()).spawn();

    let ideal = &IdealState {
        resource: "db".into(),
        state_model_def: "MasterSlave".into(),
        num_partitions: 2,
        replicas: 2,
        partitions: [("db_0", "node-0", "node-1"), ("db_1", "node-1", "node-0")]
            .iter()
            .map(|(partition, master, slave)| {
                let assignment = [(master.to_string(), "MASTER".to_string()), (slave.to_string(), "SLAVE".to_string())];
                (partition.to_string(), assignment.into_iter().collect())
            })
            .collect(),
    };
    cluster.admin.set_ideal_state(ideal).await?;
    eventually(move || async move {
        let view = cluster.admin.get_external_view("db").await?;
        Ok::<_, anyhow::Error>(view.map_or(false, |view| view.partitions == ideal.partitions))
    })
    .await
    .context("error converging ideal state")?;
    let calls = handler.calls();
    assert!(calls.contains(&("SLAVE".into(), "MASTER".into())), "expected node-0 to be promoted, got {:?}", calls);

    cluster.admin.drop_resource("db").await?;
    eventually(move || async move { Ok::<_, anyhow::Error>(cluster.admin.get_external_view("db").await?.is_none()) })
        .await
        .context("error dropping resource")?;

    let _ = shutdown_tx.send(());
    let _ = shutdown0.send(());
    let _ = shutdown1.send(());
    for handle in [controller, p0, p1] {
        tokio::time::timeout(Duration::from_secs(5), handle).await.context("timeout joining task")???;
    }
    Ok(())
}
