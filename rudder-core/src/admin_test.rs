use std::sync::Arc;

use anyhow::Result;
use maplit::btreemap;

use crate::admin::ClusterAdmin;
use crate::model::{ClusterConfig, IdealState, InstanceConfig, StateModelDefinition};
use crate::paths::{path, PropertyType};
use crate::store::{read_record, MemoryStore, MetadataStore};

async fn setup() -> Result<(ClusterAdmin, Arc<dyn MetadataStore>)> {
    let store = MemoryStore::new();
    let session: Arc<dyn MetadataStore> = Arc::new(store.connect().await);
    let admin = ClusterAdmin::new(session.clone(), "test_cluster");
    admin.setup_cluster().await?;
    admin.add_state_model_def(StateModelDefinition::master_slave()).await?;
    Ok((admin, session))
}

#[tokio::test]
async fn setup_cluster_is_idempotent() -> Result<()> {
    let (admin, session) = setup().await?;
    admin.setup_cluster().await?;
    let cfg: Option<ClusterConfig> = read_record(session.as_ref(), &path(PropertyType::ClusterConfig, "test_cluster", &["test_cluster"])).await?;
    assert_eq!(cfg, Some(ClusterConfig::default()), "expected default cluster config, got {:?}", cfg);
    Ok(())
}

#[tokio::test]
async fn instances_can_be_disabled_per_partition() -> Result<()> {
    let (admin, session) = setup().await?;
    assert!(admin.add_instance("node-0").await?, "expected instance to be added");
    assert!(!admin.add_instance("node-0").await?, "expected duplicate instance to be ignored");
    admin.enable_partition("node-0", "db_0", false).await?;
    admin.enable_instance("node-0", false).await?;

    let cfg_path = path(PropertyType::ParticipantConfigs, "test_cluster", &["node-0"]);
    let cfg: InstanceConfig = read_record(session.as_ref(), &cfg_path).await?.ok_or_else(|| anyhow::anyhow!("missing config"))?;
    assert!(!cfg.enabled, "expected instance to be disabled");
    assert!(cfg.disabled_partitions.contains("db_0"), "expected partition to be disabled, got {:?}", cfg.disabled_partitions);

    admin.enable_partition("node-0", "db_0", true).await?;
    let cfg: InstanceConfig = read_record(session.as_ref(), &cfg_path).await?.ok_or_else(|| anyhow::anyhow!("missing config"))?;
    assert!(cfg.disabled_partitions.is_empty(), "expected no disabled partitions, got {:?}", cfg.disabled_partitions);

    let instances = admin.list_instances().await?;
    assert_eq!(instances, vec!["node-0".to_string()]);
    assert!(admin.enable_instance("node-9", true).await.is_err(), "expected unknown instance to be rejected");
    Ok(())
}

#[tokio::test]
async fn set_ideal_state_validates_against_state_model() -> Result<()> {
    let (admin, _) = setup().await?;
    let mut ideal = IdealState {
        resource: "db".into(),
        state_model_def: "MasterSlave".into(),
        num_partitions: 1,
        replicas: 2,
        partitions: btreemap! {
            "db_0".into() => btreemap! { "node-0".into() => "MASTER".into(), "node-1".into() => "SLAVE".into() },
        },
    };
    admin.set_ideal_state(&ideal).await?;

    ideal.partitions.insert("db_1".into(), btreemap! { "node-0".into() => "LEADER".into() });
    assert!(admin.set_ideal_state(&ideal).await.is_err(), "expected undeclared state to be rejected");

    ideal.partitions.remove("db_1");
    ideal.partitions.insert("kv_0".into(), Default::default());
    assert!(admin.set_ideal_state(&ideal).await.is_err(), "expected foreign partition to be rejected");

    ideal.partitions.remove("kv_0");
    ideal.state_model_def = "LeaderStandby".into();
    assert!(admin.set_ideal_state(&ideal).await.is_err(), "expected unknown state model to be rejected");
    Ok(())
}

#[tokio::test]
async fn invalid_state_models_are_rejected() -> Result<()> {
    let (admin, _) = setup().await?;
    let mut def = StateModelDefinition::online_offline();
    def.states.clear();
    assert!(admin.add_state_model_def(def).await.is_err(), "expected empty state model to be rejected");
    Ok(())
}
