//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use rudder_core::store::DEFAULT_DATA_PATH;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The name of the cluster managed by this node.
    pub cluster_name: String,
    /// The name of this node.
    ///
    /// Used as the identity of the controller candidate and as the instance hosted by the
    /// participant of this node.
    pub instance_name: String,
    /// The hostname recorded in the live instance record of this node.
    #[serde(default = "Config::default_hostname")]
    pub hostname: String,
    /// The port of the metrics server.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The path to the database on disk.
    #[serde(default = "Config::default_data_path")]
    pub storage_data_path: String,

    /// The number of seconds between attempts to acquire leadership.
    #[serde(default = "Config::default_leader_retry_seconds")]
    pub leader_retry_seconds: u64,
    /// The number of seconds between periodic rebalances of the leading controller.
    #[serde(default = "Config::default_rebalance_seconds")]
    pub rebalance_seconds: u64,
    /// Run a controller candidate on this node.
    #[serde(default = "Config::default_true")]
    pub controller_enabled: bool,
    /// Run a participant on this node.
    #[serde(default)]
    pub participant_enabled: bool,
    /// The state models served by the participant of this node.
    #[serde(default = "Config::default_state_models")]
    pub state_models: Vec<String>,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the given config.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.cluster_name.is_empty(), "CLUSTER_NAME must not be empty");
        ensure!(!self.instance_name.is_empty(), "INSTANCE_NAME must not be empty");
        ensure!(self.leader_retry_seconds > 0, "LEADER_RETRY_SECONDS must be greater than 0");
        ensure!(self.rebalance_seconds > 0, "REBALANCE_SECONDS must be greater than 0");
        ensure!(
            self.controller_enabled || self.participant_enabled,
            "at least one of CONTROLLER_ENABLED or PARTICIPANT_ENABLED must be set"
        );
        Ok(())
    }

    pub fn leader_retry(&self) -> Duration {
        Duration::from_secs(self.leader_retry_seconds)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_seconds)
    }

    fn default_hostname() -> String {
        "localhost".into()
    }

    fn default_metrics_port() -> u16 {
        7002
    }

    fn default_data_path() -> String {
        DEFAULT_DATA_PATH.into()
    }

    fn default_leader_retry_seconds() -> u64 {
        5
    }

    fn default_rebalance_seconds() -> u64 {
        30
    }

    fn default_true() -> bool {
        true
    }

    fn default_state_models() -> Vec<String> {
        vec!["MasterSlave".into(), "OnlineOffline".into()]
    }
}
