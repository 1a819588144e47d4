//! Cluster status monitoring.

const METRIC_LIVE_INSTANCES: &str = "rudder_cluster_live_instances";
const METRIC_TOTAL_INSTANCES: &str = "rudder_cluster_instances";
const METRIC_DISABLED_INSTANCES: &str = "rudder_cluster_disabled_instances";
const METRIC_DISABLED_PARTITIONS: &str = "rudder_cluster_disabled_partitions";
const METRIC_RESOURCE_PARTITIONS: &str = "rudder_resource_partitions";
const METRIC_RESOURCE_DIVERGED: &str = "rudder_resource_partitions_diverged";
const METRIC_RESOURCE_ERRORS: &str = "rudder_resource_replicas_in_error";

/// Instance counts of a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterStatus {
    pub live_instances: usize,
    pub total_instances: usize,
    pub disabled_instances: usize,
    pub disabled_partitions: usize,
}

/// Status of a resource as of its latest external view.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceStatus {
    pub resource: String,
    pub partitions: usize,
    /// Partitions whose external view differs from the ideal state.
    pub diverged_partitions: usize,
    /// Replicas currently in the error state.
    pub error_replicas: usize,
}

/// A receiver of cluster status updates from the controller.
pub trait StatusMonitor: Send + Sync + 'static {
    /// Called at the end of every successful pipeline run.
    fn cluster_status(&self, status: &ClusterStatus);

    /// Called whenever the external view of a resource is updated.
    fn external_view_updated(&self, status: &ResourceStatus);

    /// Called when a resource has been removed from the cluster.
    fn resource_removed(&self, resource: &str);
}

/// A status monitor publishing all updates as gauges.
pub struct MetricsMonitor;

impl MetricsMonitor {
    pub fn new() -> Self {
        metrics::register_gauge!(METRIC_LIVE_INSTANCES, metrics::Unit::Count, "the number of live instances in the cluster");
        metrics::register_gauge!(METRIC_TOTAL_INSTANCES, metrics::Unit::Count, "the number of instances registered with the cluster");
        metrics::register_gauge!(METRIC_DISABLED_INSTANCES, metrics::Unit::Count, "the number of disabled instances in the cluster");
        metrics::register_gauge!(METRIC_DISABLED_PARTITIONS, metrics::Unit::Count, "the number of disabled partitions across all instances");
        metrics::register_gauge!(METRIC_RESOURCE_PARTITIONS, metrics::Unit::Count, "the number of partitions of a resource");
        metrics::register_gauge!(
            METRIC_RESOURCE_DIVERGED,
            metrics::Unit::Count,
            "the number of partitions of a resource whose external view differs from the ideal state"
        );
        metrics::register_gauge!(METRIC_RESOURCE_ERRORS, metrics::Unit::Count, "the number of replicas of a resource in the error state");
        Self
    }
}

impl Default for MetricsMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMonitor for MetricsMonitor {
    fn cluster_status(&self, status: &ClusterStatus) {
        metrics::gauge!(METRIC_LIVE_INSTANCES, status.live_instances as f64);
        metrics::gauge!(METRIC_TOTAL_INSTANCES, status.total_instances as f64);
        metrics::gauge!(METRIC_DISABLED_INSTANCES, status.disabled_instances as f64);
        metrics::gauge!(METRIC_DISABLED_PARTITIONS, status.disabled_partitions as f64);
    }

    fn external_view_updated(&self, status: &ResourceStatus) {
        let resource = status.resource.clone();
        metrics::gauge!(METRIC_RESOURCE_PARTITIONS, status.partitions as f64, "resource" => resource.clone());
        metrics::gauge!(METRIC_RESOURCE_DIVERGED, status.diverged_partitions as f64, "resource" => resource.clone());
        metrics::gauge!(METRIC_RESOURCE_ERRORS, status.error_replicas as f64, "resource" => resource);
    }

    fn resource_removed(&self, resource: &str) {
        metrics::gauge!(METRIC_RESOURCE_PARTITIONS, 0.0, "resource" => resource.to_string());
        metrics::gauge!(METRIC_RESOURCE_DIVERGED, 0.0, "resource" => resource.to_string());
        metrics::gauge!(METRIC_RESOURCE_ERRORS, 0.0, "resource" => resource.to_string());
    }
}
