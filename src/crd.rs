use crate::retention::RetentionConfig;
use kube_derive::CustomResource;
use serde::{Deserialize, Serialize};

/// Labels tying pods to a cluster.
pub const CLUSTER_LABEL: &str = "pyroscope.dev/cluster";
pub const ROLE_LABEL: &str = "pyroscope.dev/role";
pub const COORDINATOR_LABEL: &str = "pyroscope.dev/coordinator";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "pyroscope.dev",
    version = "v1alpha1",
    kind = "PyroscopeCluster",
    status = "PyroscopeClusterStatus",
    shortname = "pyro",
    schema = "disabled",
    namespaced
)]
pub struct PyroscopeClusterSpec {
    /// Delete blocks containing samples older than this. `0` disables retention.
    pub retention_period: Option<String>,
    /// Time before a block marked for deletion is deleted from the bucket.
    pub deletion_delay: Option<String>,
    /// How often the compactor runs blocks cleanup and maintenance.
    pub cleanup_interval: Option<String>,
    /// Secret holding the object storage credentials.
    pub s3_secret: Option<String>,
    /// Secret holding the coordinator's certificate; TLS is on once it exists.
    pub tls_secret: Option<String>,
    pub ingress: Option<IngressSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct IngressSpec {
    /// `http` or `https`.
    pub scheme: Option<String>,
    pub external_host: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PyroscopeClusterStatus {
    /// `active` or `blocked`.
    pub state: String,
    pub message: String,
    /// Where users reach the UI: the ingress URL when there is one, else the service.
    pub url: Option<String>,
    /// Where producers push profiles to.
    pub otlp_grpc_endpoint_url: Option<String>,
    pub insecure: Option<bool>,
}

impl PyroscopeClusterSpec {
    /// Retention settings, defaulting whatever is unset.
    pub fn retention(&self) -> RetentionConfig {
        let mut retention = RetentionConfig::default();
        if let Some(period) = &self.retention_period {
            retention.retention_period = period.clone();
        }
        if let Some(delay) = &self.deletion_delay {
            retention.deletion_delay = delay.clone();
        }
        if let Some(interval) = &self.cleanup_interval {
            retention.cleanup_interval = interval.clone();
        }
        retention
    }
}
