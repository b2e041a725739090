//! The reconciliation driver.
//!
//! Every tick recomputes everything the coordinator owns from what is observed right now; nothing
//! is carried over from the previous tick.

use crate::cluster::{gather_roles, validate_workers, ClusterAddresses, RawWorker};
use crate::coherence::{compute_coherence, missing_roles, CoherenceState};
use crate::errors::*;
use crate::nginx::{NginxConfig, GRPC_SERVER_PORT, NGINX_PORT, NGINX_TLS_PORT};
use crate::peers::{get_fqdns, PeerData};
use crate::profiling::ProfilingEndpoint;
use crate::pyroscope::{Pyroscope, WorkloadInputs};
use crate::retention::RetentionConfig;
use crate::roles::RolesConfig;
use crate::s3::StorageCredentials;
use crate::status::{derive_operational_status, OperationalStatus};
use crate::traefik::{ingress_config, Endpoint, Protocol, RoutingDocument, RoutingInputs};
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// What the ingress in front of the coordinators currently reports.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressState {
    pub ready: bool,
    pub scheme: Option<String>,
    pub external_host: Option<String>,
}

impl IngressState {
    pub fn is_ready(&self) -> bool {
        self.ready && self.external_host.is_some()
    }

    /// `{scheme}://{external_host}{prefix}`, once the ingress reports both.
    pub fn external_url(&self, prefix: &str) -> Option<String> {
        if !self.ready {
            return None;
        }
        match (&self.scheme, &self.external_host) {
            (Some(scheme), Some(host)) => Some(format!("{}://{}{}", scheme, host, prefix)),
            _ => None,
        }
    }
}

/// Read side of a tick.
pub trait Observer {
    /// Worker units as they presented themselves, unvalidated.
    fn observed_workers(&self) -> Vec<RawWorker>;
    /// The storage integration's key/value data, if it is related at all.
    ///
    /// An error means the data is there but could not be read faithfully.
    fn storage_credentials(&self) -> Option<Result<BTreeMap<String, String>>>;
    fn ingress_state(&self) -> IngressState;
    fn is_tls_material_present(&self) -> bool;
    /// FQDNs published by the other coordinators.
    fn peer_fqdns(&self) -> Vec<String>;
    fn self_hostname(&self) -> String;
    fn model_name(&self) -> String;
    fn app_name(&self) -> String;
    fn is_leader(&self) -> bool;
    fn retention_config(&self) -> RetentionConfig;
}

/// Write side of a tick.
pub trait Publisher {
    fn set_ports(&mut self, ports: &[u16]);
    fn publish_peer_fqdn(&mut self, peer: &PeerData);
    fn submit_ingress(&mut self, routing: &RoutingDocument);
    fn publish_profiling_endpoint(&mut self, endpoint: &ProfilingEndpoint);
    /// Where users reach the Pyroscope UI and API.
    fn publish_ui_url(&mut self, url: &str);
    fn write_proxy_config(&mut self, nginx_conf: &str);
    fn write_workload_config(&mut self, pyroscope_yaml: &str);
    fn set_status(&mut self, status: &OperationalStatus);
}

/// Observed facts, materialized ahead of a tick.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub workers: Vec<RawWorker>,
    pub storage: Option<BTreeMap<String, String>>,
    /// Why the storage data could not be read, overriding `storage`.
    pub storage_error: Option<String>,
    pub ingress: IngressState,
    pub tls: bool,
    pub peers: Vec<String>,
    pub hostname: String,
    pub model: String,
    pub app: String,
    pub leader: bool,
    pub retention: RetentionConfig,
}

impl Observer for Snapshot {
    fn observed_workers(&self) -> Vec<RawWorker> {
        self.workers.clone()
    }

    fn storage_credentials(&self) -> Option<Result<BTreeMap<String, String>>> {
        if let Some(reason) = &self.storage_error {
            return Some(Err(reason.as_str().into()));
        }
        self.storage.clone().map(Ok)
    }

    fn ingress_state(&self) -> IngressState {
        self.ingress.clone()
    }

    fn is_tls_material_present(&self) -> bool {
        self.tls
    }

    fn peer_fqdns(&self) -> Vec<String> {
        self.peers.clone()
    }

    fn self_hostname(&self) -> String {
        self.hostname.clone()
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn app_name(&self) -> String {
        self.app.clone()
    }

    fn is_leader(&self) -> bool {
        self.leader
    }

    fn retention_config(&self) -> RetentionConfig {
        self.retention.clone()
    }
}

/// Everything a tick produced, waiting to be applied.
#[derive(Clone, Debug, Default)]
pub struct Artifacts {
    pub ports: Vec<u16>,
    pub peer_data: Option<PeerData>,
    pub routing: Option<RoutingDocument>,
    pub profiling: Option<ProfilingEndpoint>,
    pub ui_url: Option<String>,
    pub nginx_conf: Option<String>,
    pub pyroscope_yaml: Option<String>,
    pub status: Option<OperationalStatus>,
}

impl Publisher for Artifacts {
    fn set_ports(&mut self, ports: &[u16]) {
        self.ports = ports.to_vec();
    }

    fn publish_peer_fqdn(&mut self, peer: &PeerData) {
        self.peer_data = Some(peer.clone());
    }

    fn submit_ingress(&mut self, routing: &RoutingDocument) {
        self.routing = Some(routing.clone());
    }

    fn publish_profiling_endpoint(&mut self, endpoint: &ProfilingEndpoint) {
        self.profiling = Some(endpoint.clone());
    }

    fn publish_ui_url(&mut self, url: &str) {
        self.ui_url = Some(url.to_string());
    }

    fn write_proxy_config(&mut self, nginx_conf: &str) {
        self.nginx_conf = Some(nginx_conf.to_string());
    }

    fn write_workload_config(&mut self, pyroscope_yaml: &str) {
        self.pyroscope_yaml = Some(pyroscope_yaml.to_string());
    }

    fn set_status(&mut self, status: &OperationalStatus) {
        self.status = Some(status.clone());
    }
}

/// The endpoints exposed through the ingress.
pub fn ingress_endpoints(http_port: u16) -> Vec<Endpoint> {
    vec![
        Endpoint::new("web", Protocol::Http, http_port),
        Endpoint::new("pyroscope_grpc", Protocol::Grpc, GRPC_SERVER_PORT),
    ]
}

/// `{app}.{model}.svc...`, the cluster-local name of the service fronting every coordinator.
///
/// Falls back to the unit's own FQDN when it carries no `svc` label.
pub fn service_hostname(fqdn: &str, model: &str, app: &str) -> String {
    let labels: Vec<&str> = fqdn.split('.').collect();
    match labels.iter().position(|label| *label == "svc") {
        Some(idx) => format!("{}.{}.{}", app, model, labels[idx..].join(".")),
        None => fqdn.to_string(),
    }
}

/// Run one tick: read everything from `observer`, push every artifact into `publisher`.
///
/// Returns the status that was set.
pub fn reconcile<O, P>(observer: &O, publisher: &mut P) -> Result<OperationalStatus>
where
    O: Observer,
    P: Publisher,
{
    let tls = observer.is_tls_material_present();
    let http_port = if tls { NGINX_TLS_PORT } else { NGINX_PORT };
    publisher.set_ports(&[http_port, GRPC_SERVER_PORT]);

    let hostname = observer.self_hostname();
    publisher.publish_peer_fqdn(&PeerData {
        fqdn: hostname.clone(),
    });

    let model = observer.model_name();
    let app = observer.app_name();
    let prefix = format!("/{}-{}", model, app);
    let ingress = observer.ingress_state();

    if observer.is_leader() {
        let fqdns = get_fqdns(&hostname, &observer.peer_fqdns());
        let endpoints = ingress_endpoints(http_port);
        let routing = ingress_config(&RoutingInputs {
            endpoints: &endpoints,
            coordinator_fqdns: &fqdns,
            model_name: &model,
            app_name: &app,
            ingressed: ingress.is_ready(),
            tls,
            prefix: &prefix,
        })?;
        publisher.submit_ingress(&routing);
    }

    let service_hostname = service_hostname(&hostname, &model, &app);
    let external_url = ingress.external_url(&prefix);
    let internal_url = format!(
        "{}://{}:{}",
        if tls { "https" } else { "http" },
        service_hostname,
        http_port
    );
    let ui_url = external_url.as_deref().unwrap_or(internal_url.as_str());
    publisher.publish_ui_url(ui_url);
    publisher.publish_profiling_endpoint(&profiling_endpoint(&ingress, &service_hostname, ui_url));

    let workers = validate_workers(&observer.observed_workers());
    let addresses = ClusterAddresses::gather(&workers);
    publisher.write_proxy_config(&NginxConfig::new(hostname.as_str(), tls).render(&addresses)?);

    let retention = observer.retention_config();
    let retention_error = retention.validate().err();
    let retention = match retention_error {
        Some(ref e) => {
            warn!("retention settings rejected, disabling retention: {}", e);
            RetentionConfig::disabled()
        }
        None => retention,
    };

    let storage = observer.storage_credentials().map(|data| {
        let creds = StorageCredentials::from_databag(&data?)?;
        creds.validate()?;
        Ok::<_, Error>(creds)
    });
    // storage problems are reported through the status; the rest of the tick goes on
    let storage_error = match storage {
        Some(Ok(ref creds)) => {
            let inputs = WorkloadInputs {
                addresses: &addresses,
                storage: Some(creds),
                external_url: Some(ui_url),
                tls,
                retention: &retention,
            };
            match Pyroscope::new(hostname.as_str()).config(&inputs) {
                Ok(yaml) => {
                    publisher.write_workload_config(&yaml);
                    None
                }
                Err(e) => Some(format!("[coordinator] {}", e)),
            }
        }
        Some(Err(e)) => Some(format!("[s3] {}", e)),
        None => Some(OperationalStatus::missing_s3().message),
    };

    let counts = gather_roles(&workers);
    let roles = RolesConfig::pyroscope();
    let state = compute_coherence(&counts, &roles);
    debug!("role counts {:?}, coherence {:?}", counts, state);

    let status = if let Some(e) = retention_error {
        OperationalStatus::blocked(e.to_string())
    } else if workers.is_empty() {
        OperationalStatus::missing_workers()
    } else if state == CoherenceState::Blocked {
        OperationalStatus::inconsistent(&missing_roles(&counts, &roles.minimal))
    } else if let Some(reason) = storage_error {
        OperationalStatus::blocked(reason)
    } else {
        derive_operational_status(state)
    };
    info!("coordinator status: {}", status);
    publisher.set_status(&status);
    Ok(status)
}

/// gRPC twin of `ui_url`: same host choice, and TLS exactly when `ui_url` is https.
fn profiling_endpoint(ingress: &IngressState, service_hostname: &str, ui_url: &str) -> ProfilingEndpoint {
    let host = match &ingress.external_host {
        Some(host) if ingress.external_url("").is_some() => host.as_str(),
        _ => service_hostname,
    };
    ProfilingEndpoint::new(host, GRPC_SERVER_PORT, !ui_url.starts_with("https://"))
}
