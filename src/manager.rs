use crate::cluster::RawWorker;
use crate::config::Config;
use crate::coordinator::{self, Artifacts, IngressState, Snapshot};
use crate::crd::*;
use crate::errors::*;
use crate::nginx::{GRPC_SERVER_PORT, NGINX_PORT, NGINX_TLS_PORT};
use crate::peers::PeerData;
use crate::status::OperationalStatus;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use log::{debug, info, warn};
use maplit::btreemap;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Field manager for server-side apply.
const FIELD_MANAGER: &str = "pyroscope-coordinator";

pub const WORKLOAD_CONFIG_KEY: &str = "pyroscope.yaml";
pub const PROXY_CONFIG_KEY: &str = "nginx.conf";
pub const DYNAMIC_CONFIG_KEY: &str = "dynamic.yaml";
pub const STATIC_CONFIG_KEY: &str = "static.yaml";

// Context for our reconciler
struct Data {
    /// kubernetes client
    client: Client,
    config: Config,
}

async fn reconcile(cluster: Arc<PyroscopeCluster>, ctx: Arc<Data>) -> Result<Action> {
    let name = cluster.name_any();
    let ns = cluster.namespace().ok_or("pyroscope cluster must be namespaced")?;
    debug!("Reconcile PyroscopeCluster {}/{}", ns, name);

    let snapshot = observe(&ctx, &cluster, &ns).await?;
    let mut artifacts = Artifacts::default();
    let status = coordinator::reconcile(&snapshot, &mut artifacts)?;

    publish_peer_data(&ctx, &ns, &artifacts).await;
    // shared outputs are written by one coordinator only, so replicas don't fight over them
    if snapshot.leader {
        apply(&ctx.client, &cluster, &ns, &artifacts).await?;
    } else {
        debug!("not the leader for {}/{}, leaving shared outputs alone", ns, name);
    }
    info!("{}/{} is {}", ns, name, status);

    Ok(Action::requeue(Duration::from_secs(300)))
}

fn error_policy(_cluster: Arc<PyroscopeCluster>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("reconcile failed: {}", error);
    Action::requeue(Duration::from_secs(60))
}

/// Read everything a tick needs from the cluster.
async fn observe(ctx: &Data, cluster: &PyroscopeCluster, ns: &str) -> Result<Snapshot> {
    let name = cluster.name_any();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let workers = pods
        .list(&ListParams::default().labels(&format!("{}={}", CLUSTER_LABEL, name)))
        .await?
        .items
        .iter()
        .filter(|pod| is_running(pod))
        .map(raw_worker)
        .collect();
    let coordinators = pods
        .list(&ListParams::default().labels(&format!("{}={}", COORDINATOR_LABEL, name)))
        .await?
        .items;

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
    let stored = match &cluster.spec.s3_secret {
        Some(secret) => secrets.get_opt(secret).await?.map(|s| secret_data(&s)),
        None => None,
    };
    let (storage, storage_error) = match stored {
        Some(Ok(data)) => (Some(data), None),
        Some(Err(e)) => {
            warn!("rejecting storage credentials for {}/{}: {}", ns, name, e);
            (None, Some(e.to_string()))
        }
        None => (None, None),
    };
    let tls = match &cluster.spec.tls_secret {
        Some(secret) => secrets.get_opt(secret).await?.is_some(),
        None => false,
    };

    Ok(Snapshot {
        workers,
        storage,
        storage_error,
        ingress: cluster.spec.ingress.as_ref().map(ingress_state).unwrap_or_default(),
        tls,
        peers: peer_fqdns(&coordinators, &ctx.config.pod_name),
        hostname: ctx.config.hostname()?,
        model: ns.to_string(),
        app: name,
        leader: is_leader(&coordinators, &ctx.config.pod_name),
        retention: cluster.spec.retention(),
    })
}

/// Annotate our own pod with the FQDN the other coordinators should route to.
async fn publish_peer_data(ctx: &Data, ns: &str, artifacts: &Artifacts) {
    let peer = match &artifacts.peer_data {
        Some(peer) => peer,
        None => return,
    };
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let patch = json!({ "metadata": { "annotations": peer.dump() } });
    if let Err(e) = pods
        .patch(&ctx.config.pod_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!("could not publish fqdn on pod {}: {}", ctx.config.pod_name, e);
    }
}

/// Push the tick's artifacts out with server-side apply.
async fn apply(client: &Client, cluster: &PyroscopeCluster, ns: &str, artifacts: &Artifacts) -> Result<()> {
    let name = cluster.name_any();
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let owners: Vec<_> = cluster.controller_owner_ref(&()).into_iter().collect();
    let meta = |object: &str| ObjectMeta {
        name: Some(object.to_string()),
        namespace: Some(ns.to_string()),
        owner_references: Some(owners.clone()),
        labels: Some(btreemap! {
            "app.kubernetes.io/managed-by".to_string() => FIELD_MANAGER.to_string(),
        }),
        ..ObjectMeta::default()
    };

    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
    let config_name = format!("{}-config", name);
    let workload = match &artifacts.pyroscope_yaml {
        Some(yaml) => Some(yaml.clone()),
        // keep serving the last good config while storage is missing
        None => configmaps
            .get_opt(&config_name)
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(WORKLOAD_CONFIG_KEY)),
    };
    let mut data = BTreeMap::new();
    if let Some(yaml) = workload {
        data.insert(WORKLOAD_CONFIG_KEY.to_string(), yaml);
    }
    if let Some(conf) = &artifacts.nginx_conf {
        data.insert(PROXY_CONFIG_KEY.to_string(), conf.clone());
    }
    let cm = ConfigMap {
        metadata: meta(config_name.as_str()),
        data: Some(data),
        ..ConfigMap::default()
    };
    configmaps.patch(&config_name, &params, &Patch::Apply(&cm)).await?;

    if let Some(routing) = &artifacts.routing {
        let mut data = BTreeMap::new();
        if let Some(dynamic) = &routing.dynamic {
            data.insert(DYNAMIC_CONFIG_KEY.to_string(), serde_yaml::to_string(dynamic)?);
        }
        data.insert(STATIC_CONFIG_KEY.to_string(), serde_yaml::to_string(&routing.static_config)?);
        let traefik_name = format!("{}-traefik", name);
        let cm = ConfigMap {
            metadata: meta(traefik_name.as_str()),
            data: Some(data),
            ..ConfigMap::default()
        };
        configmaps.patch(&traefik_name, &params, &Patch::Apply(&cm)).await?;
    }

    let services: Api<Service> = Api::namespaced(client.clone(), ns);
    let svc = Service {
        metadata: meta(name.as_str()),
        spec: Some(ServiceSpec {
            selector: Some(btreemap! { COORDINATOR_LABEL.to_string() => name.clone() }),
            ports: Some(artifacts.ports.iter().map(|port| service_port(*port)).collect()),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    };
    services.patch(&name, &params, &Patch::Apply(&svc)).await?;

    if let Some(status) = &artifacts.status {
        let clusters: Api<PyroscopeCluster> = Api::namespaced(client.clone(), ns);
        let status = cluster_status(status, artifacts);
        clusters
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(json!({ "status": status })))
            .await?;
    }
    Ok(())
}

fn is_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

/// `hostname.subdomain.namespace.svc.cluster.local` when the pod has a stable name, else its IP.
fn pod_address(pod: &Pod) -> Option<String> {
    let stable = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.hostname.as_ref().zip(spec.subdomain.as_ref()));
    if let (Some((hostname, subdomain)), Some(ns)) = (stable, pod.namespace()) {
        return Some(format!("{}.{}.{}.svc.cluster.local", hostname, subdomain, ns));
    }
    pod.status.as_ref().and_then(|s| s.pod_ip.clone())
}

fn raw_worker(pod: &Pod) -> RawWorker {
    RawWorker {
        unit: pod.name_any(),
        roles: pod.labels().get(ROLE_LABEL).cloned().into_iter().collect(),
        address: pod_address(pod),
    }
}

/// FQDNs other running coordinators have published; ourselves and silent peers are left out.
fn peer_fqdns(coordinators: &[Pod], own_pod: &str) -> Vec<String> {
    coordinators
        .iter()
        .filter(|pod| is_running(pod) && pod.name_any() != own_pod)
        .filter_map(|pod| PeerData::load(pod.annotations()))
        .map(|peer| peer.fqdn)
        .collect()
}

/// The running coordinator with the smallest name leads.
///
/// A pending or terminating pod never leads, so a stuck replica can't stall the others. Lone
/// operators outside a labelled pod lead too.
fn is_leader(coordinators: &[Pod], own_pod: &str) -> bool {
    coordinators
        .iter()
        .filter(|pod| is_running(pod))
        .map(|pod| pod.name_any())
        .min()
        .map_or(true, |leader| leader == own_pod)
}

/// Secret values as strings. Bytes that aren't UTF-8 are refused rather than patched up.
fn secret_data(secret: &Secret) -> Result<BTreeMap<String, String>> {
    let mut data = BTreeMap::new();
    for (key, value) in secret.data.iter().flatten() {
        let value = String::from_utf8(value.0.clone())
            .map_err(|_| Error::from(ErrorKind::UndecodableStorageField(key.clone())))?;
        data.insert(key.clone(), value);
    }
    data.extend(secret.string_data.clone().unwrap_or_default());
    Ok(data)
}

fn ingress_state(spec: &IngressSpec) -> IngressState {
    IngressState {
        ready: spec.external_host.is_some(),
        scheme: Some(spec.scheme.clone().unwrap_or_else(|| "http".into())),
        external_host: spec.external_host.clone(),
    }
}

fn service_port(port: u16) -> ServicePort {
    let name = match port {
        NGINX_PORT => "http".to_string(),
        NGINX_TLS_PORT => "https".to_string(),
        GRPC_SERVER_PORT => "grpc".to_string(),
        other => format!("port-{}", other),
    };
    ServicePort {
        name: Some(name),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        ..ServicePort::default()
    }
}

fn cluster_status(status: &OperationalStatus, artifacts: &Artifacts) -> PyroscopeClusterStatus {
    let profiling = artifacts.profiling.as_ref();
    PyroscopeClusterStatus {
        state: status.name.as_str().to_string(),
        message: status.message.clone(),
        url: artifacts.ui_url.clone(),
        otlp_grpc_endpoint_url: profiling.map(|p| p.otlp_grpc_endpoint_url.clone()),
        insecure: profiling.map(|p| p.insecure),
    }
}

fn cluster_ref(pod: &Pod, label: &str) -> Option<ObjectRef<PyroscopeCluster>> {
    let name = pod.labels().get(label)?;
    Some(ObjectRef::new(name).within(&pod.namespace()?))
}

pub struct Manager {}

/// Manager that owns a Controller for PyroscopeCluster
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(client: Client, config: Config) -> Result<(Self, BoxFuture<'static, ()>)> {
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        crds.get("pyroscopeclusters.pyroscope.dev")
            .await
            .chain_err(|| "install the pyroscopecluster crd first")?;

        let ns = config.namespace.clone();
        let clusters = Api::<PyroscopeCluster>::namespaced(client.clone(), &ns);
        let configmaps = Api::<ConfigMap>::namespaced(client.clone(), &ns);
        let services = Api::<Service>::namespaced(client.clone(), &ns);
        let pods = Api::<Pod>::namespaced(client.clone(), &ns);
        let context = Arc::new(Data { client, config });

        let drainer = Controller::new(clusters, watcher::Config::default())
            .owns(configmaps, watcher::Config::default())
            .owns(services, watcher::Config::default())
            .watches(pods.clone(), watcher::Config::default().labels(CLUSTER_LABEL), |pod| {
                cluster_ref(&pod, CLUSTER_LABEL)
            })
            .watches(pods, watcher::Config::default().labels(COORDINATOR_LABEL), |pod| {
                cluster_ref(&pod, COORDINATOR_LABEL)
            })
            .run(reconcile, error_policy, context)
            .for_each(|o| {
                info!("Reconciled {:?}", o);
                futures::future::ready(())
            })
            .boxed();

        Ok((Self {}, drainer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiling::ProfilingEndpoint;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn stable_pod_address_wins() {
        let p = pod(json!({
            "metadata": {"name": "worker-0", "namespace": "obs"},
            "spec": {"containers": [], "hostname": "worker-0", "subdomain": "workers"},
            "status": {"podIP": "10.0.0.4", "phase": "Running"},
        }));
        assert_eq!(pod_address(&p).as_deref(), Some("worker-0.workers.obs.svc.cluster.local"));
    }

    #[test]
    fn pod_ip_fallback_and_absence() {
        let p = pod(json!({
            "metadata": {"name": "worker-0", "namespace": "obs"},
            "status": {"podIP": "10.0.0.4"},
        }));
        assert_eq!(pod_address(&p).as_deref(), Some("10.0.0.4"));
        let p = pod(json!({"metadata": {"name": "worker-0", "namespace": "obs"}}));
        assert_eq!(pod_address(&p), None);
    }

    #[test]
    fn worker_roles_from_label() {
        let p = pod(json!({
            "metadata": {
                "name": "worker-0",
                "namespace": "obs",
                "labels": {"pyroscope.dev/cluster": "pyro", "pyroscope.dev/role": "ingester"},
            },
            "status": {"podIP": "10.0.0.4", "phase": "Running"},
        }));
        assert!(is_running(&p));
        let worker = raw_worker(&p);
        assert_eq!(worker.unit, "worker-0");
        assert_eq!(worker.roles, vec!["ingester".to_string()]);
        assert_eq!(cluster_ref(&p, CLUSTER_LABEL), Some(ObjectRef::new("pyro").within("obs")));
    }

    fn coordinator(name: &str, phase: &str) -> Pod {
        pod(json!({
            "metadata": {"name": name, "annotations": {"pyroscope.dev/fqdn": format!("{}.svc", name)}},
            "status": {"phase": phase},
        }))
    }

    #[test]
    fn smallest_coordinator_leads() {
        let coordinators: Vec<Pod> = ["coord-1", "coord-0", "coord-2"]
            .iter()
            .map(|name| coordinator(name, "Running"))
            .collect();
        assert!(is_leader(&coordinators, "coord-0"));
        assert!(!is_leader(&coordinators, "coord-1"));
        assert!(is_leader(&[], "anything"));
    }

    #[test]
    fn stuck_coordinators_never_lead() {
        let terminating = pod(json!({
            "metadata": {"name": "coord-1", "deletionTimestamp": "2026-01-01T00:00:00Z"},
            "status": {"phase": "Running"},
        }));
        let coordinators = vec![
            coordinator("coord-0", "Pending"),
            terminating,
            coordinator("coord-2", "Running"),
            coordinator("coord-3", "Running"),
        ];
        assert!(is_leader(&coordinators, "coord-2"));
        assert!(!is_leader(&coordinators, "coord-3"));
        assert!(!is_leader(&coordinators, "coord-0"));
        assert_eq!(peer_fqdns(&coordinators, "coord-2"), vec!["coord-3.svc".to_string()]);
    }

    #[test]
    fn peers_skip_self_and_silent_pods() {
        let coordinators = vec![
            coordinator("coord-0", "Running"),
            coordinator("coord-1", "Running"),
            pod(json!({"metadata": {"name": "coord-2"}, "status": {"phase": "Running"}})),
        ];
        assert_eq!(peer_fqdns(&coordinators, "coord-0"), vec!["coord-1.svc".to_string()]);
    }

    #[test]
    fn secrets_decode_to_strings() {
        let secret: Secret = serde_json::from_value(json!({
            "metadata": {"name": "s3"},
            "data": {"bucket": "cHlybw=="},
            "stringData": {"endpoint": "http://minio:9000"},
        }))
        .unwrap();
        assert_eq!(
            secret_data(&secret).unwrap(),
            btreemap! {
                "bucket".to_string() => "pyro".to_string(),
                "endpoint".to_string() => "http://minio:9000".to_string(),
            }
        );
    }

    #[test]
    fn non_utf8_secret_values_are_refused() {
        let secret: Secret = serde_json::from_value(json!({
            "metadata": {"name": "s3"},
            "data": {"bucket": "cHlybw==", "secret-key": "/w=="},
        }))
        .unwrap();
        match secret_data(&secret).unwrap_err().kind() {
            ErrorKind::UndecodableStorageField(field) => assert_eq!(field, "secret-key"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn status_carries_profiling_endpoint() {
        let artifacts = Artifacts {
            profiling: Some(ProfilingEndpoint::new("pyro.example.com", 42424, false)),
            ui_url: Some("https://pyro.example.com/obs-pyro".into()),
            ..Artifacts::default()
        };
        let status = cluster_status(&OperationalStatus::active("[coordinator] Degraded."), &artifacts);
        assert_eq!(status.state, "active");
        assert_eq!(status.url.as_deref(), Some("https://pyro.example.com/obs-pyro"));
        assert_eq!(status.otlp_grpc_endpoint_url.as_deref(), Some("pyro.example.com:42424"));
        assert_eq!(status.insecure, Some(false));

        let status = cluster_status(&OperationalStatus::missing_s3(), &Artifacts::default());
        assert_eq!(status.state, "blocked");
        assert_eq!(status.url, None);
        assert_eq!(status.insecure, None);
    }

    #[test]
    fn ports_are_named() {
        assert_eq!(service_port(8080).name.as_deref(), Some("http"));
        assert_eq!(service_port(443).name.as_deref(), Some("https"));
        assert_eq!(service_port(42424).name.as_deref(), Some("grpc"));
    }
}
