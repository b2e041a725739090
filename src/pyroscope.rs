//! Pyroscope workload configuration.
//!
//! The document is rebuilt from scratch on every reconciliation and only turned into YAML at the
//! very end, so the shape of the file is fixed by the types below. Field names follow upstream's
//! configuration reference: https://grafana.com/docs/pyroscope/latest/configure-server/

use crate::cluster::ClusterAddresses;
use crate::errors::*;
use crate::retention::RetentionConfig;
use crate::roles::PyroscopeRole;
use crate::s3::StorageCredentials;
use serde::{Deserialize, Serialize};
use url::Url;

/// Directory the workload stores its local data in.
pub const DATA_PATH: &str = "/pyroscope-data";
/// Cert paths on the workload container.
pub const TLS_CERT_PATH: &str = "/etc/worker/server.cert";
pub const TLS_KEY_PATH: &str = "/etc/worker/private.key";
pub const TLS_CA_PATH: &str = "/usr/local/share/ca-certificates/ca.crt";

/// Gossip port every worker binds and joins on.
pub const MEMBERLIST_PORT: u16 = 7946;
/// HTTP port the workload serves its API, UI and metrics on.
pub const HTTP_SERVER_PORT: u16 = 4040;

const KVSTORE_MEMBERLIST: &str = "memberlist";
const STORAGE_BACKEND_S3: &str = "s3";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kvstore {
    pub store: String,
}

impl Default for Kvstore {
    fn default() -> Self {
        Kvstore {
            store: KVSTORE_MEMBERLIST.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ring {
    pub kvstore: Kvstore,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_factor: Option<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lifecycler {
    pub ring: Ring,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardingRing {
    pub replication_factor: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactorShardingRing {
    pub kvstore: Kvstore,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Api {
    /// The only dashed key in the whole document.
    #[serde(rename = "base-url", default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub http_listen_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_tls_config: Option<TlsConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distributor {
    pub ring: Ring,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ingester {
    pub lifecycler: Lifecycler,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreGateway {
    pub sharding_ring: ShardingRing,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Memberlist {
    pub bind_port: u16,
    pub join_members: Vec<String>,
    pub tls_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct S3Storage {
    pub bucket_name: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub insecure: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    pub backend: String,
    pub s3: S3Storage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Compactor {
    pub sharding_ring: CompactorShardingRing,
    pub deletion_delay: String,
    pub cleanup_interval: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Db {
    pub data_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcClient {
    pub tls_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
}

/// Any block whose only content is a grpc client config (frontend, frontend worker, query
/// scheduler).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcClientBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_client_config: Option<GrpcClient>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub compactor_blocks_retention_period: String,
}

/// The complete configuration file of a Pyroscope worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PyroscopeConfig {
    pub api: Api,
    pub server: Server,
    pub distributor: Distributor,
    pub frontend: GrpcClientBlock,
    pub frontend_worker: GrpcClientBlock,
    pub query_scheduler: GrpcClientBlock,
    pub ingester: Ingester,
    pub store_gateway: StoreGateway,
    pub memberlist: Memberlist,
    pub storage: Storage,
    pub compactor: Compactor,
    pub pyroscopedb: Db,
    pub limits: Limits,
}

impl PyroscopeConfig {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Everything the workload configuration depends on.
#[derive(Clone, Copy, Debug)]
pub struct WorkloadInputs<'a> {
    pub addresses: &'a ClusterAddresses,
    pub storage: Option<&'a StorageCredentials>,
    /// The most external URL the coordinator is reachable at, if any.
    pub external_url: Option<&'a str>,
    pub tls: bool,
    pub retention: &'a RetentionConfig,
}

/// Builds the Pyroscope workload configuration.
#[derive(Clone, Debug)]
pub struct Pyroscope {
    /// This node's hostname; peers verify our certificate against it.
    hostname: String,
    memberlist_port: u16,
    http_server_port: u16,
}

impl Pyroscope {
    pub fn new(hostname: impl Into<String>) -> Self {
        Pyroscope {
            hostname: hostname.into(),
            memberlist_port: MEMBERLIST_PORT,
            http_server_port: HTTP_SERVER_PORT,
        }
    }

    /// Render the configuration file.
    pub fn config(&self, inputs: &WorkloadInputs) -> Result<String> {
        self.build(inputs)?.to_yaml()
    }

    pub fn build(&self, inputs: &WorkloadInputs) -> Result<PyroscopeConfig> {
        let storage = match inputs.storage {
            Some(creds) => self.storage_config(creds)?,
            None => bail!(ErrorKind::MissingStorage),
        };
        Ok(PyroscopeConfig {
            api: self.api_config(inputs.external_url)?,
            server: self.server_config(inputs.tls),
            distributor: Distributor::default(),
            frontend: self.grpc_client_block(inputs.tls),
            frontend_worker: self.grpc_client_block(inputs.tls),
            query_scheduler: self.grpc_client_block(inputs.tls),
            ingester: self.ingester_config(inputs.addresses),
            store_gateway: self.store_gateway_config(inputs.addresses),
            memberlist: self.memberlist_config(inputs.addresses, inputs.tls),
            storage,
            compactor: Compactor {
                sharding_ring: CompactorShardingRing::default(),
                deletion_delay: inputs.retention.deletion_delay.clone(),
                cleanup_interval: inputs.retention.cleanup_interval.clone(),
            },
            pyroscopedb: Db {
                data_path: DATA_PATH.into(),
            },
            limits: Limits {
                compactor_blocks_retention_period: inputs.retention.retention_period.clone(),
            },
        })
    }

    fn api_config(&self, external_url: Option<&str>) -> Result<Api> {
        let url = match external_url.filter(|u| !u.is_empty()) {
            Some(url) => Url::parse(url)?,
            None => return Ok(Api::default()),
        };
        // served at the ingress root; a "/" base-url confuses the UI's own routing
        match url.path() {
            "" | "/" => Ok(Api::default()),
            path => Ok(Api {
                base_url: Some(path.to_string()),
            }),
        }
    }

    fn server_config(&self, tls: bool) -> Server {
        Server {
            http_listen_port: self.http_server_port,
            http_tls_config: if tls {
                Some(TlsConfig {
                    cert_file: TLS_CERT_PATH.into(),
                    key_file: TLS_KEY_PATH.into(),
                })
            } else {
                None
            },
        }
    }

    fn ingester_config(&self, addrs: &ClusterAddresses) -> Ingester {
        Ingester {
            lifecycler: Lifecycler {
                ring: Ring {
                    kvstore: Kvstore::default(),
                    replication_factor: Some(replication_factor(addrs.count(PyroscopeRole::Ingester))),
                },
            },
        }
    }

    fn store_gateway_config(&self, addrs: &ClusterAddresses) -> StoreGateway {
        StoreGateway {
            sharding_ring: ShardingRing {
                replication_factor: replication_factor(addrs.count(PyroscopeRole::StoreGateway)),
            },
        }
    }

    fn memberlist_config(&self, addrs: &ClusterAddresses, tls: bool) -> Memberlist {
        let join_members = addrs.all.iter().map(|peer| format!("{}:{}", peer, self.memberlist_port)).collect();
        let mut memberlist = Memberlist {
            bind_port: self.memberlist_port,
            join_members,
            ..Default::default()
        };
        if tls {
            memberlist.tls_enabled = true;
            memberlist.tls_ca_path = Some(TLS_CA_PATH.into());
            memberlist.tls_cert_path = Some(TLS_CERT_PATH.into());
            memberlist.tls_key_path = Some(TLS_KEY_PATH.into());
            memberlist.tls_server_name = Some(self.hostname.clone());
        }
        memberlist
    }

    fn storage_config(&self, creds: &StorageCredentials) -> Result<Storage> {
        creds.validate()?;
        Ok(Storage {
            backend: STORAGE_BACKEND_S3.into(),
            s3: S3Storage {
                bucket_name: creds.bucket_name.clone(),
                endpoint: creds.endpoint.clone(),
                access_key_id: creds.access_key_id.clone(),
                secret_access_key: creds.secret_access_key.clone(),
                region: creds.region.clone(),
                insecure: creds.insecure,
            },
        })
    }

    fn grpc_client_block(&self, tls: bool) -> GrpcClientBlock {
        if !tls {
            return GrpcClientBlock::default();
        }
        GrpcClientBlock {
            grpc_client_config: Some(GrpcClient {
                tls_enabled: true,
                tls_cert_path: Some(TLS_CERT_PATH.into()),
                tls_key_path: Some(TLS_KEY_PATH.into()),
                tls_ca_path: Some(TLS_CA_PATH.into()),
                tls_server_name: Some(self.hostname.clone()),
            }),
        }
    }
}

/// Two tiers only: full replication once there are enough replicas to hold it, none before.
pub fn replication_factor(replicas: usize) -> u8 {
    if replicas >= 3 {
        3
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{validate_workers, RawWorker};
    use serde_yaml::Value;

    fn workers(role: &str, addrs: &[&str]) -> ClusterAddresses {
        let raw: Vec<_> = addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| RawWorker {
                unit: format!("worker/{}", i),
                roles: vec![role.to_string()],
                address: Some(addr.to_string()),
            })
            .collect();
        ClusterAddresses::gather(&validate_workers(&raw))
    }

    fn creds() -> StorageCredentials {
        StorageCredentials {
            bucket_name: "pyroscope".into(),
            endpoint: "1.2.3.4:9000".into(),
            access_key_id: "key".into(),
            secret_access_key: "soverysecret".into(),
            region: None,
            insecure: false,
        }
    }

    fn render(addrs: &ClusterAddresses, external_url: Option<&str>, tls: bool) -> Value {
        let creds = creds();
        let retention = RetentionConfig::default();
        let yaml = Pyroscope::new("coordinator-0.test.svc.cluster.local")
            .config(&WorkloadInputs {
                addresses: addrs,
                storage: Some(&creds),
                external_url,
                tls,
                retention: &retention,
            })
            .unwrap();
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn memberlist_joins_every_worker() {
        let cfg = render(&workers("all", &["w2", "w0", "w1"]), None, false);
        assert_eq!(
            cfg["memberlist"],
            yaml(
                r#"
bind_port: 7946
join_members: ["w0:7946", "w1:7946", "w2:7946"]
tls_enabled: false
"#
            )
        );
    }

    #[test]
    fn memberlist_tls() {
        let cfg = render(&workers("all", &["w0"]), None, true);
        assert_eq!(
            cfg["memberlist"],
            yaml(
                r#"
bind_port: 7946
join_members: ["w0:7946"]
tls_enabled: true
tls_cert_path: /etc/worker/server.cert
tls_key_path: /etc/worker/private.key
tls_ca_path: /usr/local/share/ca-certificates/ca.crt
tls_server_name: coordinator-0.test.svc.cluster.local
"#
            )
        );
    }

    #[test]
    fn server_config() {
        let plain = render(&workers("all", &["w0"]), None, false);
        assert_eq!(plain["server"], yaml("http_listen_port: 4040"));
        let tls = render(&workers("all", &["w0"]), None, true);
        assert_eq!(
            tls["server"],
            yaml(
                r#"
http_listen_port: 4040
http_tls_config:
  cert_file: /etc/worker/server.cert
  key_file: /etc/worker/private.key
"#
            )
        );
    }

    #[test]
    fn grpc_client_configs_only_with_tls() {
        let plain = render(&workers("all", &["w0"]), None, false);
        let tls = render(&workers("all", &["w0"]), None, true);
        for component in ["frontend", "frontend_worker", "query_scheduler"] {
            assert_eq!(plain[component], yaml("{}"), "{}", component);
            assert_eq!(tls[component]["grpc_client_config"]["tls_enabled"], Value::Bool(true));
            assert_eq!(
                tls[component]["grpc_client_config"]["tls_ca_path"],
                Value::String(TLS_CA_PATH.into())
            );
        }
    }

    #[test]
    fn replication_tiers() {
        for (n, expected) in [(1, 1), (2, 1), (3, 3), (4, 3)] {
            let addrs: Vec<String> = (0..n).map(|i| format!("w{}", i)).collect();
            let addrs: Vec<&str> = addrs.iter().map(String::as_str).collect();
            let ingesters = render(&workers("ingester", &addrs), None, false);
            assert_eq!(
                ingesters["ingester"],
                yaml(&format!(
                    "lifecycler: {{ring: {{kvstore: {{store: memberlist}}, replication_factor: {}}}}}",
                    expected
                )),
                "{} ingesters",
                n
            );
            let gateways = render(&workers("store-gateway", &addrs), None, false);
            assert_eq!(
                gateways["store_gateway"],
                yaml(&format!("sharding_ring: {{replication_factor: {}}}", expected)),
                "{} store gateways",
                n
            );
        }
    }

    #[test]
    fn s3_fields_pass_through() {
        let cfg = render(&workers("all", &["w0"]), None, false);
        assert_eq!(
            cfg["storage"],
            yaml(
                r#"
backend: s3
s3:
  bucket_name: pyroscope
  endpoint: "1.2.3.4:9000"
  access_key_id: key
  secret_access_key: soverysecret
  insecure: false
"#
            )
        );
    }

    #[test]
    fn base_url() {
        let addrs = workers("all", &["w0"]);
        let cases = [
            (None, None),
            (Some(""), None),
            (Some("http://pyroscope.test.svc.cluster.local:8080"), None),
            (Some("https://example.com/"), None),
            (Some("http://example.com/model-pyroscope-k8s"), Some("/model-pyroscope-k8s")),
        ];
        for (url, expected) in cases {
            let cfg = render(&addrs, url, false);
            match expected {
                None => assert_eq!(cfg["api"], yaml("{}"), "{:?}", url),
                Some(path) => assert_eq!(cfg["api"]["base-url"], Value::String(path.into())),
            }
        }
    }

    #[test]
    fn rings_use_memberlist() {
        let cfg = render(&workers("all", &["w0"]), None, false);
        assert_eq!(cfg["distributor"], yaml("ring: {kvstore: {store: memberlist}}"));
        assert_eq!(cfg["compactor"]["sharding_ring"], yaml("kvstore: {store: memberlist}"));
        assert_eq!(cfg["pyroscopedb"], yaml("data_path: /pyroscope-data"));
    }

    #[test]
    fn retention_settings() {
        let cfg = render(&workers("all", &["w0"]), None, false);
        assert_eq!(cfg["limits"], yaml("compactor_blocks_retention_period: 1d"));
        assert_eq!(cfg["compactor"]["deletion_delay"], Value::String("12h".into()));
        assert_eq!(cfg["compactor"]["cleanup_interval"], Value::String("15m".into()));
    }

    #[test]
    fn rendering_is_deterministic() {
        let retention = RetentionConfig::default();
        let creds = creds();
        let pyroscope = Pyroscope::new("host");
        let a = workers("all", &["w0", "w1", "w2"]);
        let b = workers("all", &["w2", "w0", "w1", "w0"]);
        let render = |addresses: &ClusterAddresses| {
            pyroscope
                .config(&WorkloadInputs {
                    addresses,
                    storage: Some(&creds),
                    external_url: Some("http://example.com/x"),
                    tls: true,
                    retention: &retention,
                })
                .unwrap()
        };
        assert_eq!(render(&a), render(&b));
    }

    #[test]
    fn missing_storage_fails() {
        let retention = RetentionConfig::default();
        let addrs = workers("all", &["w0"]);
        let inputs = WorkloadInputs {
            addresses: &addrs,
            storage: None,
            external_url: None,
            tls: false,
            retention: &retention,
        };
        assert!(Pyroscope::new("host").config(&inputs).is_err());

        let mut creds = creds();
        creds.access_key_id.clear();
        let inputs = WorkloadInputs {
            storage: Some(&creds),
            ..inputs
        };
        assert!(Pyroscope::new("host").config(&inputs).is_err());
    }

    #[test]
    fn unparsable_external_url_fails() {
        let retention = RetentionConfig::default();
        let addrs = workers("all", &["w0"]);
        let creds = creds();
        let inputs = WorkloadInputs {
            addresses: &addrs,
            storage: Some(&creds),
            external_url: Some("not a url"),
            tls: false,
            retention: &retention,
        };
        assert!(Pyroscope::new("host").config(&inputs).is_err());
    }
}
