#[macro_use]
extern crate error_chain;

pub mod cluster;
pub mod coherence;
pub mod config;
pub mod coordinator;
pub mod crd;
pub mod manager;
pub mod nginx;
pub mod peers;
pub mod profiling;
pub mod pyroscope;
pub mod retention;
pub mod roles;
pub mod s3;
pub mod status;
pub mod traefik;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Fmt(std::fmt::Error);
            Io(std::io::Error);
            Yaml(serde_yaml::Error);
            Json(serde_json::Error);
            Url(url::ParseError);
            Kube(kube::Error);
            Env(envy::Error);
        }

        errors {
            InvalidConfig(fields: String) {
                description("invalid configuration")
                display("The following configurations are not valid: [{}]", fields)
            }
            MissingStorage {
                description("missing storage")
                display("no object storage credentials available")
            }
            MissingStorageField(field: &'static str) {
                description("missing storage field")
                display("storage credentials are missing '{}'", field)
            }
            UndecodableStorageField(field: String) {
                description("undecodable storage field")
                display("storage credentials field '{}' is not valid UTF-8", field)
            }
            InvalidEndpoint(name: String, reason: &'static str) {
                description("invalid ingress endpoint")
                display("invalid ingress endpoint '{}': {}", name, reason)
            }
            InvalidWorker(unit: String, reason: String) {
                description("invalid worker data")
                display("invalid data from worker unit {}: {}", unit, reason)
            }
            UnknownRole(role: String) {
                description("unknown role")
                display("unknown pyroscope role '{}'", role)
            }
        }
    }
}

/*
The coordinator is split in two layers.

- A pure core, re-run from scratch on every reconciliation:
  - roles/coherence: is the set of running worker roles enough to run at all?
  - cluster: who are the workers and what are their addresses, by role?
  - pyroscope: the workload config file handed to every worker.
  - traefik: routing rules for the ingress in front of the coordinators.
  - nginx: the proxy in front of the workers.
  - coordinator: reads an Observer, writes a Publisher. No I/O of its own.

- A kubernetes adapter (crd, manager) that snapshots the API server into an
  Observer, runs the core, and server-side-applies whatever was published.

Nothing is diffed between ticks. Peer data may be half written when we read
it; a missing value means "not there yet" and the next tick picks it up.
*/
