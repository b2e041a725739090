//! The nginx proxy running next to each coordinator, fanning requests out to the workers by role.

use crate::cluster::ClusterAddresses;
use crate::errors::*;
use crate::pyroscope::HTTP_SERVER_PORT;
use crate::roles::{PyroscopeRole, NON_META_ROLES};
use std::collections::BTreeSet;
use std::fmt::{self, Write};

pub const NGINX_PORT: u16 = 8080;
pub const NGINX_TLS_PORT: u16 = 443;
pub const GRPC_SERVER_PORT: u16 = 42424;

/// Cert paths on the nginx container.
pub const CERT_PATH: &str = "/etc/nginx/certs/server.cert";
pub const KEY_PATH: &str = "/etc/nginx/certs/server.key";

/// Upstream routing to every worker, whatever its roles.
const WORKER_UPSTREAM: &str = "worker";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub path: &'static str,
    /// Name of the upstream to forward to.
    pub backend: &'static str,
    /// `=` for exact matches.
    pub modifier: Option<&'static str>,
    pub grpc: bool,
}

const fn exact(path: &'static str, backend: &'static str) -> Location {
    Location {
        path,
        backend,
        modifier: Some("="),
        grpc: false,
    }
}

const fn prefix(path: &'static str, backend: &'static str) -> Location {
    Location {
        path,
        backend,
        modifier: None,
        grpc: false,
    }
}

const HTTP_LOCATIONS: [Location; 9] = [
    exact("/ingest", "distributor"),
    // api queries
    exact("/pyroscope/render", "query-frontend"),
    exact("/pyroscope/render-diff", "query-frontend"),
    // called by the UI
    prefix("/querier.v1.QuerierService", "query-frontend"),
    prefix("/settings.v1.SettingsService", "tenant-settings"),
    prefix("/adhocprofiles.v1.AdHocProfileService", "ad-hoc-profiles"),
    // the UI itself, not bound to any role
    exact("/", WORKER_UPSTREAM),
    prefix("/assets", WORKER_UPSTREAM),
    prefix("/ready", WORKER_UPSTREAM),
];

const GRPC_LOCATIONS: [Location; 1] = [Location {
    path: "/opentelemetry.proto.collector.profiles.v1development.ProfilesService",
    backend: "distributor",
    modifier: None,
    grpc: true,
}];

/// A named group of workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub port: u16,
    /// None routes to every worker.
    pub role: Option<PyroscopeRole>,
}

impl Upstream {
    fn addresses<'a>(&self, addrs: &'a ClusterAddresses) -> Option<&'a BTreeSet<String>> {
        let servers = match self.role {
            Some(role) => addrs.by_role.get(&role),
            None => Some(&addrs.all),
        };
        servers.filter(|set| !set.is_empty())
    }
}

/// One upstream per component plus a catch-all `worker` upstream.
pub fn upstreams(port: u16) -> Vec<Upstream> {
    NON_META_ROLES
        .iter()
        .map(|role| Upstream {
            name: role.to_string(),
            port,
            role: Some(*role),
        })
        .chain(std::iter::once(Upstream {
            name: WORKER_UPSTREAM.into(),
            port,
            role: None,
        }))
        .collect()
}

/// Locations served per listening port.
pub fn server_ports_to_locations(tls: bool) -> Vec<(u16, Vec<Location>)> {
    vec![
        (if tls { NGINX_TLS_PORT } else { NGINX_PORT }, HTTP_LOCATIONS.to_vec()),
        (GRPC_SERVER_PORT, GRPC_LOCATIONS.to_vec()),
    ]
}

#[derive(Clone, Debug)]
pub struct NginxConfig {
    pub server_name: String,
    pub upstreams: Vec<Upstream>,
    pub tls: bool,
    pub ipv6: bool,
}

impl NginxConfig {
    pub fn new(server_name: impl Into<String>, tls: bool) -> Self {
        NginxConfig {
            server_name: server_name.into(),
            upstreams: upstreams(HTTP_SERVER_PORT),
            tls,
            ipv6: true,
        }
    }

    /// Render nginx.conf for the current set of workers.
    ///
    /// Upstreams without workers are left out, together with the locations pointing at them; nginx
    /// refuses to start on an empty upstream.
    pub fn render(&self, addrs: &ClusterAddresses) -> Result<String> {
        let mut out = String::new();
        out.push_str("worker_processes 5;\nerror_log /dev/stderr error;\npid /tmp/nginx.pid;\n");
        out.push_str("events {\n    worker_connections 4096;\n}\n\nhttp {\n");

        let mut live = BTreeSet::new();
        for upstream in &self.upstreams {
            let servers = match upstream.addresses(addrs) {
                Some(servers) => servers,
                None => continue,
            };
            live.insert(upstream.name.as_str());
            writeln!(out, "    upstream {} {{", upstream.name)?;
            for addr in servers {
                writeln!(out, "        server {}:{};", addr, upstream.port)?;
            }
            out.push_str("    }\n\n");
        }

        out.push_str("    client_body_temp_path /tmp/client_temp;\n    proxy_temp_path /tmp/proxy_temp_path;\n");
        out.push_str("    access_log /dev/stderr;\n    sendfile on;\n    proxy_read_timeout 300;\n\n");

        for (port, locations) in server_ports_to_locations(self.tls) {
            self.render_server(&mut out, port, &locations, &live)?;
        }
        out.push_str("}\n");
        Ok(out)
    }

    fn render_server(
        &self,
        out: &mut String,
        port: u16,
        locations: &[Location],
        live: &BTreeSet<&str>,
    ) -> fmt::Result {
        let grpc = locations.iter().any(|l| l.grpc);
        let mut listen_args = port.to_string();
        if self.tls {
            listen_args.push_str(" ssl");
        }
        if grpc {
            listen_args.push_str(" http2");
        }
        out.push_str("    server {\n");
        writeln!(out, "        listen {};", listen_args)?;
        if self.ipv6 {
            writeln!(out, "        listen [::]:{};", listen_args)?;
        }
        writeln!(out, "        server_name {};", self.server_name)?;
        if self.tls {
            writeln!(out, "        ssl_certificate {};", CERT_PATH)?;
            writeln!(out, "        ssl_certificate_key {};", KEY_PATH)?;
            out.push_str("        ssl_protocols TLSv1 TLSv1.1 TLSv1.2 TLSv1.3;\n");
        }
        for location in locations.iter().filter(|l| live.contains(l.backend)) {
            match location.modifier {
                Some(modifier) => writeln!(out, "        location {} {} {{", modifier, location.path)?,
                None => writeln!(out, "        location {} {{", location.path)?,
            }
            let scheme = match (location.grpc, self.tls) {
                (true, true) => "grpcs",
                (true, false) => "grpc",
                (false, true) => "https",
                (false, false) => "http",
            };
            if location.grpc {
                writeln!(out, "            grpc_pass {}://{};", scheme, location.backend)?;
            } else {
                writeln!(out, "            proxy_pass {}://{};", scheme, location.backend)?;
            }
            out.push_str("        }\n");
        }
        out.push_str("    }\n\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{validate_workers, RawWorker};

    fn addrs(role: &str, addresses: &[&str]) -> ClusterAddresses {
        let raw: Vec<_> = addresses
            .iter()
            .enumerate()
            .map(|(i, a)| RawWorker {
                unit: format!("w/{}", i),
                roles: vec![role.into()],
                address: Some(a.to_string()),
            })
            .collect();
        ClusterAddresses::gather(&validate_workers(&raw))
    }

    #[test]
    fn upstreams_per_role() {
        for addresses in [
            vec!["address.one"],
            vec!["address.one", "address.two"],
            vec!["address.one", "address.two", "address.three"],
        ] {
            let conf = NginxConfig::new("localhost", false).render(&addrs("ingester", &addresses)).unwrap();
            assert!(conf.contains("upstream ingester {"));
            assert!(conf.contains("upstream worker {"));
            for addr in &addresses {
                assert!(conf.contains(&format!("server {}:4040;", addr)));
            }
            // nobody runs a distributor, so neither its upstream nor its routes are there
            assert!(!conf.contains("upstream distributor"));
            assert!(!conf.contains("/ingest"));
        }
    }

    #[test]
    fn listens() {
        for tls in [true, false] {
            for ipv6 in [true, false] {
                let mut nginx = NginxConfig::new("localhost", tls);
                nginx.ipv6 = ipv6;
                let conf = nginx.render(&addrs("all", &["address.one"])).unwrap();
                let ipv4_args = if tls { "443 ssl" } else { "8080" };
                assert!(conf.contains(&format!("listen {};", ipv4_args)));
                let ipv6_listen = format!("listen [::]:{};", ipv4_args);
                assert_eq!(conf.contains(&ipv6_listen), ipv6, "tls={} ipv6={}", tls, ipv6);
            }
        }
    }

    #[test]
    fn all_in_one_worker_serves_every_route() {
        let conf = NginxConfig::new("localhost", false).render(&addrs("all", &["w0"])).unwrap();
        for location in HTTP_LOCATIONS.iter() {
            assert!(conf.contains(location.path), "{}", location.path);
        }
        assert!(conf.contains("listen 42424 http2;"));
        assert!(conf.contains("grpc_pass grpc://distributor;"));
        assert!(conf.contains("location = /ingest {\n            proxy_pass http://distributor;"));
    }

    #[test]
    fn tls_uses_secure_schemes() {
        let conf = NginxConfig::new("localhost", true).render(&addrs("all", &["w0"])).unwrap();
        assert!(conf.contains("proxy_pass https://query-frontend;"));
        assert!(conf.contains("grpc_pass grpcs://distributor;"));
        assert!(conf.contains(&format!("ssl_certificate {};", CERT_PATH)));
    }

    #[test]
    fn no_workers_no_upstreams() {
        let conf = NginxConfig::new("localhost", false).render(&ClusterAddresses::default()).unwrap();
        assert!(!conf.contains("upstream"));
        assert!(!conf.contains("location"));
    }
}
