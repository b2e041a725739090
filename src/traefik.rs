//! Traefik routing for the coordinators.
//!
//! The reverse proxy matches its objects by name, so every router, service and middleware is
//! named `juju-{model}-{app}-{kind}-{endpoint}`. Underscores in endpoint names become dashes.

use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const REDIRECT_MIDDLEWARE_SUFFIX: &str = "-redirect";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Grpc,
}

/// An endpoint exposed by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub entrypoint_name: String,
    pub protocol: Protocol,
    pub port: u16,
}

impl Endpoint {
    pub fn new(entrypoint_name: impl Into<String>, protocol: Protocol, port: u16) -> Self {
        Endpoint {
            entrypoint_name: entrypoint_name.into(),
            protocol,
            port,
        }
    }

    pub fn sanitized_entrypoint_name(&self) -> String {
        self.entrypoint_name.replace('_', "-")
    }

    fn is_grpc(&self) -> bool {
        self.protocol == Protocol::Grpc
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub entry_points: Vec<String>,
    pub service: String,
    pub rule: String,
    // Traefik rejects an empty middlewares list, so leave the key out instead.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LbServer {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub servers: Vec<LbServer>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub load_balancer: LoadBalancer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripPrefix {
    pub force_slash: bool,
    pub prefixes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RedirectScheme {
    pub permanent: bool,
    pub port: u16,
    pub scheme: String,
}

/// A middleware carries exactly one of its fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Middleware {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<StripPrefix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_scheme: Option<RedirectScheme>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub routers: BTreeMap<String, Router>,
    pub services: BTreeMap<String, Service>,
    pub middlewares: BTreeMap<String, Middleware>,
}

/// Routing rules, only meaningful while the ingress is up.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub http: HttpConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub address: String,
}

/// Entrypoints the proxy has to listen on; provisioned ahead of any routing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(rename = "entryPoints")]
    pub entry_points: BTreeMap<String, EntryPoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingDocument {
    /// None while the ingress is not active.
    pub dynamic: Option<DynamicConfig>,
    #[serde(rename = "static")]
    pub static_config: StaticConfig,
}

/// Inputs to [`ingress_config`].
#[derive(Clone, Copy, Debug)]
pub struct RoutingInputs<'a> {
    pub endpoints: &'a [Endpoint],
    /// The coordinator nodes traffic gets balanced over.
    pub coordinator_fqdns: &'a [String],
    pub model_name: &'a str,
    pub app_name: &'a str,
    pub ingressed: bool,
    pub tls: bool,
    pub prefix: &'a str,
}

struct Names<'a> {
    model: &'a str,
    app: &'a str,
}

impl<'a> Names<'a> {
    fn router(&self, endpoint: &Endpoint) -> String {
        format!("juju-{}-{}-router-{}", self.model, self.app, endpoint.sanitized_entrypoint_name())
    }

    fn service(&self, endpoint: &Endpoint) -> String {
        format!("juju-{}-{}-service-{}", self.model, self.app, endpoint.sanitized_entrypoint_name())
    }

    fn redirect_middleware(&self, endpoint: &Endpoint) -> String {
        format!(
            "juju-{}-{}-middleware-{}{}",
            self.model,
            self.app,
            endpoint.sanitized_entrypoint_name(),
            REDIRECT_MIDDLEWARE_SUFFIX
        )
    }

    /// Shared by every http router.
    fn stripprefix_middleware(&self) -> String {
        format!("juju-{}-{}-middleware-stripprefix", self.model, self.app)
    }
}

/// Reject endpoints that can't be turned into distinct, routable proxy objects.
pub fn validate_endpoints(endpoints: &[Endpoint]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for endpoint in endpoints {
        let name = endpoint.sanitized_entrypoint_name();
        ensure!(
            !name.trim().is_empty(),
            ErrorKind::InvalidEndpoint(endpoint.entrypoint_name.clone(), "empty name")
        );
        ensure!(
            endpoint.port > 0,
            ErrorKind::InvalidEndpoint(endpoint.entrypoint_name.clone(), "port must be positive")
        );
        ensure!(
            seen.insert(name),
            ErrorKind::InvalidEndpoint(endpoint.entrypoint_name.clone(), "name collides with another endpoint")
        );
    }
    Ok(())
}

/// Build the full ingress configuration for the coordinators.
pub fn ingress_config(inputs: &RoutingInputs) -> Result<RoutingDocument> {
    validate_endpoints(inputs.endpoints)?;
    let names = Names {
        model: inputs.model_name,
        app: inputs.app_name,
    };
    let dynamic = if inputs.ingressed {
        Some(DynamicConfig {
            http: HttpConfig {
                routers: routers(inputs, &names),
                services: services(inputs, &names),
                middlewares: middlewares(inputs, &names),
            },
        })
    } else {
        None
    };
    Ok(RoutingDocument {
        dynamic,
        static_config: static_ingress_config(inputs.endpoints),
    })
}

fn routers(inputs: &RoutingInputs, names: &Names) -> BTreeMap<String, Router> {
    let mut routers = BTreeMap::new();
    for endpoint in inputs.endpoints {
        let redirect = if inputs.tls {
            Some(names.redirect_middleware(endpoint))
        } else {
            None
        };
        let router = if endpoint.is_grpc() {
            // grpc is routed by entrypoint, not path; no prefix to strip either
            Router {
                entry_points: vec![endpoint.sanitized_entrypoint_name()],
                service: names.service(endpoint),
                rule: "ClientIP(`0.0.0.0/0`)".into(),
                middlewares: redirect.into_iter().collect(),
            }
        } else {
            Router {
                entry_points: vec![endpoint.sanitized_entrypoint_name()],
                service: names.service(endpoint),
                rule: format!("PathPrefix(`{}`)", inputs.prefix),
                middlewares: std::iter::once(names.stripprefix_middleware()).chain(redirect).collect(),
            }
        };
        routers.insert(names.router(endpoint), router);
    }
    routers
}

fn services(inputs: &RoutingInputs, names: &Names) -> BTreeMap<String, Service> {
    inputs
        .endpoints
        .iter()
        .map(|endpoint| {
            // plaintext grpc has to go over h2c
            let scheme = match (endpoint.protocol, inputs.tls) {
                (Protocol::Grpc, false) => "h2c",
                (_, true) => "https",
                (_, false) => "http",
            };
            let servers = inputs
                .coordinator_fqdns
                .iter()
                .map(|fqdn| LbServer {
                    url: format!("{}://{}:{}", scheme, fqdn, endpoint.port),
                })
                .collect();
            (
                names.service(endpoint),
                Service {
                    load_balancer: LoadBalancer { servers },
                },
            )
        })
        .collect()
}

fn middlewares(inputs: &RoutingInputs, names: &Names) -> BTreeMap<String, Middleware> {
    let mut middlewares = BTreeMap::new();
    middlewares.insert(
        names.stripprefix_middleware(),
        Middleware {
            strip_prefix: Some(StripPrefix {
                force_slash: false,
                prefixes: vec![inputs.prefix.to_string()],
            }),
            ..Default::default()
        },
    );
    if !inputs.tls {
        return middlewares;
    }
    for endpoint in inputs.endpoints {
        middlewares.insert(
            names.redirect_middleware(endpoint),
            Middleware {
                redirect_scheme: Some(RedirectScheme {
                    permanent: true,
                    port: endpoint.port,
                    scheme: "https".into(),
                }),
                ..Default::default()
            },
        );
    }
    middlewares
}

/// Entrypoints for the grpc endpoints; http shares the proxy's default one.
pub fn static_ingress_config(endpoints: &[Endpoint]) -> StaticConfig {
    StaticConfig {
        entry_points: endpoints
            .iter()
            .filter(|e| e.is_grpc())
            .map(|e| {
                (
                    e.sanitized_entrypoint_name(),
                    EntryPoint {
                        address: format!(":{}", e.port),
                    },
                )
            })
            .collect(),
    }
}
