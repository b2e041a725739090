use serde::{Deserialize, Serialize};

/// Where profiling data producers should push to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilingEndpoint {
    /// `host:port` of the OTLP gRPC receiver.
    pub otlp_grpc_endpoint_url: String,
    /// Whether producers should skip TLS.
    pub insecure: bool,
}

impl ProfilingEndpoint {
    pub fn new(host: &str, port: u16, insecure: bool) -> Self {
        ProfilingEndpoint {
            otlp_grpc_endpoint_url: format!("{}:{}", host, port),
            insecure,
        }
    }
}
