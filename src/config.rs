//! Runtime configuration.

use crate::errors::*;
use serde::Deserialize;

/// Runtime configuration data, read from the environment.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Logging directives, `env_logger` syntax.
    #[serde(default = "default_rust_log")]
    pub rust_log: String,
    /// The Kubernetes namespace this operator watches.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,
    /// This pod's FQDN.
    #[serde(default)]
    pub pod_fqdn: Option<String>,
    /// The pod's `spec.subdomain`, the headless service giving it a DNS record. Used to build the
    /// FQDN when `POD_FQDN` is unset.
    #[serde(default)]
    pub pod_subdomain: Option<String>,
}

fn default_rust_log() -> String {
    "info".into()
}

impl Config {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().chain_err(|| "error building config from env")?;
        config.hostname()?;
        Ok(config)
    }

    /// The address peers reach this coordinator at.
    ///
    /// A bare pod name has no DNS record, so this is either `POD_FQDN` or
    /// `{pod}.{subdomain}.{namespace}.svc.cluster.local`.
    pub fn hostname(&self) -> Result<String> {
        let set = |v: &Option<String>| v.clone().filter(|v| !v.is_empty());
        if let Some(fqdn) = set(&self.pod_fqdn) {
            return Ok(fqdn);
        }
        match set(&self.pod_subdomain) {
            Some(subdomain) => Ok(format!(
                "{}.{}.{}.svc.cluster.local",
                self.pod_name, subdomain, self.namespace
            )),
            None => bail!("neither POD_FQDN nor POD_SUBDOMAIN is set, this pod has no resolvable name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn reads_env_with_defaults() {
        let config: Config = envy::from_iter(vars(&[
            ("NAMESPACE", "obs"),
            ("POD_NAME", "coord-0"),
            ("POD_SUBDOMAIN", "coord-endpoints"),
        ]))
        .unwrap();
        assert_eq!(config.rust_log, "info");
        assert_eq!(config.pod_fqdn, None);
        assert_eq!(config.hostname().unwrap(), "coord-0.coord-endpoints.obs.svc.cluster.local");
    }

    #[test]
    fn bare_pod_name_is_not_a_hostname() {
        let config: Config = envy::from_iter(vars(&[("NAMESPACE", "obs"), ("POD_NAME", "coord-0")])).unwrap();
        assert!(config.hostname().is_err());
        let config: Config =
            envy::from_iter(vars(&[("NAMESPACE", "obs"), ("POD_NAME", "coord-0"), ("POD_FQDN", "")])).unwrap();
        assert!(config.hostname().is_err());
    }

    #[test]
    fn explicit_fqdn_wins() {
        let config: Config = envy::from_iter(vars(&[
            ("NAMESPACE", "obs"),
            ("POD_NAME", "coord-0"),
            ("POD_FQDN", "coord-0.coord-headless.obs.svc.cluster.local"),
            ("RUST_LOG", "debug"),
        ]))
        .unwrap();
        assert_eq!(config.rust_log, "debug");
        assert_eq!(config.hostname().unwrap(), "coord-0.coord-headless.obs.svc.cluster.local");
    }

    #[test]
    fn namespace_is_required() {
        assert!(envy::from_iter::<_, Config>(vars(&[("POD_NAME", "coord-0")])).is_err());
    }
}
