//! Coordinator replicas tell each other their FQDNs, so the ingress can balance over all of them.

use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Key a coordinator publishes its FQDN under.
pub const FQDN_KEY: &str = "pyroscope.dev/fqdn";

/// What one coordinator publishes for its peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerData {
    pub fqdn: String,
}

impl PeerData {
    pub fn dump(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert(FQDN_KEY.to_string(), self.fqdn.clone());
        data
    }

    /// None for a peer that hasn't published yet.
    pub fn load(data: &BTreeMap<String, String>) -> Option<Self> {
        data.get(FQDN_KEY)
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(|fqdn| PeerData { fqdn: fqdn.to_string() })
    }
}

/// FQDNs of every coordinator, this one included, sorted and deduplicated.
pub fn get_fqdns(hostname: &str, peers: &[String]) -> Vec<String> {
    let fqdns: BTreeSet<&str> = peers
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(hostname))
        .collect();
    debug!("coordinator fqdns: {:?}", fqdns);
    fqdns.into_iter().map(String::from).collect()
}
