use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Pyroscope component roles.
///
/// See https://grafana.com/docs/pyroscope/latest/reference-pyroscope-architecture/
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PyroscopeRole {
    /// Meta-role, runs every component in a single process.
    All,
    Querier,
    QueryFrontend,
    QueryScheduler,
    Ingester,
    Distributor,
    Compactor,
    StoreGateway,
    TenantSettings,
    AdHocProfiles,
}

use PyroscopeRole::*;

/// Every role that names an actual component.
pub static NON_META_ROLES: [PyroscopeRole; 9] = [
    Querier,
    QueryFrontend,
    QueryScheduler,
    Ingester,
    Distributor,
    Compactor,
    StoreGateway,
    TenantSettings,
    AdHocProfiles,
];

/// Meta-roles and the roles they stand for.
static META_ROLES: [(PyroscopeRole, &[PyroscopeRole]); 1] = [(All, &NON_META_ROLES)];

/// The minimal set of roles that need to be allocated for the deployment to be
/// considered coherent (otherwise we're blocked).
pub const MINIMAL_DEPLOYMENT: [(PyroscopeRole, usize); 9] = [
    (Querier, 1),
    (QueryFrontend, 1),
    (QueryScheduler, 1),
    (Ingester, 1),
    (Distributor, 1),
    (Compactor, 1),
    (StoreGateway, 1),
    (TenantSettings, 1),
    (AdHocProfiles, 1),
];

/// The set of roles that need to be allocated for the deployment to be
/// considered robust, as per upstream's microservices helm values.
pub const RECOMMENDED_DEPLOYMENT: [(PyroscopeRole, usize); 9] = [
    (Querier, 3),
    (QueryFrontend, 2),
    (QueryScheduler, 2),
    (Ingester, 3),
    (Distributor, 2),
    (Compactor, 3),
    (StoreGateway, 3),
    (TenantSettings, 1),
    (AdHocProfiles, 1),
];

/// Replica count per role.
pub type RoleCounts = BTreeMap<PyroscopeRole, usize>;

impl PyroscopeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            All => "all",
            Querier => "querier",
            QueryFrontend => "query-frontend",
            QueryScheduler => "query-scheduler",
            Ingester => "ingester",
            Distributor => "distributor",
            Compactor => "compactor",
            StoreGateway => "store-gateway",
            TenantSettings => "tenant-settings",
            AdHocProfiles => "ad-hoc-profiles",
        }
    }

    pub fn is_meta(&self) -> bool {
        META_ROLES.iter().any(|(meta, _)| meta == self)
    }

    /// The concrete roles this role stands for. A non-meta role expands to itself.
    pub fn expand(&self) -> &'static [PyroscopeRole] {
        META_ROLES
            .iter()
            .find(|(meta, _)| meta == self)
            .map(|(_, roles)| *roles)
            .or_else(|| NON_META_ROLES.iter().position(|r| r == self).map(|i| &NON_META_ROLES[i..=i]))
            .unwrap_or(&[])
    }
}

/// Expand a set of declared roles into the concrete roles they cover.
pub fn expand_roles<'a, I>(roles: I) -> BTreeSet<PyroscopeRole>
where
    I: IntoIterator<Item = &'a PyroscopeRole>,
{
    roles.into_iter().flat_map(|r| r.expand().iter().copied()).collect()
}

impl fmt::Display for PyroscopeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PyroscopeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        std::iter::once(All)
            .chain(NON_META_ROLES.iter().copied())
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ErrorKind::UnknownRole(s.to_string()).into())
    }
}

/// Static description of the roles a cluster is made of and how many of each
/// it needs.
#[derive(Clone, Debug)]
pub struct RolesConfig {
    pub minimal: RoleCounts,
    pub recommended: RoleCounts,
}

impl RolesConfig {
    pub fn pyroscope() -> Self {
        RolesConfig {
            minimal: MINIMAL_DEPLOYMENT.iter().copied().collect(),
            recommended: RECOMMENDED_DEPLOYMENT.iter().copied().collect(),
        }
    }
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self::pyroscope()
    }
}
