//! Worker cluster membership.
//!
//! Workers advertise themselves with a role (or several) and an address. What arrives here is
//! loosely shaped data, so it goes through [`RawWorker::validate`] before anything downstream
//! looks at it.

use crate::errors::*;
use crate::roles::{expand_roles, PyroscopeRole, RoleCounts};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Worker data as observed, before validation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawWorker {
    /// Unit identifier, the pod name.
    pub unit: String,
    pub roles: Vec<String>,
    /// None until the worker has published it.
    pub address: Option<String>,
}

impl RawWorker {
    /// Validate this observation.
    ///
    /// Returns `Ok(None)` for a worker that has not finished joining (no address or no role yet).
    /// Unknown roles are rejected.
    pub fn validate(&self) -> Result<Option<Worker>> {
        let address = match self.address.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => addr.to_string(),
            _ => {
                debug!("worker {} has no address yet", self.unit);
                return Ok(None);
            }
        };
        if self.roles.is_empty() {
            debug!("worker {} has no role yet", self.unit);
            return Ok(None);
        }
        let roles = self
            .roles
            .iter()
            .map(|r| r.parse::<PyroscopeRole>())
            .collect::<Result<BTreeSet<_>>>()
            .chain_err(|| invalid(&self.unit, "unknown role"))?;
        Ok(Some(Worker {
            unit: self.unit.clone(),
            roles,
            address,
        }))
    }
}

fn invalid(unit: &str, reason: &str) -> ErrorKind {
    ErrorKind::InvalidWorker(unit.to_string(), reason.to_string())
}

/// A validated worker unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Worker {
    pub unit: String,
    /// Roles as declared, meta-roles included.
    pub roles: BTreeSet<PyroscopeRole>,
    pub address: String,
}

impl Worker {
    /// The concrete roles this worker runs.
    pub fn expanded_roles(&self) -> BTreeSet<PyroscopeRole> {
        expand_roles(self.roles.iter())
    }
}

/// Validate a batch of worker observations, dropping the ones that are not usable yet.
pub fn validate_workers(raw: &[RawWorker]) -> Vec<Worker> {
    raw.iter()
        .filter_map(|w| match w.validate() {
            Ok(worker) => worker,
            Err(err) => {
                warn!("ignoring worker {}: {}", w.unit, err);
                None
            }
        })
        .collect()
}

/// Worker addresses grouped by role.
///
/// Both views are ordered sets; the same address showing up under several roles, or reported by
/// several units, is counted once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterAddresses {
    pub by_role: BTreeMap<PyroscopeRole, BTreeSet<String>>,
    pub all: BTreeSet<String>,
}

impl ClusterAddresses {
    pub fn gather(workers: &[Worker]) -> Self {
        let mut addrs = ClusterAddresses::default();
        for worker in workers {
            for role in worker.expanded_roles() {
                addrs.by_role.entry(role).or_default().insert(worker.address.clone());
            }
            addrs.all.insert(worker.address.clone());
        }
        addrs
    }

    /// Number of distinct addresses serving `role`.
    pub fn count(&self, role: PyroscopeRole) -> usize {
        self.by_role.get(&role).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Number of worker units running each concrete role.
pub fn gather_roles(workers: &[Worker]) -> RoleCounts {
    let mut counts = RoleCounts::new();
    for worker in workers {
        for role in worker.expanded_roles() {
            *counts.entry(role).or_insert(0) += 1;
        }
    }
    counts
}
