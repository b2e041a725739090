use crate::roles::{PyroscopeRole, RoleCounts, RolesConfig};
use serde::{Deserialize, Serialize};

/// How healthy the current role allocation is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoherenceState {
    /// Below the minimal deployment; the cluster can't run.
    Blocked,
    /// Meets the minimal deployment only.
    Coherent,
    /// Meets the recommended deployment.
    Recommended,
}

/// Roles whose observed count is below what `required` asks for.
///
/// Roles absent from `required`, or required zero times, are unconstrained.
pub fn missing_roles(counts: &RoleCounts, required: &RoleCounts) -> Vec<PyroscopeRole> {
    required
        .iter()
        .filter(|(role, min)| **min > 0 && counts.get(*role).copied().unwrap_or(0) < **min)
        .map(|(role, _)| *role)
        .collect()
}

pub fn is_coherent(counts: &RoleCounts, cfg: &RolesConfig) -> bool {
    missing_roles(counts, &cfg.minimal).is_empty()
}

pub fn is_recommended(counts: &RoleCounts, cfg: &RolesConfig) -> bool {
    missing_roles(counts, &cfg.recommended).is_empty()
}

/// `counts` must already have meta-roles expanded.
pub fn compute_coherence(counts: &RoleCounts, cfg: &RolesConfig) -> CoherenceState {
    if !is_coherent(counts, cfg) {
        CoherenceState::Blocked
    } else if !is_recommended(counts, cfg) {
        CoherenceState::Coherent
    } else {
        CoherenceState::Recommended
    }
}
