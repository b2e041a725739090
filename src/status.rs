use crate::coherence::CoherenceState;
use crate::roles::PyroscopeRole;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusName {
    Active,
    Blocked,
}

impl StatusName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusName::Active => "active",
            StatusName::Blocked => "blocked",
        }
    }
}

/// What the user sees about this coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalStatus {
    pub name: StatusName,
    pub message: String,
}

impl OperationalStatus {
    pub fn active(message: impl Into<String>) -> Self {
        OperationalStatus {
            name: StatusName::Active,
            message: message.into(),
        }
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        OperationalStatus {
            name: StatusName::Blocked,
            message: message.into(),
        }
    }

    pub fn missing_workers() -> Self {
        Self::blocked("[consistency] Missing any worker relation.")
    }

    pub fn inconsistent(missing: &[PyroscopeRole]) -> Self {
        let roles: Vec<_> = missing.iter().map(PyroscopeRole::as_str).collect();
        Self::blocked(format!("[consistency] Cluster inconsistent. Missing roles: {}.", roles.join(", ")))
    }

    pub fn missing_s3() -> Self {
        Self::blocked("[s3] Missing S3 integration.")
    }

    pub fn is_active(&self) -> bool {
        self.name == StatusName::Active
    }
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.name.as_str())
        } else {
            write!(f, "{}: {}", self.name.as_str(), self.message)
        }
    }
}

pub fn derive_operational_status(state: CoherenceState) -> OperationalStatus {
    match state {
        CoherenceState::Blocked => OperationalStatus::blocked("[consistency] Cluster inconsistent."),
        CoherenceState::Coherent => OperationalStatus::active("[coordinator] Degraded."),
        CoherenceState::Recommended => OperationalStatus::active(""),
    }
}
