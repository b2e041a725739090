use crate::errors::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const TIMESPEC: &str = r"^(0|[0-9]+(y|w|d|h|m|s|ms))$";

fn timespec() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TIMESPEC).expect("timespec regex is valid"))
}

/// Block retention settings, as set by the user.
///
/// Values are durations in the workload's own syntax: `0`, or a number followed by one of
/// `y`, `w`, `d`, `h`, `m`, `s`, `ms`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Delete blocks containing samples older than this.
    pub retention_period: String,
    /// Time before a block marked for deletion is deleted from the bucket.
    pub deletion_delay: String,
    /// How often the compactor runs blocks cleanup and maintenance.
    pub cleanup_interval: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            retention_period: "1d".into(),
            deletion_delay: "12h".into(),
            cleanup_interval: "15m".into(),
        }
    }
}

impl RetentionConfig {
    /// Settings used when the user's are invalid: retention turned off, nothing gets deleted.
    pub fn disabled() -> Self {
        RetentionConfig {
            retention_period: "0".into(),
            ..Default::default()
        }
    }

    /// Check every field, naming all the invalid ones at once.
    pub fn validate(&self) -> Result<()> {
        let mut invalid: Vec<&str> = [
            ("retention_period", &self.retention_period),
            ("deletion_delay", &self.deletion_delay),
            ("cleanup_interval", &self.cleanup_interval),
        ]
        .iter()
        .filter(|(_, value)| !timespec().is_match(value))
        .map(|(name, _)| *name)
        .collect();
        if invalid.is_empty() {
            return Ok(());
        }
        invalid.sort_unstable();
        let fields = invalid.iter().map(|f| format!("'{}'", f)).collect::<Vec<_>>().join(", ");
        bail!(ErrorKind::InvalidConfig(fields))
    }
}
