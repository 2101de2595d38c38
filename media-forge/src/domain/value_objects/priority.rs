//! Priority value object.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Priority level for queue ordering and device access.
///
/// Higher priority jobs are claimed first from the queue and are served
/// first by the device arbiter when several jobs wait for the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Interactive requests the user is actively waiting on.
    High,
    /// Standard submissions.
    #[default]
    Normal,
    /// Batch/background work.
    Low,
}

impl Priority {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Parse from string representation (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Numeric value stored in the `job.priority` column (higher = more important).
    pub fn numeric_value(&self) -> i64 {
        match self {
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
        }
    }

    /// Inverse of [`Priority::numeric_value`]; out-of-range values clamp to the nearest priority.
    pub fn from_numeric(value: i64) -> Self {
        match value {
            v if v >= 3 => Self::High,
            v if v <= 1 => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numeric_value().cmp(&other.numeric_value())
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown priority '{}'", s))
    }
}
