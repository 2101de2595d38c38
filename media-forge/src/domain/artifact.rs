//! On-disk artifact produced by a stage.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value_objects::{MediaKind, MediaRef};

/// A finalized artifact: an intermediate or final output of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub job_id: String,
    pub stage_index: usize,
    pub path: PathBuf,
    pub kind: MediaKind,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the content (file bytes, or sorted entries for directories).
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn media_ref(&self) -> MediaRef {
        MediaRef::new(self.path.clone(), self.kind)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
