//! Media kinds and references passed between stages.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Kind of media an artifact holds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    /// A directory of extracted frames.
    Frames,
    /// Detection/alignment data (JSON) produced by analysis stages.
    FaceData,
}

impl MediaKind {
    /// File extension used when allocating an artifact of this kind.
    ///
    /// `None` means the artifact is a directory.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Image => Some("png"),
            Self::Video => Some("mp4"),
            Self::Audio => Some("wav"),
            Self::Frames => None,
            Self::FaceData => Some("json"),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.extension().is_none()
    }

    /// Guess a media kind from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(Self::Frames);
        }
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "webp" | "bmp" => Some(Self::Image),
            "mp4" | "mkv" | "mov" | "avi" | "webm" => Some(Self::Video),
            "wav" | "mp3" | "flac" | "ogg" | "m4a" => Some(Self::Audio),
            "json" => Some(Self::FaceData),
            _ => None,
        }
    }
}

/// A typed reference to a file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub path: PathBuf,
    pub kind: MediaKind,
}

impl MediaRef {
    pub fn new(path: impl Into<PathBuf>, kind: MediaKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Build a reference, inferring the kind from the path.
    pub fn infer(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let kind = MediaKind::from_path(&path)?;
        Some(Self { path, kind })
    }
}
