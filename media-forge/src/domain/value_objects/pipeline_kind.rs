//! Job types the backend knows how to run.

use serde::{Deserialize, Serialize};

/// Names a registered pipeline definition.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum PipelineKind {
    FaceSwap,
    LipSync,
    VoiceClone,
    SuperResolution,
    Inpaint,
    RemoveBackground,
    RemoveObject,
    Separator,
}

impl PipelineKind {
    /// Folder under `content/` where final outputs of this kind are promoted.
    pub fn content_folder(&self) -> &'static str {
        match self {
            Self::FaceSwap => "face_swap",
            Self::LipSync => "lip_sync",
            Self::VoiceClone => "voice_clone",
            Self::SuperResolution => "enhancement",
            Self::Inpaint => "generation",
            Self::RemoveBackground => "remove_background",
            Self::RemoveObject => "remove_object",
            Self::Separator => "separator",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_kebab_case_names() {
        assert_eq!(PipelineKind::FaceSwap.to_string(), "face-swap");
        assert_eq!(
            PipelineKind::from_str("super-resolution").unwrap(),
            PipelineKind::SuperResolution
        );
        assert!(PipelineKind::from_str("face_swap").is_err());
    }

    #[test]
    fn test_content_folders_unique() {
        let mut folders: Vec<_> = PipelineKind::iter().map(|k| k.content_folder()).collect();
        let total = folders.len();
        folders.sort();
        folders.dedup();
        assert_eq!(folders.len(), total);
    }
}
