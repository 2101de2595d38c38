//! Pipeline catalog: the JSON description of every pipeline's stages.
//!
//! ```json
//! {
//!   "pipelines": {
//!     "separator": [
//!       {
//!         "name": "separate",
//!         "resource_class": "gpu-exclusive",
//!         "input_kinds": ["audio"],
//!         "output_kind": "audio",
//!         "program": "media-forge-runner",
//!         "args": ["separate", "--input", "{input}", "--output", "{output}"]
//!       }
//!     ]
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::command::{CommandStage, CommandStageSpec};
use super::registry::PipelineRegistry;
use super::stage::Stage;
use crate::domain::PipelineKind;
use crate::{Error, Result};

const BUILTIN_CATALOG: &str = include_str!("../../pipelines.default.json");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCatalog {
    pub pipelines: BTreeMap<PipelineKind, Vec<CommandStageSpec>>,
}

impl PipelineCatalog {
    /// The catalog shipped with the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid pipeline catalog: {}", e)))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::io_path("reading pipeline catalog", path, e))?;
        let catalog = Self::from_json(&content)?;
        info!(
            path = %path.display(),
            pipelines = catalog.pipelines.len(),
            "Loaded pipeline catalog"
        );
        Ok(catalog)
    }

    /// Load `path` if given, otherwise the built-in catalog.
    pub async fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => Self::builtin(),
        }
    }

    /// Override the runner program of every stage.
    pub fn with_program(mut self, program: &str) -> Self {
        for stage in self.pipelines.values_mut().flatten() {
            stage.program = program.to_string();
        }
        self
    }

    /// Build and validate the registry. Any error here aborts startup.
    pub fn into_registry(self) -> Result<PipelineRegistry> {
        let mut builder = PipelineRegistry::builder();
        for (kind, specs) in self.pipelines {
            let stages: Vec<Arc<dyn Stage>> = specs
                .into_iter()
                .map(|spec| Arc::new(CommandStage::new(spec)) as Arc<dyn Stage>)
                .collect();
            builder.register(kind, stages)?;
        }
        Ok(builder.build())
    }
}
