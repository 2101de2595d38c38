//! Pipeline definitions and their registry.
//!
//! The registry is assembled once at startup through
//! [`PipelineRegistryBuilder`] and is immutable afterwards. It is shared by
//! reference (`Arc<PipelineRegistry>`); nothing looks pipelines up through
//! global state.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::stage::Stage;
use crate::domain::PipelineKind;
use crate::{Error, Result};

/// An ordered, validated chain of stages for one job type.
pub struct PipelineDefinition {
    kind: PipelineKind,
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineDefinition {
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&Arc<dyn Stage>> {
        self.stages.get(index)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Whether any stage needs the GPU device.
    pub fn needs_device(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.resource_class().needs_device())
    }
}

impl std::fmt::Debug for PipelineDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDefinition")
            .field("kind", &self.kind)
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Default)]
pub struct PipelineRegistryBuilder {
    pipelines: BTreeMap<PipelineKind, Arc<PipelineDefinition>>,
}

impl PipelineRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline, validating the stage chain.
    ///
    /// Each stage's output kind must be accepted by the next stage. A
    /// validation error here is meant to abort startup.
    pub fn register(&mut self, kind: PipelineKind, stages: Vec<Arc<dyn Stage>>) -> Result<()> {
        if self.pipelines.contains_key(&kind) {
            return Err(Error::registry(format!(
                "pipeline '{}' registered twice",
                kind
            )));
        }
        if stages.is_empty() {
            return Err(Error::registry(format!("pipeline '{}' has no stages", kind)));
        }

        let mut names = HashSet::new();
        for stage in &stages {
            if !names.insert(stage.name().to_string()) {
                return Err(Error::registry(format!(
                    "pipeline '{}' has duplicate stage name '{}'",
                    kind,
                    stage.name()
                )));
            }
        }

        for pair in stages.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if !next.input_kinds().contains(&prev.output_kind()) {
                return Err(Error::registry(format!(
                    "pipeline '{}': stage '{}' produces {} but stage '{}' accepts {:?}",
                    kind,
                    prev.name(),
                    prev.output_kind(),
                    next.name(),
                    next.input_kinds()
                        .iter()
                        .map(|k| k.to_string())
                        .collect::<Vec<_>>()
                )));
            }
        }

        self.pipelines
            .insert(kind, Arc::new(PipelineDefinition { kind, stages }));
        Ok(())
    }

    pub fn with(mut self, kind: PipelineKind, stages: Vec<Arc<dyn Stage>>) -> Result<Self> {
        self.register(kind, stages)?;
        Ok(self)
    }

    pub fn build(self) -> PipelineRegistry {
        PipelineRegistry {
            pipelines: self.pipelines,
        }
    }
}

/// Immutable set of registered pipelines.
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<PipelineKind, Arc<PipelineDefinition>>,
}

impl PipelineRegistry {
    pub fn builder() -> PipelineRegistryBuilder {
        PipelineRegistryBuilder::new()
    }

    pub fn resolve(&self, kind: PipelineKind) -> Result<Arc<PipelineDefinition>> {
        self.pipelines
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::not_found("Pipeline", kind.to_string()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = PipelineKind> + '_ {
        self.pipelines.keys().copied()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Arc<PipelineDefinition>> {
        self.pipelines.values()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
