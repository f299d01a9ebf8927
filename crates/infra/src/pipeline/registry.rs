//! Stage lookup by name.

use std::collections::HashMap;
use std::sync::Arc;

use docpipe_core::{DomainError, DomainResult};

use super::stage::Stage;

/// Maps stage names to implementations, plus the stage list used when a job
/// does not name its own.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
    default_pipeline: Vec<String>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.stages.keys().collect();
        names.sort();
        f.debug_struct("StageRegistry")
            .field("stages", &names)
            .field("default_pipeline", &self.default_pipeline)
            .finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stage` under its own name, replacing any previous entry.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(stage.name().to_string(), stage);
        self
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    /// Set the default stage list. Every name must already be registered.
    pub fn with_default_pipeline<I, S>(mut self, names: I) -> DomainResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        self.validate_pipeline(&names)?;
        self.default_pipeline = names;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn default_pipeline(&self) -> &[String] {
        &self.default_pipeline
    }

    /// Check that a stage list is non-empty and fully registered.
    pub fn validate_pipeline(&self, names: &[String]) -> DomainResult<()> {
        if names.is_empty() {
            return Err(DomainError::validation("pipeline has no stages"));
        }
        if let Some(unknown) = names.iter().find(|name| !self.contains(name)) {
            return Err(DomainError::validation(format!("unknown stage: {unknown}")));
        }
        Ok(())
    }

    /// The stage list for a new job: `requested` if given, else the default.
    pub fn resolve_pipeline(&self, requested: Option<Vec<String>>) -> DomainResult<Vec<String>> {
        let names = requested.unwrap_or_else(|| self.default_pipeline.clone());
        self.validate_pipeline(&names)?;
        Ok(names)
    }
}
