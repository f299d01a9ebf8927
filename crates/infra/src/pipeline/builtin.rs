//! Built-in stages registered by the server.
//!
//! The real extraction and generation steps live outside this crate; these
//! stand-ins keep the pipeline runnable end to end. Each one records its name
//! in the payload it forwards, and the last one names the produced artifact.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};

use docpipe_core::DomainResult;
use docpipe_jobs::{JobConfig, JobInput};

use super::registry::StageRegistry;
use super::stage::{Stage, StageError};

/// Stage names of the default learning-artifact pipeline, in order.
pub const LEARNING_PIPELINE: [&str; 8] = [
    "load_document",
    "chunk_document",
    "extract_topics",
    "refine_topics",
    "generate_tags",
    "generate_questions",
    "generate_answers",
    "package_artifact",
];

const APPLIED_KEY: &str = "applied_stages";

/// Forwards its input, appending its own name to `applied_stages`.
#[derive(Debug, Clone)]
pub struct PassthroughStage {
    name: String,
}

impl PassthroughStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

fn forward(name: &str, input: JsonValue) -> Map<String, JsonValue> {
    let mut payload = match input {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    let applied = payload
        .entry(APPLIED_KEY)
        .or_insert_with(|| JsonValue::Array(Vec::new()));
    if let JsonValue::Array(names) = applied {
        names.push(JsonValue::String(name.to_string()));
    }
    payload
}

#[async_trait]
impl Stage for PassthroughStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: JsonValue, _config: &JobConfig) -> Result<JsonValue, StageError> {
        Ok(JsonValue::Object(forward(&self.name, input)))
    }
}

/// Names the artifact from the carried job input and the job config.
#[derive(Debug, Clone, Default)]
pub struct PackageArtifactStage;

#[async_trait]
impl Stage for PackageArtifactStage {
    fn name(&self) -> &str {
        "package_artifact"
    }

    async fn execute(&self, input: JsonValue, config: &JobConfig) -> Result<JsonValue, StageError> {
        let source: JobInput = serde_json::from_value(input.clone()).map_err(|e| {
            StageError::validation(format!("package input lacks the source document: {e}"))
        })?;

        let payload = forward(self.name(), input);
        Ok(json!({
            "artifact_name": config.artifact_name(&source),
            "artifact_reference": format!("artifacts/{}.apkg", source.file_stem()),
            "applied_stages": payload.get(APPLIED_KEY).cloned().unwrap_or_default(),
        }))
    }
}

/// A registry with every stage of [`LEARNING_PIPELINE`] as its default.
pub fn learning_pipeline_registry() -> DomainResult<StageRegistry> {
    let mut registry = StageRegistry::new();
    for name in &LEARNING_PIPELINE[..LEARNING_PIPELINE.len() - 1] {
        registry.register(Arc::new(PassthroughStage::new(*name)));
    }
    registry.register(Arc::new(PackageArtifactStage));
    registry.with_default_pipeline(LEARNING_PIPELINE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_accumulates_stage_names() {
        let config = JobConfig::default();
        let input = json!({ "source_filename": "cells.pdf", "source_reference": "pdfs/cells.pdf" });

        let out = PassthroughStage::new("load_document")
            .execute(input, &config)
            .await
            .unwrap();
        let out = PassthroughStage::new("chunk_document")
            .execute(out, &config)
            .await
            .unwrap();

        assert_eq!(out["source_filename"], "cells.pdf");
        assert_eq!(out["applied_stages"], json!(["load_document", "chunk_document"]));
    }

    #[tokio::test]
    async fn package_names_artifact_after_chapter() {
        let config = JobConfig {
            chapter: Some("Mitosis".into()),
            ..JobConfig::default()
        };
        let input = json!({ "source_filename": "cells.pdf", "source_reference": "pdfs/cells.pdf" });

        let out = PackageArtifactStage.execute(input, &config).await.unwrap();
        assert_eq!(out["artifact_name"], "Mitosis");
        assert_eq!(out["artifact_reference"], "artifacts/cells.apkg");
        assert_eq!(out["applied_stages"], json!(["package_artifact"]));
    }

    #[tokio::test]
    async fn package_without_source_is_a_validation_error() {
        let err = PackageArtifactStage
            .execute(json!({ "chunks": [] }), &JobConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::pipeline::StageErrorKind::Validation);
    }

    #[test]
    fn learning_registry_has_eight_default_stages() {
        let registry = learning_pipeline_registry().unwrap();
        assert_eq!(registry.default_pipeline().len(), 8);
        assert!(LEARNING_PIPELINE.iter().all(|name| registry.contains(name)));
    }
}
