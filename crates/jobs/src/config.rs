//! Immutable per-job configuration and input.

use serde::{Deserialize, Serialize};

use docpipe_core::{DomainError, DomainResult};

pub const MAX_CUSTOM_TAGS: usize = 20;
pub const MAX_TAG_LEN: usize = 50;
pub const MAX_RETRIES_CEILING: u32 = 10;

/// How many cards the generation stages aim for per topic.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardDensity {
    Low,
    #[default]
    Medium,
    High,
}

/// Generation parameters fixed at job creation and handed to every stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub card_density: CardDensity,
    pub subject: Option<String>,
    pub chapter: Option<String>,
    pub custom_tags: Vec<String>,
    /// 1-based, inclusive.
    pub page_start: Option<u32>,
    /// 1-based, inclusive.
    pub page_end: Option<u32>,
    /// Overrides the deployment default when set.
    pub max_retries: Option<u32>,
}

impl JobConfig {
    pub fn validate(&self) -> DomainResult<()> {
        if self.custom_tags.len() > MAX_CUSTOM_TAGS {
            return Err(DomainError::validation(format!(
                "at most {MAX_CUSTOM_TAGS} custom tags are allowed"
            )));
        }
        for tag in &self.custom_tags {
            if tag.trim().is_empty() {
                return Err(DomainError::validation("custom tags cannot be empty"));
            }
            if tag.chars().count() > MAX_TAG_LEN {
                return Err(DomainError::validation(format!(
                    "custom tag exceeds {MAX_TAG_LEN} characters: {tag}"
                )));
            }
        }

        match (self.page_start, self.page_end) {
            (Some(0), _) | (_, Some(0)) => {
                return Err(DomainError::validation("page numbers are 1-based"));
            }
            (Some(start), Some(end)) if start > end => {
                return Err(DomainError::validation(format!(
                    "page_start ({start}) must not exceed page_end ({end})"
                )));
            }
            _ => {}
        }

        if let Some(max) = self.max_retries {
            if max > MAX_RETRIES_CEILING {
                return Err(DomainError::validation(format!(
                    "max_retries must be at most {MAX_RETRIES_CEILING}"
                )));
            }
        }

        Ok(())
    }

    /// Name used for the generated artifact: chapter, then subject, then the
    /// source file stem.
    pub fn artifact_name(&self, input: &JobInput) -> String {
        let non_empty = |s: &Option<String>| s.as_deref().filter(|v| !v.trim().is_empty()).map(str::to_string);
        non_empty(&self.chapter)
            .or_else(|| non_empty(&self.subject))
            .unwrap_or_else(|| input.file_stem().to_string())
    }
}

/// The uploaded document a job processes. Stage 0 receives this as its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    pub source_filename: String,
    /// Blob-storage reference of the uploaded document.
    pub source_reference: String,
}

impl JobInput {
    pub fn new(source_filename: impl Into<String>, source_reference: impl Into<String>) -> Self {
        Self {
            source_filename: source_filename.into(),
            source_reference: source_reference.into(),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.source_filename.trim().is_empty() {
            return Err(DomainError::validation("source_filename cannot be empty"));
        }
        if self.source_reference.trim().is_empty() {
            return Err(DomainError::validation("source_reference cannot be empty"));
        }
        Ok(())
    }

    pub fn file_stem(&self) -> &str {
        let name = self.source_filename.rsplit('/').next().unwrap_or(&self.source_filename);
        match name.rfind('.') {
            Some(0) | None => name,
            Some(dot) => &name[..dot],
        }
    }
}
