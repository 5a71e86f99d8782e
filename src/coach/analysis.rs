// src/coach/analysis.rs
//! Stage 1: the free-text coaching report.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CoachError;
use crate::retry::RetryPolicy;
use crate::services::{
    ContentPart, GenerationConfig, GenerationRequest, GenerationService, RemoteMediaHandle,
};
use crate::storage::AnalysisResult;

const QUERY_PLACEHOLDER: &str = "{{query}}";
const CONTEXT_PLACEHOLDER: &str = "{{context}}";

/// Athlete details merged into the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub focus: Option<String>,
    pub age: Option<u32>,
    pub level: Option<String>,
}

impl AnalysisContext {
    pub fn is_empty(&self) -> bool {
        self.focus.is_none() && self.age.is_none() && self.level.is_none()
    }

    /// One-line profile, or an empty string when nothing is known.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let age = self
            .age
            .map(|age| age.to_string())
            .unwrap_or_else(|| "not specified".to_string());
        format!(
            "Athlete Profile: Age {}, Level: {}. Focus: {}.",
            age,
            self.level.as_deref().unwrap_or("not specified"),
            self.focus.as_deref().unwrap_or("overall technique"),
        )
    }
}

/// A prompt with `{{query}}` and `{{context}}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub name: String,
    body: String,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    pub fn technique() -> Self {
        Self::new("technique", TECHNIQUE_TEMPLATE)
    }

    pub fn biomechanics() -> Self {
        Self::new("biomechanics", BIOMECHANICS_TEMPLATE)
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "technique" => Some(Self::technique()),
            "biomechanics" => Some(Self::biomechanics()),
            _ => None,
        }
    }

    /// Load a custom template. Missing placeholders are appended so the
    /// request and profile always reach the model.
    pub fn from_file(path: &Path) -> Result<Self, CoachError> {
        let mut body = std::fs::read_to_string(path)?;
        if !body.contains(CONTEXT_PLACEHOLDER) {
            body.push_str("\n\n");
            body.push_str(CONTEXT_PLACEHOLDER);
        }
        if !body.contains(QUERY_PLACEHOLDER) {
            body.push_str("\n\n");
            body.push_str(QUERY_PLACEHOLDER);
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("custom")
            .to_string();
        Ok(Self::new(name, body))
    }

    pub fn render(&self, query: &str, context: &AnalysisContext) -> String {
        let query = query.trim();
        let query_line = if query.is_empty() {
            "User Request: None.".to_string()
        } else {
            format!("User Request: {}", query)
        };

        self.body
            .replace(CONTEXT_PLACEHOLDER, &context.render())
            .replace(QUERY_PLACEHOLDER, &query_line)
    }
}

/// Generates the Markdown report from ready media handles.
pub struct AnalysisStage {
    generation: Arc<dyn GenerationService>,
    retry: RetryPolicy,
    template: PromptTemplate,
    config: GenerationConfig,
}

impl AnalysisStage {
    pub fn new(
        generation: Arc<dyn GenerationService>,
        retry: RetryPolicy,
        template: PromptTemplate,
        config: GenerationConfig,
    ) -> Self {
        Self {
            generation,
            retry,
            template,
            config,
        }
    }

    pub async fn analyze(
        &self,
        handles: &[RemoteMediaHandle],
        query: &str,
        context: &AnalysisContext,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, CoachError> {
        if handles.is_empty() {
            return Err(CoachError::Validation(
                "no processed media available for analysis".into(),
            ));
        }
        if let Some(pending) = handles.iter().find(|h| !h.is_ready()) {
            return Err(CoachError::Validation(format!(
                "{} is not ready ({:?})",
                pending.name, pending.state
            )));
        }

        let mut parts = vec![ContentPart::text(self.template.render(query, context))];
        parts.extend(handles.iter().map(ContentPart::media));
        let request = GenerationRequest::new(parts, self.config.clone());

        info!(
            "[Stage 1] Generating report from {} media file(s) with template '{}'",
            handles.len(),
            self.template.name
        );

        let generation = self.generation.clone();
        let output = self
            .retry
            .run_cancellable("Stage 1 analysis", cancel, || generation.generate(&request))
            .await?;

        if let Some(reason) = output.rejection() {
            warn!("[Stage 1] Model rejected the request: {}", reason);
            return Err(CoachError::ContentRejected(reason));
        }
        let markdown = output.non_empty_text().ok_or_else(|| {
            CoachError::ContentRejected("the model returned an empty report".into())
        })?;

        Ok(AnalysisResult {
            markdown: markdown.to_string(),
            model: self.generation.model_name(),
            generated_at: Utc::now(),
            media_count: handles.len(),
        })
    }
}

const TECHNIQUE_TEMPLATE: &str = r#"You are an experienced sports technique coach reviewing footage of an athlete.

{{context}}

Study the attached media carefully and write a coaching report in Markdown with these sections:

## Summary
Two or three sentences on what the athlete is doing and the overall quality of the movement.

## Strengths
The parts of the technique that are working, with the moment in the clip where each is visible.

## Areas to Improve
The most important faults, ordered by impact. For each, describe what you see, why it costs performance or raises injury risk, and what it should look like instead.

## Drills
Three to five specific drills with sets, reps and cues that address the faults above.

## Injury Risk
Any loading pattern that deserves attention, or "none observed".

## Development Roadmap
What to focus on over the next few weeks, in order.

Use plain qualitative terms (excellent, good, average, poor) when judging control, command, velocity, power, rotation, sequencing and mobility so the report can be scored afterwards.

{{query}}"#;

const BIOMECHANICS_TEMPLATE: &str = r#"You are a sports biomechanist producing a motion analysis of the attached media.

{{context}}

Report in Markdown. Cover, phase by phase:

1. Setup and balance.
2. Lower body: leg drive, ground force and lead leg block.
3. Trunk: hip-shoulder separation, torso rotation velocity and sequencing of the kinetic chain.
4. Upper body: arm speed, shoulder external and internal rotation.
5. Mobility limits: shoulder, thoracic spine, hips and ankles.
6. Follow-through and deceleration.

Rate each item as excellent, good, average or poor and explain the rating from what is visible. Finish with a "Risks" list and a "Recommendations" list.

{{query}}"#;
