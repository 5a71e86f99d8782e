// src/services/traits.rs
//! Service layer trait definitions
//!
//! The pipeline only talks to remote systems through these traits, so the
//! HTTP adapters can be swapped for in-memory doubles in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoachError;
use crate::storage::MediaAsset;

/// Remote processing state of an uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl ProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Ready | ProcessingState::Failed)
    }
}

/// The remote service's reference to an uploaded asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMediaHandle {
    /// Opaque resource name used for status and delete calls
    pub name: String,
    /// URI referenced from generation requests once ready
    pub uri: String,
    pub mime_type: String,
    pub state: ProcessingState,
    pub created_at: Option<DateTime<Utc>>,
    /// Remote-provided failure reason, when the state is `Failed`
    pub error: Option<String>,
}

impl RemoteMediaHandle {
    pub fn is_ready(&self) -> bool {
        self.state == ProcessingState::Ready
    }
}

/// Remote media upload/status service
#[async_trait]
pub trait MediaService: Send + Sync {
    /// Push the asset's bytes and return the initial handle
    async fn upload(&self, asset: &MediaAsset) -> Result<RemoteMediaHandle, CoachError>;

    /// Fetch the current state of a handle by name
    async fn status(&self, name: &str) -> Result<RemoteMediaHandle, CoachError>;

    /// Release remote storage held by the handle
    async fn delete(&self, name: &str) -> Result<(), CoachError>;
}

/// One piece of a generation prompt
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Media { uri: String, mime_type: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text(text.into())
    }

    pub fn media(handle: &RemoteMediaHandle) -> Self {
        ContentPart::Media {
            uri: handle.uri.clone(),
            mime_type: handle.mime_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    /// Ask the model for machine-parseable JSON
    Json,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub parts: Vec<ContentPart>,
    pub config: GenerationConfig,
}

impl GenerationRequest {
    pub fn new(parts: Vec<ContentPart>, config: GenerationConfig) -> Self {
        Self { parts, config }
    }

    pub fn media_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, ContentPart::Media { .. }))
            .count()
    }
}

/// What came back from a generation call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationOutput {
    /// Concatenated candidate text, if any
    pub text: Option<String>,
    /// Set when the prompt itself was blocked
    pub block_reason: Option<String>,
    pub finish_reason: Option<String>,
}

impl GenerationOutput {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            block_reason: None,
            finish_reason: Some("STOP".to_string()),
        }
    }

    /// Reason the output should be treated as a safety block, if any.
    pub fn rejection(&self) -> Option<String> {
        if let Some(reason) = &self.block_reason {
            return Some(format!("prompt blocked ({})", reason));
        }
        match self.finish_reason.as_deref() {
            Some("SAFETY") | Some("PROHIBITED_CONTENT") | Some("BLOCKLIST") => {
                Some(format!("response blocked ({})", self.finish_reason.as_deref().unwrap_or_default()))
            }
            _ => None,
        }
    }

    /// Non-blank text, if any.
    pub fn non_empty_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// Remote generation service
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, CoachError>;

    /// Model identifier recorded with results
    fn model_name(&self) -> String;
}

/// Synthesis voice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
}

/// Text-to-speech capability, one adapter per supported provider
#[async_trait]
pub trait VoiceSynthesizer: Send + Sync {
    /// Render `text` with the given voice; returns encoded audio bytes
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, CoachError>;

    async fn list_voices(&self) -> Result<Vec<Voice>, CoachError>;

    fn is_enabled(&self) -> bool {
        true
    }
}
