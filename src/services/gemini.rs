// src/services/gemini.rs
//! Gemini REST adapter for the file API and `generateContent`.
//!
//! Uploads use the resumable protocol: a `start` request returns an upload
//! URL, then the bytes are sent with `upload, finalize`. Uploaded files are
//! polled through `GET /v1beta/{name}` until the service marks them active.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::traits::{
    ContentPart, GenerationOutput, GenerationRequest, GenerationService, MediaService,
    ProcessingState, RemoteMediaHandle, ResponseFormat,
};
use crate::config::GeminiConfig;
use crate::error::CoachError;
use crate::storage::MediaAsset;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// HTTP client for the Gemini file and generation endpoints
pub struct GeminiServiceImpl {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiServiceImpl {
    pub fn new(config: &GeminiConfig) -> Result<Self, CoachError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CoachError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn file_url(&self, name: &str) -> String {
        format!("{}/v1beta/{}", self.base_url, name.trim_start_matches('/'))
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

#[async_trait]
impl MediaService for GeminiServiceImpl {
    async fn upload(&self, asset: &MediaAsset) -> Result<RemoteMediaHandle, CoachError> {
        info!(
            "[Upload] Sending {} ({:.1}MB, {})",
            asset.file_name,
            asset.size_mb(),
            asset.mime_type
        );

        let start = self
            .client
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", asset.size().to_string())
            .header("X-Goog-Upload-Header-Content-Type", &asset.mime_type)
            .json(&json!({ "file": { "display_name": asset.file_name } }))
            .send()
            .await?;
        let start = ensure_success(start).await?;

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CoachError::Parse("upload start returned no upload URL".into()))?;

        let response = self
            .client
            .post(upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(asset.bytes.clone())
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| CoachError::Parse(format!("upload response: {}", e)))?;

        let handle = body.file.into_handle();
        debug!("[Upload] {} -> {} ({:?})", asset.file_name, handle.name, handle.state);
        Ok(handle)
    }

    async fn status(&self, name: &str) -> Result<RemoteMediaHandle, CoachError> {
        let response = self
            .client
            .get(self.file_url(name))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let file: FileResource = response
            .json()
            .await
            .map_err(|e| CoachError::Parse(format!("file status: {}", e)))?;
        Ok(file.into_handle())
    }

    async fn delete(&self, name: &str) -> Result<(), CoachError> {
        let response = self
            .client
            .delete(self.file_url(name))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl GenerationService for GeminiServiceImpl {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, CoachError> {
        let body = GenerateContentRequest::from_request(request);

        let response = self
            .client
            .post(self.generate_url())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| CoachError::Parse(format!("generateContent response: {}", e)))?;
        Ok(parsed.into_output())
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

/// Turn a non-2xx response into `CoachError::Api`, keeping the remote message.
async fn ensure_success(response: Response) -> Result<Response, CoachError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(api_error(status.as_u16(), &body))
}

fn api_error(status: u16, body: &str) -> CoachError {
    let message = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|envelope| match envelope.error.status {
            Some(code) if !code.is_empty() => format!("{} ({})", envelope.error.message, code),
            _ => envelope.error.message,
        })
        .unwrap_or_else(|_| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("HTTP {}", status)
            } else {
                trimmed.to_string()
            }
        });

    CoachError::Api { status, message }
}

fn parse_state(state: Option<&str>) -> ProcessingState {
    match state {
        Some("ACTIVE") | Some("SUCCEEDED") => ProcessingState::Ready,
        Some("PROCESSING") => ProcessingState::Processing,
        Some("FAILED") => ProcessingState::Failed,
        _ => ProcessingState::Pending,
    }
}

// ---- wire types ----

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: FileResource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    create_time: Option<String>,
    #[serde(default)]
    error: Option<FileError>,
}

#[derive(Debug, Deserialize)]
struct FileError {
    #[serde(default)]
    message: String,
}

impl FileResource {
    fn into_handle(self) -> RemoteMediaHandle {
        let created_at = self
            .create_time
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        RemoteMediaHandle {
            state: parse_state(self.state.as_deref()),
            name: self.name,
            uri: self.uri,
            mime_type: self.mime_type,
            created_at,
            error: self.error.map(|e| e.message).filter(|m| !m.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<WireContent>,
    generation_config: WireGenerationConfig,
}

#[derive(Debug, Serialize)]
struct WireContent {
    role: &'static str,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WirePart {
    Text { text: String },
    File { file_data: WireFileData },
}

#[derive(Debug, Serialize)]
struct WireFileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

impl GenerateContentRequest {
    fn from_request(request: &GenerationRequest) -> Self {
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => WirePart::Text { text: text.clone() },
                ContentPart::Media { uri, mime_type } => WirePart::File {
                    file_data: WireFileData {
                        mime_type: mime_type.clone(),
                        file_uri: uri.clone(),
                    },
                },
            })
            .collect();

        let response_mime_type = match request.config.response_format {
            ResponseFormat::Json => Some("application/json"),
            ResponseFormat::Text => None,
        };

        Self {
            contents: vec![WireContent { role: "user", parts }],
            generation_config: WireGenerationConfig {
                temperature: request.config.temperature,
                max_output_tokens: request.config.max_output_tokens,
                response_mime_type,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    fn into_output(self) -> GenerationOutput {
        let block_reason = self.prompt_feedback.and_then(|f| f.block_reason);
        let first = self.candidates.into_iter().next();

        let finish_reason = first.as_ref().and_then(|c| c.finish_reason.clone());
        let text: String = first
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        GenerationOutput {
            text: if text.is_empty() { None } else { Some(text) },
            block_reason,
            finish_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::traits::GenerationConfig;

    #[test]
    fn builds_generate_body_with_file_parts() {
        let request = GenerationRequest::new(
            vec![
                ContentPart::text("Analyze the delivery"),
                ContentPart::Media {
                    uri: "https://files.test/abc".into(),
                    mime_type: "video/mp4".into(),
                },
            ],
            GenerationConfig {
                temperature: Some(0.2),
                max_output_tokens: Some(1024),
                response_format: ResponseFormat::Json,
            },
        );

        let body = serde_json::to_value(GenerateContentRequest::from_request(&request)).unwrap();
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Analyze the delivery");
        assert_eq!(
            body["contents"][0]["parts"][1]["file_data"]["file_uri"],
            "https://files.test/abc"
        );
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn text_requests_omit_response_mime_type() {
        let request = GenerationRequest::new(
            vec![ContentPart::text("hi")],
            GenerationConfig::default(),
        );
        let body = serde_json::to_value(GenerateContentRequest::from_request(&request)).unwrap();
        assert!(body["generationConfig"].get("responseMimeType").is_none());
        assert!(body["generationConfig"].get("temperature").is_none());
    }

    #[test]
    fn parses_candidate_text() {
        let raw = r###"{
            "candidates": [{
                "content": {"parts": [{"text": "## Summary\n"}, {"text": "Good arm path."}], "role": "model"},
                "finishReason": "STOP"
            }]
        }"###;
        let output = serde_json::from_str::<GenerateContentResponse>(raw)
            .unwrap()
            .into_output();
        assert_eq!(output.text.as_deref(), Some("## Summary\nGood arm path."));
        assert_eq!(output.finish_reason.as_deref(), Some("STOP"));
        assert!(output.rejection().is_none());
    }

    #[test]
    fn parses_blocked_prompt() {
        let raw = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let output = serde_json::from_str::<GenerateContentResponse>(raw)
            .unwrap()
            .into_output();
        assert!(output.text.is_none());
        assert_eq!(output.block_reason.as_deref(), Some("SAFETY"));
        assert!(output.rejection().is_some());
    }

    #[test]
    fn maps_file_states() {
        let raw = r#"{
            "name": "files/abc123",
            "mimeType": "video/mp4",
            "uri": "https://files.test/abc123",
            "state": "PROCESSING",
            "createTime": "2024-05-01T10:00:00.123456Z"
        }"#;
        let handle = serde_json::from_str::<FileResource>(raw).unwrap().into_handle();
        assert_eq!(handle.state, ProcessingState::Processing);
        assert!(handle.created_at.is_some());

        assert_eq!(parse_state(Some("ACTIVE")), ProcessingState::Ready);
        assert_eq!(parse_state(Some("FAILED")), ProcessingState::Failed);
        assert_eq!(parse_state(Some("STATE_UNSPECIFIED")), ProcessingState::Pending);
        assert_eq!(parse_state(None), ProcessingState::Pending);
    }

    #[test]
    fn error_envelope_keeps_remote_message() {
        let body = r#"{"error": {"code": 429, "message": "Resource has been exhausted (e.g. check quota).", "status": "RESOURCE_EXHAUSTED"}}"#;
        match api_error(429, body) {
            CoachError::Api { status, message } => {
                assert_eq!(status, 429);
                assert!(message.contains("check quota"));
                assert!(message.contains("RESOURCE_EXHAUSTED"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        match api_error(502, "") {
            CoachError::Api { message, .. } => assert_eq!(message, "HTTP 502"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn builds_urls_from_config() {
        let config = GeminiConfig {
            base_url: "https://example.test/".into(),
            ..GeminiConfig::default()
        };
        let service = GeminiServiceImpl::new(&config).unwrap();
        assert_eq!(service.file_url("files/abc"), "https://example.test/v1beta/files/abc");
        assert_eq!(
            service.generate_url(),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}
