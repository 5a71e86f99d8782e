// src/services/elevenlabs.rs
//! Voice synthesis adapters.
//!
//! The adapter is chosen once from `voice.provider`; callers only see the
//! [`VoiceSynthesizer`] trait. When no provider is configured the disabled
//! adapter keeps the rest of the application working text-only.

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::{Voice, VoiceSynthesizer};
use crate::config::{VoiceConfig, VoiceProvider};
use crate::error::CoachError;

/// Fixed coach voices offered when the provider cannot list its own.
pub fn default_voices() -> Vec<Voice> {
    [
        ("Coach Voice (Default)", "21m00Tcm4TlvDq8ikWAM"),
        ("Female Coach", "AZnzlk1XvdvUeBnXmlld"),
        ("Authoritative Male", "pNInz6obpgDQGcFmaJgB"),
        ("Commanding Female", "EXAVITQu4vr4xnSDxMaL"),
    ]
    .into_iter()
    .map(|(name, id)| Voice {
        voice_id: id.to_string(),
        name: name.to_string(),
    })
    .collect()
}

/// Pick the adapter for the configured provider.
pub fn build_synthesizer(config: &VoiceConfig) -> Result<Arc<dyn VoiceSynthesizer>, CoachError> {
    match config.provider {
        VoiceProvider::ElevenLabs if !config.api_key.is_empty() => {
            Ok(Arc::new(ElevenLabsSynthesizer::new(config)?))
        }
        VoiceProvider::ElevenLabs => {
            warn!("[Voice] ElevenLabs selected without an API key, voice output disabled");
            Ok(Arc::new(DisabledSynthesizer))
        }
        VoiceProvider::Disabled => Ok(Arc::new(DisabledSynthesizer)),
    }
}

/// ElevenLabs REST client
pub struct ElevenLabsSynthesizer {
    client: Client,
    base_url: String,
    api_key: String,
    model_id: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: &VoiceConfig) -> Result<Self, CoachError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CoachError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model_id: config.model_id.clone(),
        })
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<WireVoice>,
}

#[derive(Debug, Deserialize)]
struct WireVoice {
    #[serde(alias = "id")]
    voice_id: String,
    #[serde(default)]
    name: String,
}

#[async_trait]
impl VoiceSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, CoachError> {
        let response = self
            .client
            .post(format!("{}/v1/text-to-speech/{}", self.base_url, voice_id))
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&SpeechRequest {
                text,
                model_id: &self.model_id,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CoachError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let audio = response.bytes().await?;
        info!("[Voice] Synthesized {} bytes with voice {}", audio.len(), voice_id);
        Ok(audio.to_vec())
    }

    async fn list_voices(&self) -> Result<Vec<Voice>, CoachError> {
        let response = self
            .client
            .get(format!("{}/v1/voices", self.base_url))
            .header("xi-api-key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CoachError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: VoicesResponse = response
            .json()
            .await
            .map_err(|e| CoachError::Parse(format!("voice list: {}", e)))?;

        Ok(body.voices.into_iter().map(WireVoice::into_voice).collect())
    }
}

impl WireVoice {
    fn into_voice(self) -> Voice {
        let name = if self.name.is_empty() {
            self.voice_id.clone()
        } else {
            self.name
        };
        Voice {
            voice_id: self.voice_id,
            name,
        }
    }
}

/// Stand-in used when voice output is not configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSynthesizer;

#[async_trait]
impl VoiceSynthesizer for DisabledSynthesizer {
    async fn synthesize(&self, _text: &str, _voice_id: &str) -> Result<Vec<u8>, CoachError> {
        Err(CoachError::VoiceUnavailable(
            "no voice provider configured".into(),
        ))
    }

    async fn list_voices(&self) -> Result<Vec<Voice>, CoachError> {
        Err(CoachError::VoiceUnavailable(
            "no voice provider configured".into(),
        ))
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Process-lifetime cache of available voices with a fixed fallback list.
pub struct VoiceCatalog {
    synthesizer: Arc<dyn VoiceSynthesizer>,
    default_voice_id: String,
    cached: Mutex<Option<Vec<Voice>>>,
}

impl VoiceCatalog {
    pub fn new(synthesizer: Arc<dyn VoiceSynthesizer>, default_voice_id: impl Into<String>) -> Self {
        Self {
            synthesizer,
            default_voice_id: default_voice_id.into(),
            cached: Mutex::new(None),
        }
    }

    pub async fn voices(&self) -> Vec<Voice> {
        let mut cached = self.cached.lock().await;
        if let Some(voices) = cached.as_ref() {
            return voices.clone();
        }

        let voices = if self.synthesizer.is_enabled() {
            match self.synthesizer.list_voices().await {
                Ok(voices) if !voices.is_empty() => voices,
                Ok(_) => {
                    warn!("[Voice] Provider returned no voices, using defaults");
                    default_voices()
                }
                Err(e) => {
                    warn!("[Voice] Could not list voices ({}), using defaults", e);
                    default_voices()
                }
            }
        } else {
            default_voices()
        };

        *cached = Some(voices.clone());
        voices
    }

    /// Map a voice name or id to an id. Names match case-insensitively;
    /// anything unknown resolves to the default voice.
    pub async fn resolve(&self, name_or_id: &str) -> String {
        let wanted = name_or_id.trim();
        let voices = self.voices().await;

        if let Some(voice) = voices.iter().find(|v| v.voice_id == wanted) {
            return voice.voice_id.clone();
        }
        if let Some(voice) = voices
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(wanted))
        {
            return voice.voice_id.clone();
        }

        if !wanted.is_empty() {
            warn!(
                "[Voice] Unknown voice '{}', using default {}",
                wanted, self.default_voice_id
            );
        }
        self.default_voice_id.clone()
    }
}
