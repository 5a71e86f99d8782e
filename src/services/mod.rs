// src/services/mod.rs
//! Remote collaborators: media upload/status, text generation and voice
//! synthesis, each behind a trait with one HTTP adapter.

pub mod elevenlabs;
pub mod gemini;
pub mod traits;

pub use elevenlabs::{build_synthesizer, default_voices, DisabledSynthesizer, ElevenLabsSynthesizer, VoiceCatalog};
pub use gemini::GeminiServiceImpl;
pub use traits::*;

use std::sync::Arc;

use crate::config::Config;
use crate::error::CoachError;

/// Shared handles to every remote service the application uses
#[derive(Clone)]
pub struct ServiceManager {
    media: Arc<dyn MediaService>,
    generation: Arc<dyn GenerationService>,
    voice: Arc<dyn VoiceSynthesizer>,
}

impl ServiceManager {
    /// Build the HTTP adapters selected by configuration
    pub fn from_config(config: &Config) -> Result<Self, CoachError> {
        let gemini = Arc::new(GeminiServiceImpl::new(&config.gemini)?);
        let voice = build_synthesizer(&config.voice)?;

        Ok(Self {
            media: gemini.clone(),
            generation: gemini,
            voice,
        })
    }

    pub fn new(
        media: Arc<dyn MediaService>,
        generation: Arc<dyn GenerationService>,
        voice: Arc<dyn VoiceSynthesizer>,
    ) -> Self {
        Self {
            media,
            generation,
            voice,
        }
    }

    pub fn media(&self) -> Arc<dyn MediaService> {
        self.media.clone()
    }

    pub fn generation(&self) -> Arc<dyn GenerationService> {
        self.generation.clone()
    }

    pub fn voice(&self) -> Arc<dyn VoiceSynthesizer> {
        self.voice.clone()
    }
}
