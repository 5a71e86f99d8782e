// src/coach/audio.rs
//! Spoken version of a report.
//!
//! The report is first rewritten as a coach's monologue, then synthesized in
//! a background task. Failures stay inside the task; the analysis result is
//! never affected.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryPolicy;
use crate::services::{
    ContentPart, GenerationConfig, GenerationRequest, GenerationService, VoiceSynthesizer,
};

/// Rewrite `report` as a short spoken monologue. Falls back to the report
/// itself when the model call fails or returns nothing.
pub async fn generate_audio_script(
    generation: &dyn GenerationService,
    retry: &RetryPolicy,
    report: &str,
    cancel: &CancellationToken,
) -> String {
    let prompt = format!(
        "Turn the following technique report into a short spoken message from a coach \
talking directly to the athlete. Keep it encouraging and specific, under 250 words, \
with no headings, bullet points, or Markdown. Output only the words to be spoken.\n\n\
REPORT:\n{}",
        report
    );
    let request = GenerationRequest::new(
        vec![ContentPart::text(prompt)],
        GenerationConfig {
            temperature: Some(0.7),
            max_output_tokens: Some(1024),
            ..GenerationConfig::default()
        },
    );

    match retry
        .run_cancellable("audio script", cancel, || generation.generate(&request))
        .await
    {
        Ok(output) => match output.non_empty_text() {
            Some(script) => script.to_string(),
            None => {
                warn!("[Voice] Empty coach script, reading the report instead");
                report.to_string()
            }
        },
        Err(e) => {
            warn!("[Voice] Coach script generation failed ({}), reading the report instead", e);
            report.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioState {
    Running,
    Completed(Vec<u8>),
    Failed(String),
}

impl AudioState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, AudioState::Running)
    }
}

/// Background synthesis whose state can be polled or awaited.
pub struct AudioTask {
    state: watch::Receiver<AudioState>,
    handle: JoinHandle<()>,
}

impl AudioTask {
    pub fn spawn(
        synthesizer: Arc<dyn VoiceSynthesizer>,
        generation: Arc<dyn GenerationService>,
        retry: RetryPolicy,
        report: String,
        voice_id: String,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(AudioState::Running);

        let handle = tokio::spawn(async move {
            if !synthesizer.is_enabled() {
                let _ = tx.send(AudioState::Failed("voice output is not configured".into()));
                return;
            }

            let script = generate_audio_script(generation.as_ref(), &retry, &report, &cancel).await;
            if cancel.is_cancelled() {
                let _ = tx.send(AudioState::Failed("cancelled".into()));
                return;
            }

            let result = retry
                .run_cancellable("speech synthesis", &cancel, || {
                    synthesizer.synthesize(&script, &voice_id)
                })
                .await;

            let state = match result {
                Ok(audio) => {
                    info!("[Voice] Audio ready ({} bytes)", audio.len());
                    AudioState::Completed(audio)
                }
                Err(e) => {
                    warn!("[Voice] Audio generation failed: {}", e);
                    AudioState::Failed(e.to_string())
                }
            };
            let _ = tx.send(state);
        });

        Self { state: rx, handle }
    }

    /// Current state without waiting.
    pub fn state(&self) -> AudioState {
        self.state.borrow().clone()
    }

    /// Wait until the task has finished and return its final state.
    pub async fn wait(mut self) -> AudioState {
        loop {
            let current = self.state.borrow().clone();
            if current.is_finished() {
                return current;
            }
            if self.state.changed().await.is_err() {
                // Sender dropped without a final state: the task panicked or was aborted.
                let last = self.state.borrow().clone();
                if last.is_finished() {
                    return last;
                }
                return AudioState::Failed("audio task ended unexpectedly".into());
            }
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoachError;
    use crate::services::{DisabledSynthesizer, GenerationOutput, Voice};
    use async_trait::async_trait;

    struct ScriptGeneration(Result<String, ()>);

    #[async_trait]
    impl GenerationService for ScriptGeneration {
        async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationOutput, CoachError> {
            match &self.0 {
                Ok(text) => Ok(GenerationOutput::from_text(text.clone())),
                Err(()) => Err(CoachError::Api {
                    status: 500,
                    message: "backend unavailable".into(),
                }),
            }
        }

        fn model_name(&self) -> String {
            "script-model".into()
        }
    }

    struct EchoSynth;

    #[async_trait]
    impl VoiceSynthesizer for EchoSynth {
        async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, CoachError> {
            Ok(format!("{}:{}", voice_id, text).into_bytes())
        }

        async fn list_voices(&self) -> Result<Vec<Voice>, CoachError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn script_falls_back_to_report_on_failure() {
        let script = generate_audio_script(
            &ScriptGeneration(Err(())),
            &RetryPolicy::default(),
            "## Report",
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(script, "## Report");

        let script = generate_audio_script(
            &ScriptGeneration(Ok("Great work today.".into())),
            &RetryPolicy::default(),
            "## Report",
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(script, "Great work today.");
    }

    #[tokio::test]
    async fn task_completes_with_audio_bytes() {
        let task = AudioTask::spawn(
            Arc::new(EchoSynth),
            Arc::new(ScriptGeneration(Ok("Keep your front side closed.".into()))),
            RetryPolicy::default(),
            "## Report".into(),
            "voice-1".into(),
            CancellationToken::new(),
        );

        match task.wait().await {
            AudioState::Completed(bytes) => {
                assert_eq!(bytes, b"voice-1:Keep your front side closed.".to_vec());
            }
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn disabled_voice_fails_without_panicking() {
        let task = AudioTask::spawn(
            Arc::new(DisabledSynthesizer),
            Arc::new(ScriptGeneration(Ok("unused".into()))),
            RetryPolicy::default(),
            "## Report".into(),
            "voice-1".into(),
            CancellationToken::new(),
        );

        assert!(matches!(task.wait().await, AudioState::Failed(_)));
    }
}
