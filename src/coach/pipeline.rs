// src/coach/pipeline.rs
//! Request orchestration.
//!
//! One request runs strictly in sequence: validation, cache lookup, upload
//! and poll for each asset, Stage 1, cache store, Stage 2. Every remote file
//! created along the way is deleted when the run ends, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::analysis::{AnalysisContext, AnalysisStage, PromptTemplate};
use super::extraction::{ExtractionStage, StructuredReport};
use super::upload::UploadController;
use crate::cache::{CacheEntry, Fingerprint, FingerprintCache};
use crate::config::Config;
use crate::error::CoachError;
use crate::progress::{AssetSlice, Phase, ProgressTracker, ANALYSIS_START, COMPLETE, EXTRACTION_START};
use crate::retry::RetryPolicy;
use crate::services::{GenerationConfig, GenerationService, MediaService, RemoteMediaHandle};
use crate::storage::{AnalysisResult, MediaAsset, MediaKind};

/// The unit of work: media plus the athlete's question and profile.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub assets: Vec<MediaAsset>,
    pub query: String,
    pub context: AnalysisContext,
}

impl AnalysisRequest {
    pub fn new(assets: Vec<MediaAsset>, query: impl Into<String>, context: AnalysisContext) -> Self {
        Self {
            assets,
            query: query.into(),
            context,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.assets, &self.query, &self.context.render())
    }
}

/// An asset left out of the analysis because it could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedMedia {
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub fingerprint: Fingerprint,
    pub report: AnalysisResult,
    /// `None` when Stage 2 was disabled or produced nothing usable
    pub structured: Option<StructuredReport>,
    pub cache_hit: bool,
    pub elapsed: Duration,
    pub skipped: Vec<SkippedMedia>,
}

/// Tunables for a [`Pipeline`], normally derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub processing_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub extract_structured: bool,
    pub require_query: bool,
    pub template: PromptTemplate,
    pub analysis: GenerationConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            processing_timeout: Duration::from_secs(180),
            request_timeout: None,
            extract_structured: true,
            require_query: false,
            template: PromptTemplate::technique(),
            analysis: GenerationConfig {
                temperature: Some(0.4),
                max_output_tokens: Some(8192),
                ..GenerationConfig::default()
            },
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self, CoachError> {
        let template = match &config.analysis.prompt_template_path {
            Some(path) => PromptTemplate::from_file(path)?,
            None => PromptTemplate::by_name(&config.analysis.template).ok_or_else(|| {
                CoachError::Validation(format!(
                    "unknown prompt template '{}'",
                    config.analysis.template
                ))
            })?,
        };

        Ok(Self {
            retry: RetryPolicy::from(&config.retry),
            poll_interval: config.pipeline.poll_interval(),
            processing_timeout: config.pipeline.processing_timeout(),
            request_timeout: config.pipeline.request_timeout(),
            extract_structured: config.pipeline.extract_structured,
            require_query: config.analysis.require_query,
            template,
            analysis: GenerationConfig {
                temperature: config.analysis.temperature,
                max_output_tokens: config.analysis.max_output_tokens,
                ..GenerationConfig::default()
            },
        })
    }
}

pub struct Pipeline {
    media: Arc<dyn MediaService>,
    uploader: UploadController,
    analysis: AnalysisStage,
    extraction: Option<ExtractionStage>,
    cache: Arc<FingerprintCache>,
    request_timeout: Option<Duration>,
    require_query: bool,
}

/// What one uncached run produced before cleanup.
struct RunOutput {
    report: AnalysisResult,
    structured: Option<StructuredReport>,
    skipped: Vec<SkippedMedia>,
}

impl Pipeline {
    pub fn new(
        media: Arc<dyn MediaService>,
        generation: Arc<dyn GenerationService>,
        cache: Arc<FingerprintCache>,
        settings: PipelineSettings,
    ) -> Self {
        let uploader = UploadController::new(
            media.clone(),
            settings.retry.clone(),
            settings.poll_interval,
            settings.processing_timeout,
        );
        let analysis = AnalysisStage::new(
            generation.clone(),
            settings.retry.clone(),
            settings.template,
            settings.analysis,
        );
        let extraction = settings
            .extract_structured
            .then(|| ExtractionStage::new(generation, settings.retry));

        Self {
            media,
            uploader,
            analysis,
            extraction,
            cache,
            request_timeout: settings.request_timeout,
            require_query: settings.require_query,
        }
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    /// Reject requests that must not reach the network.
    pub fn validate(&self, request: &AnalysisRequest) -> Result<(), CoachError> {
        if request.assets.is_empty() {
            return Err(CoachError::Validation(
                "at least one video or image is required".into(),
            ));
        }
        if self.require_query && request.query.trim().is_empty() {
            return Err(CoachError::Validation("a question for the coach is required".into()));
        }
        for asset in &request.assets {
            if asset.bytes.is_empty() {
                return Err(CoachError::Validation(format!("{} is empty", asset.file_name)));
            }
            if asset.kind == MediaKind::Unknown {
                return Err(CoachError::Validation(format!(
                    "{} is not a supported video or image ({})",
                    asset.file_name, asset.mime_type
                )));
            }
        }
        Ok(())
    }

    pub async fn run(
        &self,
        request: &AnalysisRequest,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, CoachError> {
        self.validate(request)?;
        let started = Instant::now();
        let fingerprint = request.fingerprint();

        if let Some(entry) = self.cache.get(&fingerprint) {
            info!(
                "[Cache] Returning cached analysis for {} ({} hits)",
                fingerprint.short(),
                self.cache.hits()
            );
            let structured = match (&entry.structured, &self.extraction) {
                (None, Some(extraction)) => {
                    self.extract_cached(extraction, &fingerprint, &entry.report, progress, cancel)
                        .await?
                }
                _ => entry.structured,
            };
            progress.report(Phase::Complete, COMPLETE, "Loaded cached analysis");
            return Ok(PipelineOutcome {
                fingerprint,
                report: entry.report,
                structured,
                cache_hit: true,
                elapsed: started.elapsed(),
                skipped: Vec::new(),
            });
        }

        let mut created = Vec::new();
        let result = match self.request_timeout {
            Some(limit) => {
                match tokio::time::timeout(
                    limit,
                    self.execute(request, &fingerprint, &mut created, progress, cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("[Pipeline] Request exceeded {}s deadline", limit.as_secs());
                        Err(CoachError::Timeout(format!(
                            "analysis did not finish within {}s",
                            limit.as_secs()
                        )))
                    }
                }
            }
            None => {
                self.execute(request, &fingerprint, &mut created, progress, cancel)
                    .await
            }
        };

        self.cleanup(&created).await;

        let output = result?;
        let elapsed = started.elapsed();
        info!(
            "[Pipeline] Analysis complete in {:.1}s ({} skipped)",
            elapsed.as_secs_f64(),
            output.skipped.len()
        );
        progress.report(Phase::Complete, COMPLETE, "Analysis complete");

        Ok(PipelineOutcome {
            fingerprint,
            report: output.report,
            structured: output.structured,
            cache_hit: false,
            elapsed,
            skipped: output.skipped,
        })
    }

    async fn execute(
        &self,
        request: &AnalysisRequest,
        fingerprint: &Fingerprint,
        created: &mut Vec<String>,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, CoachError> {
        let count = request.assets.len();
        let mut ready: Vec<RemoteMediaHandle> = Vec::with_capacity(count);
        let mut skipped = Vec::new();
        let mut last_error = None;

        for (index, asset) in request.assets.iter().enumerate() {
            let slice = AssetSlice::for_asset(index, count);
            let handle = self.uploader.upload(asset, progress, slice, cancel).await?;
            created.push(handle.name.clone());

            match self
                .uploader
                .wait_ready(handle, &asset.file_name, progress, slice, cancel)
                .await
            {
                Ok(handle) => ready.push(handle),
                Err(err @ (CoachError::Timeout(_) | CoachError::ProcessingFailed { .. })) => {
                    warn!("[Pipeline] Skipping {}: {}", asset.file_name, err);
                    skipped.push(SkippedMedia {
                        file_name: asset.file_name.clone(),
                        reason: err.to_string(),
                    });
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        if ready.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                CoachError::Validation("no media became ready for analysis".into())
            }));
        }

        if cancel.is_cancelled() {
            return Err(CoachError::Cancelled);
        }
        progress.report(
            Phase::Analyzing,
            ANALYSIS_START,
            format!("Analyzing {} media file(s)", ready.len()),
        );
        let report = self
            .analysis
            .analyze(&ready, &request.query, &request.context, cancel)
            .await?;

        self.cache.put(
            fingerprint.clone(),
            CacheEntry {
                report: report.clone(),
                structured: None,
            },
        );

        let structured = match &self.extraction {
            Some(extraction) => {
                if cancel.is_cancelled() {
                    return Err(CoachError::Cancelled);
                }
                progress.report(Phase::Extracting, EXTRACTION_START, "Extracting metrics");
                let structured = extraction.extract(&report, cancel).await?;
                if structured.is_some() {
                    self.cache.put(
                        fingerprint.clone(),
                        CacheEntry {
                            report: report.clone(),
                            structured: structured.clone(),
                        },
                    );
                }
                structured
            }
            None => None,
        };

        Ok(RunOutput {
            report,
            structured,
            skipped,
        })
    }

    /// Stage 2 for a cached report that has no structured data yet.
    async fn extract_cached(
        &self,
        extraction: &ExtractionStage,
        fingerprint: &Fingerprint,
        report: &AnalysisResult,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Option<StructuredReport>, CoachError> {
        if cancel.is_cancelled() {
            return Err(CoachError::Cancelled);
        }
        info!("[Cache] Cached report for {} has no metrics, extracting", fingerprint.short());
        progress.report(Phase::Extracting, EXTRACTION_START, "Extracting metrics");

        let extract = extraction.extract(report, cancel);
        let structured = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, extract).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("[Pipeline] Metric extraction exceeded {}s deadline", limit.as_secs());
                    None
                }
            },
            None => extract.await?,
        };

        if structured.is_some() {
            self.cache.put(
                fingerprint.clone(),
                CacheEntry {
                    report: report.clone(),
                    structured: structured.clone(),
                },
            );
        }
        Ok(structured)
    }

    async fn cleanup(&self, names: &[String]) {
        for name in names {
            if let Err(e) = self.media.delete(name).await {
                warn!("[Pipeline] Failed to delete remote file {}: {}", name, e);
            }
        }
    }
}
