// src/coach/mod.rs
//! The analysis pipeline: upload and poll, Stage 1 report, Stage 2
//! extraction and the optional spoken version of the report.

pub mod analysis;
pub mod audio;
pub mod extraction;
pub mod heuristic;
pub mod pipeline;
pub mod upload;

pub use analysis::{AnalysisContext, AnalysisStage, PromptTemplate};
pub use audio::{generate_audio_script, AudioState, AudioTask};
pub use extraction::{ExtractionStage, MetricGroup, StructuredReport};
pub use pipeline::{AnalysisRequest, Pipeline, PipelineOutcome, PipelineSettings, SkippedMedia};
pub use upload::UploadController;
