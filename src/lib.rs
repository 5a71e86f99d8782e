// src/lib.rs
//! Two-stage coaching analysis of sports-technique media.
//!
//! Media is uploaded to a multimodal model service, polled until ready,
//! analysed into a Markdown report (Stage 1) and then mined for a structured
//! metric report (Stage 2). Results are cached by content fingerprint.

pub mod cache;
pub mod coach;
pub mod config;
pub mod error;
pub mod progress;
pub mod retry;
pub mod services;
pub mod storage;

pub use cache::{Fingerprint, FingerprintCache};
pub use coach::pipeline::{AnalysisRequest, Pipeline, PipelineOutcome};
pub use config::Config;
pub use error::CoachError;
