// src/progress.rs
//! Phase-partitioned progress reporting.
//!
//! Overall progress is split into non-overlapping ranges: upload and remote
//! processing share 10-50, Stage 1 starts at 60, Stage 2 at 80 and a finished
//! run reports 100. Reported percentages never go backwards.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

pub const UPLOAD_START: u8 = 10;
pub const PROCESSING_END: u8 = 50;
pub const ANALYSIS_START: u8 = 60;
pub const EXTRACTION_START: u8 = 80;
pub const COMPLETE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Uploading,
    Processing,
    Analyzing,
    Extracting,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub percent: u8,
    pub detail: String,
}

/// Receives progress updates; implemented for closures and channels.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: &ProgressUpdate) {
        self(update)
    }
}

/// Forwards updates into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelProgress(pub UnboundedSender<ProgressUpdate>);

impl ProgressSink for ChannelProgress {
    fn report(&self, update: &ProgressUpdate) {
        // Receiver gone means nobody is watching.
        let _ = self.0.send(update.clone());
    }
}

/// Writes each update to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, update: &ProgressUpdate) {
        info!(
            "[Progress] {:>3}% {:?}: {}",
            update.percent, update.phase, update.detail
        );
    }
}

/// Forwards updates to a sink, clamping percentages so they only increase.
pub struct ProgressTracker {
    sink: Arc<dyn ProgressSink>,
    current: AtomicU8,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            current: AtomicU8::new(0),
        }
    }

    /// Tracker that drops every update.
    pub fn silent() -> Self {
        Self::new(Arc::new(|_: &ProgressUpdate| {}))
    }

    pub fn report(&self, phase: Phase, percent: u8, detail: impl Into<String>) {
        let requested = percent.min(COMPLETE);
        let previous = self.current.fetch_max(requested, Ordering::SeqCst);
        let update = ProgressUpdate {
            phase,
            percent: previous.max(requested),
            detail: detail.into(),
        };
        self.sink.report(&update);
    }

    pub fn current(&self) -> u8 {
        self.current.load(Ordering::SeqCst)
    }
}

/// The share of the upload/processing range owned by one asset.
///
/// The first half of a slice covers the upload, the second half is filled
/// in proportion to elapsed processing time against the poll ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetSlice {
    start: f64,
    end: f64,
}

impl AssetSlice {
    /// Slice for asset `index` out of `count`.
    pub fn for_asset(index: usize, count: usize) -> Self {
        let count = count.max(1) as f64;
        let width = f64::from(PROCESSING_END - UPLOAD_START) / count;
        let start = f64::from(UPLOAD_START) + width * index as f64;
        Self {
            start,
            end: start + width,
        }
    }

    pub fn upload_percent(&self) -> u8 {
        self.start.round() as u8
    }

    pub fn processing_percent(&self, elapsed: Duration, ceiling: Duration) -> u8 {
        let mid = (self.start + self.end) / 2.0;
        let ratio = if ceiling.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / ceiling.as_secs_f64()).min(1.0)
        };
        (mid + ratio * (self.end - mid)).round() as u8
    }

    pub fn end_percent(&self) -> u8 {
        self.end.round() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn single_asset_spans_upload_and_processing_range() {
        let slice = AssetSlice::for_asset(0, 1);
        assert_eq!(slice.upload_percent(), 10);

        let ceiling = Duration::from_secs(180);
        assert_eq!(slice.processing_percent(Duration::ZERO, ceiling), 30);
        assert_eq!(slice.processing_percent(Duration::from_secs(90), ceiling), 40);
        assert_eq!(slice.processing_percent(Duration::from_secs(900), ceiling), 50);
    }

    #[test]
    fn slices_partition_without_overlap() {
        let first = AssetSlice::for_asset(0, 4);
        let second = AssetSlice::for_asset(1, 4);
        assert_eq!(first.end_percent(), 20);
        assert_eq!(second.upload_percent(), 20);
        assert_eq!(AssetSlice::for_asset(3, 4).end_percent(), PROCESSING_END);
    }

    #[test]
    fn tracker_never_goes_backwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let tracker = ProgressTracker::new(Arc::new(move |update: &ProgressUpdate| {
            sink_seen.lock().unwrap().push(update.percent);
        }));

        tracker.report(Phase::Processing, 45, "processing");
        tracker.report(Phase::Uploading, 20, "late upload update");
        tracker.report(Phase::Analyzing, ANALYSIS_START, "stage 1");

        assert_eq!(*seen.lock().unwrap(), vec![45, 45, 60]);
        assert_eq!(tracker.current(), 60);
    }

    #[tokio::test]
    async fn channel_sink_forwards_updates() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tracker = ProgressTracker::new(Arc::new(ChannelProgress(tx)));
        tracker.report(Phase::Complete, COMPLETE, "done");

        let update = rx.recv().await.unwrap();
        assert_eq!(update.phase, Phase::Complete);
        assert_eq!(update.percent, 100);
    }
}
