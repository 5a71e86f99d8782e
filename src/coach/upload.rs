// src/coach/upload.rs
//! Upload/poll controller.
//!
//! Pushes one asset to the media service and polls its processing state at
//! a fixed interval until it is ready, fails, or the processing ceiling is
//! reached. Ceiling overruns surface as `CoachError::Timeout`, remote
//! failures as `CoachError::ProcessingFailed`.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CoachError;
use crate::progress::{AssetSlice, Phase, ProgressTracker};
use crate::retry::RetryPolicy;
use crate::services::{MediaService, ProcessingState, RemoteMediaHandle};
use crate::storage::MediaAsset;

pub struct UploadController {
    media: Arc<dyn MediaService>,
    retry: RetryPolicy,
    poll_interval: Duration,
    ceiling: Duration,
}

impl UploadController {
    pub fn new(
        media: Arc<dyn MediaService>,
        retry: RetryPolicy,
        poll_interval: Duration,
        ceiling: Duration,
    ) -> Self {
        Self {
            media,
            retry,
            poll_interval,
            ceiling,
        }
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Upload and wait until ready. On any failure after the upload the
    /// remote file is deleted before the error is returned.
    pub async fn submit(
        &self,
        asset: &MediaAsset,
        progress: &ProgressTracker,
        slice: AssetSlice,
        cancel: &CancellationToken,
    ) -> Result<RemoteMediaHandle, CoachError> {
        let handle = self.upload(asset, progress, slice, cancel).await?;
        let name = handle.name.clone();

        match self.wait_ready(handle, &asset.file_name, progress, slice, cancel).await {
            Ok(ready) => Ok(ready),
            Err(err) => {
                self.release(&name).await;
                Err(err)
            }
        }
    }

    /// Push the asset's bytes; returns the initial (usually unprocessed) handle.
    pub async fn upload(
        &self,
        asset: &MediaAsset,
        progress: &ProgressTracker,
        slice: AssetSlice,
        cancel: &CancellationToken,
    ) -> Result<RemoteMediaHandle, CoachError> {
        if cancel.is_cancelled() {
            return Err(CoachError::Cancelled);
        }

        progress.report(
            Phase::Uploading,
            slice.upload_percent(),
            format!("Uploading {}", asset.file_name),
        );

        let media = self.media.clone();
        self.retry
            .run_cancellable("upload", cancel, || media.upload(asset))
            .await
    }

    /// Poll `handle` until it is ready, failed, or past the ceiling.
    pub async fn wait_ready(
        &self,
        mut handle: RemoteMediaHandle,
        display_name: &str,
        progress: &ProgressTracker,
        slice: AssetSlice,
        cancel: &CancellationToken,
    ) -> Result<RemoteMediaHandle, CoachError> {
        let started = Instant::now();

        loop {
            match handle.state {
                ProcessingState::Ready => {
                    info!(
                        "[Upload] {} ready after {:.1}s",
                        display_name,
                        started.elapsed().as_secs_f64()
                    );
                    progress.report(
                        Phase::Processing,
                        slice.end_percent(),
                        format!("{} ready", display_name),
                    );
                    return Ok(handle);
                }
                ProcessingState::Failed => {
                    let reason = handle
                        .error
                        .clone()
                        .unwrap_or_else(|| "remote processing failed".to_string());
                    warn!("[Upload] {} failed processing: {}", display_name, reason);
                    return Err(CoachError::ProcessingFailed {
                        name: display_name.to_string(),
                        reason,
                    });
                }
                ProcessingState::Pending | ProcessingState::Processing => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.ceiling {
                warn!(
                    "[Upload] {} still {:?} after {}s",
                    display_name,
                    handle.state,
                    self.ceiling.as_secs()
                );
                return Err(CoachError::Timeout(format!(
                    "{} was not processed within {}s",
                    display_name,
                    self.ceiling.as_secs()
                )));
            }

            progress.report(
                Phase::Processing,
                slice.processing_percent(elapsed, self.ceiling),
                format!(
                    "Processing {} ({}s/{}s)",
                    display_name,
                    elapsed.as_secs(),
                    self.ceiling.as_secs()
                ),
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(CoachError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let media = self.media.clone();
            let name = handle.name.clone();
            handle = self
                .retry
                .run_cancellable("status", cancel, || media.status(&name))
                .await?;
            debug!("[Upload] {} state {:?}", display_name, handle.state);
        }
    }

    /// Best-effort remote delete; failures are only logged.
    pub async fn release(&self, name: &str) {
        if let Err(e) = self.media.delete(name).await {
            warn!("[Upload] Failed to delete remote file {}: {}", name, e);
        } else {
            debug!("[Upload] Deleted remote file {}", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns the scripted states in order, repeating the last one.
    struct ScriptedMedia {
        states: Mutex<VecDeque<ProcessingState>>,
        status_calls: Mutex<u32>,
        deleted: Mutex<Vec<String>>,
    }

    impl ScriptedMedia {
        fn new(states: Vec<ProcessingState>) -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(states.into()),
                status_calls: Mutex::new(0),
                deleted: Mutex::new(Vec::new()),
            })
        }

        fn next_state(&self) -> ProcessingState {
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                states.pop_front().unwrap()
            } else {
                *states.front().unwrap()
            }
        }

        fn handle(state: ProcessingState) -> RemoteMediaHandle {
            RemoteMediaHandle {
                name: "files/clip".into(),
                uri: "https://files.test/clip".into(),
                mime_type: "video/mp4".into(),
                state,
                created_at: None,
                error: (state == ProcessingState::Failed).then(|| "codec not supported".to_string()),
            }
        }
    }

    #[async_trait]
    impl MediaService for ScriptedMedia {
        async fn upload(&self, _asset: &MediaAsset) -> Result<RemoteMediaHandle, CoachError> {
            Ok(Self::handle(self.next_state()))
        }

        async fn status(&self, _name: &str) -> Result<RemoteMediaHandle, CoachError> {
            *self.status_calls.lock().unwrap() += 1;
            Ok(Self::handle(self.next_state()))
        }

        async fn delete(&self, name: &str) -> Result<(), CoachError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn controller(media: Arc<ScriptedMedia>) -> UploadController {
        UploadController::new(
            media,
            RetryPolicy::default(),
            Duration::from_secs(1),
            Duration::from_secs(180),
        )
    }

    fn asset() -> MediaAsset {
        MediaAsset::from_bytes("clip.mp4", b"video bytes".to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn returns_ready_handle_after_processing() {
        let mut states = vec![ProcessingState::Processing; 5];
        states.push(ProcessingState::Ready);
        let media = ScriptedMedia::new(states);
        let progress = ProgressTracker::silent();

        let handle = controller(media.clone())
            .submit(&asset(), &progress, AssetSlice::for_asset(0, 1), &CancellationToken::new())
            .await
            .unwrap();

        assert!(handle.is_ready());
        assert_eq!(*media.status_calls.lock().unwrap(), 5);
        assert!(media.deleted.lock().unwrap().is_empty());
        assert_eq!(progress.current(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_processing_times_out() {
        let media = ScriptedMedia::new(vec![ProcessingState::Processing]);
        let start = Instant::now();

        let err = controller(media.clone())
            .submit(
                &asset(),
                &ProgressTracker::silent(),
                AssetSlice::for_asset(0, 1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "expected timeout, got {:?}", err);
        assert_eq!(start.elapsed(), Duration::from_secs(180));
        assert_eq!(*media.deleted.lock().unwrap(), vec!["files/clip".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_state_is_terminal() {
        let media = ScriptedMedia::new(vec![ProcessingState::Processing, ProcessingState::Failed]);

        let err = controller(media.clone())
            .submit(
                &asset(),
                &ProgressTracker::silent(),
                AssetSlice::for_asset(0, 1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            CoachError::ProcessingFailed { name, reason } => {
                assert_eq!(name, "clip.mp4");
                assert_eq!(reason, "codec not supported");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(*media.status_calls.lock().unwrap(), 1);
        assert_eq!(media.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_polling() {
        let media = ScriptedMedia::new(vec![ProcessingState::Processing]);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            canceller.cancel();
        });

        let err = controller(media.clone())
            .submit(&asset(), &ProgressTracker::silent(), AssetSlice::for_asset(0, 1), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, CoachError::Cancelled));
        assert_eq!(*media.status_calls.lock().unwrap(), 3);
        assert_eq!(media.deleted.lock().unwrap().len(), 1);
    }
}
