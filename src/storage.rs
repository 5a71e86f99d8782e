// src/storage.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::cache::sha256_hex;
use crate::coach::analysis::AnalysisContext;
use crate::coach::extraction::StructuredReport;
use crate::error::CoachError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Image,
    Unknown,
}

/// A local video or image supplied by the caller. The pipeline only reads it.
#[derive(Clone)]
pub struct MediaAsset {
    pub file_name: String,
    pub mime_type: String,
    pub kind: MediaKind,
    pub bytes: Vec<u8>,
    /// SHA-256 of `bytes`, hex encoded
    pub content_hash: String,
}

impl std::fmt::Debug for MediaAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAsset")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("kind", &self.kind)
            .field("size", &self.bytes.len())
            .field("content_hash", &self.content_hash)
            .finish()
    }
}

impl MediaAsset {
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let (mime_type, kind) = detect_media_type(&file_name, &bytes);
        let content_hash = sha256_hex(&bytes);

        Self {
            file_name,
            mime_type,
            kind,
            bytes,
            content_hash,
        }
    }

    /// Read a media file from disk, enforcing the configured size ceiling.
    pub async fn load(path: &Path, max_bytes: u64) -> Result<Self, CoachError> {
        let metadata = fs::metadata(path).await.map_err(|e| {
            CoachError::Validation(format!("Cannot read {}: {}", path.display(), e))
        })?;

        if metadata.len() == 0 {
            return Err(CoachError::Validation(format!(
                "{} is empty",
                path.display()
            )));
        }
        if metadata.len() > max_bytes {
            return Err(CoachError::Validation(format!(
                "{} is too large ({:.1}MB). Maximum size is {:.0}MB.",
                path.display(),
                metadata.len() as f64 / (1024.0 * 1024.0),
                max_bytes as f64 / (1024.0 * 1024.0)
            )));
        }

        let bytes = fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();

        Ok(Self::from_bytes(file_name, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn size_mb(&self) -> f64 {
        self.size() as f64 / (1024.0 * 1024.0)
    }
}

/// Sniff the MIME type from magic bytes, falling back to the file extension.
fn detect_media_type(file_name: &str, bytes: &[u8]) -> (String, MediaKind) {
    if let Some(kind) = infer::get(bytes) {
        let media_kind = match kind.matcher_type() {
            infer::MatcherType::Video => MediaKind::Video,
            infer::MatcherType::Image => MediaKind::Image,
            _ => MediaKind::Unknown,
        };
        if media_kind != MediaKind::Unknown {
            return (kind.mime_type().to_string(), media_kind);
        }
    }

    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let (mime, kind) = match extension.as_str() {
        "mp4" | "m4v" => ("video/mp4", MediaKind::Video),
        "mov" => ("video/quicktime", MediaKind::Video),
        "avi" => ("video/x-msvideo", MediaKind::Video),
        "webm" => ("video/webm", MediaKind::Video),
        "mkv" => ("video/x-matroska", MediaKind::Video),
        "mpeg" | "mpg" => ("video/mpeg", MediaKind::Video),
        "jpg" | "jpeg" => ("image/jpeg", MediaKind::Image),
        "png" => ("image/png", MediaKind::Image),
        "webp" => ("image/webp", MediaKind::Image),
        "heic" => ("image/heic", MediaKind::Image),
        _ => ("application/octet-stream", MediaKind::Unknown),
    };
    (mime.to_string(), kind)
}

/// Stage 1 output: the free-text (Markdown) coaching report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub markdown: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
    pub media_count: usize,
}

/// A completed analysis run as persisted under the results directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: String,
    pub query: String,
    pub context: AnalysisContext,
    pub media: Vec<String>,
    pub report: AnalysisResult,
    pub structured: Option<StructuredReport>,
    pub elapsed_secs: f64,
}

impl AnalysisRecord {
    pub fn new(
        fingerprint: String,
        query: String,
        context: AnalysisContext,
        media: Vec<String>,
        report: AnalysisResult,
        structured: Option<StructuredReport>,
        elapsed_secs: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            fingerprint,
            query,
            context,
            media,
            report,
            structured,
            elapsed_secs,
        }
    }
}

/// Write the record as JSON plus the Markdown report next to it.
pub async fn save_record(results_dir: &Path, record: &AnalysisRecord) -> Result<PathBuf> {
    fs::create_dir_all(results_dir)
        .await
        .with_context(|| format!("Failed to create {}", results_dir.display()))?;

    let record_file = results_dir.join(format!("{}.json", record.id));
    let report_file = results_dir.join(format!("{}.md", record.id));

    let content = serde_json::to_string_pretty(record)?;
    fs::write(&record_file, content).await?;
    fs::write(&report_file, &record.report.markdown).await?;

    Ok(record_file)
}

pub async fn get_record(results_dir: &Path, id: &str) -> Result<Option<AnalysisRecord>> {
    let record_file = results_dir.join(format!("{}.json", id));

    if !record_file.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&record_file).await?;
    let record: AnalysisRecord = serde_json::from_str(&content)
        .with_context(|| format!("Corrupt record {}", record_file.display()))?;

    Ok(Some(record))
}

pub async fn list_records(results_dir: &Path) -> Result<Vec<AnalysisRecord>> {
    let mut records = Vec::new();
    if !results_dir.exists() {
        return Ok(records);
    }

    let mut entries = fs::read_dir(results_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("json") {
            let content = fs::read_to_string(entry.path()).await?;
            if let Ok(record) = serde_json::from_str::<AnalysisRecord>(&content) {
                records.push(record);
            }
        }
    }

    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn report(text: &str) -> AnalysisResult {
        AnalysisResult {
            markdown: text.to_string(),
            model: "gemini-2.5-flash".to_string(),
            generated_at: Utc::now(),
            media_count: 1,
        }
    }

    #[test]
    fn sniffs_magic_bytes_before_extension() {
        let asset = MediaAsset::from_bytes("clip.mp4", PNG_MAGIC.to_vec());
        assert_eq!(asset.kind, MediaKind::Image);
        assert_eq!(asset.mime_type, "image/png");
    }

    #[test]
    fn falls_back_to_extension() {
        let asset = MediaAsset::from_bytes("Takedown Drill.MOV", b"not really a movie".to_vec());
        assert_eq!(asset.kind, MediaKind::Video);
        assert_eq!(asset.mime_type, "video/quicktime");

        let asset = MediaAsset::from_bytes("notes.txt", b"hello".to_vec());
        assert_eq!(asset.kind, MediaKind::Unknown);
    }

    #[tokio::test]
    async fn load_enforces_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mp4");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let err = MediaAsset::load(&path, 1024).await.unwrap_err();
        assert!(err.is_validation());

        let asset = MediaAsset::load(&path, 4096).await.unwrap();
        assert_eq!(asset.file_name, "big.mp4");
        assert_eq!(asset.size(), 2048);
    }

    #[tokio::test]
    async fn load_rejects_empty_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();

        assert!(MediaAsset::load(&empty, 1024).await.unwrap_err().is_validation());
        assert!(MediaAsset::load(&dir.path().join("missing.mp4"), 1024)
            .await
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test]
    async fn records_round_trip_newest_first() {
        let dir = tempfile::tempdir().unwrap();

        let mut older = AnalysisRecord::new(
            "fp-1".into(),
            "Check my stance".into(),
            AnalysisContext::default(),
            vec!["a.mp4".into()],
            report("## Older"),
            None,
            12.0,
        );
        older.timestamp = Utc::now() - chrono::Duration::hours(1);
        let newer = AnalysisRecord::new(
            "fp-2".into(),
            "Check my shot".into(),
            AnalysisContext::default(),
            vec!["b.mp4".into()],
            report("## Newer"),
            None,
            8.5,
        );

        save_record(dir.path(), &older).await.unwrap();
        let saved = save_record(dir.path(), &newer).await.unwrap();
        assert!(saved.exists());
        assert!(dir.path().join(format!("{}.md", newer.id)).exists());

        let records = list_records(dir.path()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, newer.id);

        let loaded = get_record(dir.path(), &older.id).await.unwrap().unwrap();
        assert_eq!(loaded.report.markdown, "## Older");
        assert!(get_record(dir.path(), "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = list_records(&dir.path().join("absent")).await.unwrap();
        assert!(records.is_empty());
    }
}
