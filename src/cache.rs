// src/cache.rs
//! In-process result cache keyed by a content fingerprint.
//!
//! The cache lives for the process lifetime and is unbounded. A hit returns
//! the stored report without any upload or generation call. Failures are
//! never stored.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::coach::extraction::StructuredReport;
use crate::storage::{AnalysisResult, MediaAsset};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Deterministic key over media content, query text and context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Combine the content hashes of `assets` (in order) with the verbatim
    /// query and rendered context. File names and paths play no part.
    pub fn compute(assets: &[MediaAsset], query: &str, context: &str) -> Self {
        let mut hasher = Sha256::new();
        for asset in assets {
            hasher.update(asset.content_hash.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0xffu8]);
        hasher.update(query.as_bytes());
        hasher.update([0xffu8]);
        hasher.update(context.as_bytes());

        let digest = hasher.finalize();
        Self(digest.iter().map(|byte| format!("{:02x}", byte)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub report: AnalysisResult,
    pub structured: Option<StructuredReport>,
}

/// Mutex-guarded map plus hit/miss counters. Share it through an `Arc`.
#[derive(Debug, Default)]
pub struct FingerprintCache {
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes are single inserts, so a poisoned map is still consistent.
    fn entries(&self) -> MutexGuard<'_, HashMap<Fingerprint, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("[Cache] Lock was poisoned, recovering entries");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let found = self.entries().get(fingerprint).cloned();

        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("[Cache] hit for {}", fingerprint.short());
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("[Cache] miss for {}", fingerprint.short());
                None
            }
        }
    }

    /// Insert or replace the entry for `fingerprint`. Last writer wins.
    pub fn put(&self, fingerprint: Fingerprint, entry: CacheEntry) {
        self.entries().insert(fingerprint, entry);
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries().contains_key(fingerprint)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
