//! Summary history, newest first, capped at [`HISTORY_LIMIT`] items.

use crate::clock::Clock;
use crate::storage::{Storage, StorageError, KEY_HISTORY};
use crate::summary::SourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const HISTORY_LIMIT: usize = 50;
const EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    pub title: String,
    pub url: String,
    /// First characters of the source text
    pub excerpt: String,
    pub summary: String,
    pub model: String,
    pub source: SourceKind,
    pub timestamp: DateTime<Utc>,
    pub word_count: usize,
}

/// What the pipeline hands over after a successful summary.
#[derive(Debug, Clone)]
pub struct HistoryRecord<'a> {
    pub original_text: &'a str,
    pub summary: &'a str,
    pub title: &'a str,
    pub url: Option<&'a str>,
    pub model: &'a str,
    pub source: SourceKind,
}

pub struct HistoryRecorder {
    storage: Storage,
    clock: Arc<dyn Clock>,
    limit: usize,
}

impl HistoryRecorder {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            limit: HISTORY_LIMIT,
        }
    }

    pub fn record(&self, record: HistoryRecord<'_>) -> Result<HistoryItem, StorageError> {
        let now = self.clock.now();
        let url = match (record.url, record.source) {
            (Some(url), _) => url.to_string(),
            (None, SourceKind::Pdf) => "imported-file".to_string(),
            (None, SourceKind::Web) => "unknown-url".to_string(),
        };
        let item = HistoryItem {
            id: generate_id(now),
            title: record.title.to_string(),
            url,
            excerpt: excerpt(record.original_text),
            summary: record.summary.to_string(),
            model: record.model.to_string(),
            source: record.source,
            timestamp: now,
            word_count: record.original_text.split_whitespace().count(),
        };

        let mut items = self.list()?;
        items.insert(0, item.clone());
        items.truncate(self.limit);
        self.storage.put_json(KEY_HISTORY, &items)?;
        Ok(item)
    }

    /// All items, newest first.
    pub fn list(&self) -> Result<Vec<HistoryItem>, StorageError> {
        Ok(self.storage.get_json(KEY_HISTORY)?.unwrap_or_default())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.storage.remove(KEY_HISTORY)?;
        Ok(())
    }
}

fn excerpt(text: &str) -> String {
    let mut chars = text.char_indices();
    match chars.nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn generate_id(now: DateTime<Utc>) -> String {
    // Disambiguates items recorded within the same millisecond.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("h-{:x}-{:04x}", now.timestamp_millis(), count & 0xffff)
}
