//! # Briefly
//!
//! Resilient summarisation of web pages and PDF documents using hosted LLMs.
//!
//! ## Features
//!
//! - **Fallback chain**: ordered models on OpenRouter, then one Gemini model, with a shared cooldown on rate limits
//! - **Daily quota**: per-device counter with premium key unlock, persisted in two independent stores
//! - **Result cache**: 24h, 100-entry sled tree keyed by request fingerprint
//! - **History**: the last 50 summaries with source excerpts

pub mod cache;
pub mod chain;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod history;
pub mod license;
pub mod parser;
pub mod pdf;
pub mod prompt;
pub mod provider;
pub mod quota;
pub mod scraper;
pub mod storage;
pub mod summarizer;
pub mod summary;

pub use config::{Config, SettingsPatch, UserSettings};
pub use storage::Storage;
pub use summarizer::{SummarizeError, Summarizer, SummaryRequest, SummaryResponse};
pub use summary::{DetailLevel, Language, SourceKind};
