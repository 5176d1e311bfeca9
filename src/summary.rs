//! Request and result types that flow through the summarisation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Web,
    Pdf,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Pdf => "pdf",
        }
    }
}

/// Summary depth. Selects both the prompt wording and the output token bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Short,
    #[default]
    Medium,
    Long,
    Deep,
}

impl DetailLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
            Self::Deep => "deep",
        }
    }

    /// Upper bound on generated tokens for this depth.
    pub fn max_output_tokens(self) -> u32 {
        match self {
            Self::Short => 600,
            Self::Medium => 900,
            Self::Long => 1400,
            Self::Deep => 2200,
        }
    }
}

impl std::str::FromStr for DetailLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "short" => Ok(Self::Short),
            "medium" => Ok(Self::Medium),
            "long" => Ok(Self::Long),
            "deep" => Ok(Self::Deep),
            other => Err(format!("unknown detail level: {other}")),
        }
    }
}

/// Output language for summaries and user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Pt,
    En,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pt => "pt",
            Self::En => "en",
        }
    }

    /// Language name as it should appear inside an English prompt.
    pub fn prompt_name(self) -> &'static str {
        match self {
            Self::Pt => "Brazilian Portuguese",
            Self::En => "English",
        }
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pt" | "pt-br" | "portuguese" => Ok(Self::Pt),
            "en" | "english" => Ok(Self::En),
            other => Err(format!("unknown language: {other}")),
        }
    }
}

/// Everything that influences what the model is asked to produce.
///
/// Built once per request and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    raw_text: String,
    mode: SourceKind,
    detail_level: DetailLevel,
    language: Language,
    persona: Option<String>,
}

impl GenerationRequest {
    pub fn new(
        raw_text: impl Into<String>,
        mode: SourceKind,
        detail_level: DetailLevel,
        language: Language,
        persona: Option<String>,
    ) -> Self {
        let persona = persona
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        Self {
            raw_text: raw_text.into(),
            mode,
            detail_level,
            language,
            persona,
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn mode(&self) -> SourceKind {
        self.mode
    }

    pub fn detail_level(&self) -> DetailLevel {
        self.detail_level
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn persona(&self) -> Option<&str> {
        self.persona.as_deref()
    }
}

/// Output of one successful run of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub summary_text: String,
    pub inferred_title: Option<String>,
    pub model_identifier: String,
    pub completed_at: DateTime<Utc>,
}
