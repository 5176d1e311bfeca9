//! Text extraction from PDF files.

use crate::summarizer::SummaryRequest;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Only the first pages are sent for summarisation.
pub const MAX_PAGES: usize = 10;

#[derive(Error, Debug)]
pub enum PdfError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to extract text: {0}")]
    Extract(String),
    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Read a PDF and build a request from its text. Runs the parser off the
/// async runtime.
pub async fn load_request(path: &Path) -> Result<SummaryRequest, PdfError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| PdfError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let pages = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem_by_pages(&bytes))
        .await?
        .map_err(|e| PdfError::Extract(e.to_string()))?;
    let text = join_pages(&pages, MAX_PAGES);
    debug!(path = %path.display(), chars = text.chars().count(), "pdf extracted");

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(SummaryRequest::pdf(text, file_name))
}

fn join_pages(pages: &[String], max_pages: usize) -> String {
    pages
        .iter()
        .take(max_pages)
        .map(|page| normalize(page))
        .filter(|page| !page.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse runs of whitespace inside lines and drop blank lines.
fn normalize(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_blank_lines() {
        assert_eq!(normalize("a   b\n\n  \n c\t d "), "a b\nc d");
    }

    #[test]
    fn only_first_pages_are_kept() {
        let pages: Vec<String> = (1..=12).map(|i| format!("page {i}")).collect();
        let text = join_pages(&pages, MAX_PAGES);
        assert!(text.ends_with("page 10"));
        assert!(!text.contains("page 11"));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = load_request(Path::new("/definitely/not/here.pdf")).await.unwrap_err();
        assert!(matches!(err, PdfError::Read { .. }));
    }
}
