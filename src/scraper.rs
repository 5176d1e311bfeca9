//! Page text extraction.
//!
//! Fetches a page with reqwest and pulls readable text out of it with
//! scraper, preferring the main content container when the page has one.

use crate::summarizer::SummaryRequest;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = concat!("briefly/", env!("CARGO_PKG_VERSION"));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocks shorter than this are navigation or boilerplate.
const MIN_BLOCK_CHARS: usize = 20;

const MAIN_SELECTORS: [&str; 5] = ["article", "main", "[role='main']", ".content", "#content"];
const BLOCK_SELECTOR: &str = "p, h1, h2, h3, h4, h5, h6, li, blockquote";

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("failed to fetch URL: {0}")]
    FetchError(#[from] reqwest::Error),
    #[error("page returned HTTP {0}")]
    Status(u16),
    #[error("no content found at URL")]
    NoContent,
}

#[derive(Debug, Clone)]
pub struct WebContent {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
}

impl WebContent {
    pub fn into_request(self) -> SummaryRequest {
        SummaryRequest {
            page_title: self.title,
            url: Some(self.url),
            ..SummaryRequest::web(self.text)
        }
    }
}

fn create_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

pub async fn fetch_content(url: &str) -> Result<WebContent, ScraperError> {
    let client = create_client()?;
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ScraperError::Status(status.as_u16()));
    }
    let html = response.text().await?;
    let content = extract(url, &html)?;
    debug!(url, chars = content.text.chars().count(), "page extracted");
    Ok(content)
}

/// Extract title and text from an already fetched document.
pub fn extract(url: &str, html: &str) -> Result<WebContent, ScraperError> {
    let document = Html::parse_document(html);
    let text = extract_text(&document);
    if text.trim().is_empty() {
        return Err(ScraperError::NoContent);
    }
    Ok(WebContent {
        url: url.to_string(),
        title: extract_title(&document),
        text,
    })
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let element = document.select(&selector).next()?;
    let text = collapse(&element.text().collect::<Vec<_>>().join(" "));
    (!text.is_empty()).then_some(text)
}

/// `<title>`, then the first `<h1>`.
fn extract_title(document: &Html) -> Option<String> {
    first_text(document, "title").or_else(|| first_text(document, "h1"))
}

fn extract_text(document: &Html) -> String {
    let Ok(blocks) = Selector::parse(BLOCK_SELECTOR) else {
        return String::new();
    };

    for selector in MAIN_SELECTORS.iter().filter_map(|s| Selector::parse(s).ok()) {
        if let Some(element) = document.select(&selector).next() {
            let text = collect_blocks(element.select(&blocks));
            if !text.is_empty() {
                return text;
            }
        }
    }

    collect_blocks(document.select(&blocks))
}

fn collect_blocks<'a>(elements: impl Iterator<Item = ElementRef<'a>>) -> String {
    elements
        .map(|el| collapse(&el.text().collect::<Vec<_>>().join(" ")))
        .filter(|text| text.chars().count() > MIN_BLOCK_CHARS)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
