//! Prompt construction.
//!
//! Depth (detail level) and tone (persona) are independent: the persona line
//! only changes voice and explicitly forbids extra depth. Every prompt ends
//! with the same plain-text formatting rules so the output renders the same
//! regardless of which model produced it.

use crate::provider::ChatMessage;
use crate::summary::{DetailLevel, GenerationRequest, Language, SourceKind};

/// Characters of source text sent to the provider.
pub const MAX_PROMPT_CHARS: usize = 50_000;

const FORMAT_RULES: &str = "Formatting rules (follow exactly):
1) Produce 3 to 8 main points as a numbered list (1., 2., 3., ...)
2) Start each item with a short topic (3-8 words), then a colon, then one sentence of explanation
3) When useful, add 1-3 sub-items starting with \"- \" (hyphen and space), each one short
4) Do not use markdown emphasis such as **asterisks**, headings or code blocks
5) Do not wrap the answer in a code block; return plain structured text only";

const SYSTEM_PROMPT: &str =
    "You are a summarisation assistant that returns a numbered list of short topics with sub-items when needed.";

/// Cut `text` to at most `max_chars` characters without splitting a char.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Heading that marks the mandatory expansion section in deep summaries.
pub fn expansion_heading(language: Language) -> &'static str {
    match language {
        Language::Pt => "ANÁLISE APROFUNDADA",
        Language::En => "IN-DEPTH ANALYSIS",
    }
}

fn detail_instruction(level: DetailLevel, language: Language) -> String {
    match level {
        DetailLevel::Short => "Write a very brief summary with at most 3 main bullet points".to_string(),
        DetailLevel::Medium => "Write a concise summary covering the main points (5-7 points)".to_string(),
        DetailLevel::Long => {
            "Write a detailed and comprehensive summary, grouping related points into subsections".to_string()
        }
        DetailLevel::Deep => format!(
            "Write an in-depth analytical summary organised in these sections, in this order: \
             context, methodology, results, discussion, implications, conclusion, keywords. \
             After the keywords, add a final section headed \"{}\" that expands on the most \
             important findings and their limitations",
            expansion_heading(language)
        ),
    }
}

fn persona_instruction(persona: &str) -> String {
    format!(
        "Adopt this tone and voice: {persona}. The tone changes only the wording; \
         do not add points, sections or depth beyond what the length instruction above allows."
    )
}

/// User prompt for a web page summary.
pub fn summary_prompt(request: &GenerationRequest) -> String {
    let mut prompt = format!(
        "{} of the following text, written in {}.",
        detail_instruction(request.detail_level(), request.language()),
        request.language().prompt_name(),
    );
    if let Some(persona) = request.persona() {
        prompt.push_str("\n\n");
        prompt.push_str(&persona_instruction(persona));
    }
    prompt.push_str("\n\n");
    prompt.push_str(FORMAT_RULES);
    prompt.push_str("\n\nText to summarise:\n");
    prompt.push_str(truncate_chars(request.raw_text(), MAX_PROMPT_CHARS));
    prompt
}

/// User prompt asking for a title and a summary in one answer.
pub fn pdf_prompt(request: &GenerationRequest) -> String {
    let mut prompt = format!(
        "You will receive the text content of a PDF file. Produce, in {}:
- TITLE: a short title (at most 10 words), without quotes or markdown
- SUMMARY: a structured summary following the rules below

{}.",
        request.language().prompt_name(),
        detail_instruction(request.detail_level(), request.language()),
    );
    if let Some(persona) = request.persona() {
        prompt.push_str("\n\n");
        prompt.push_str(&persona_instruction(persona));
    }
    prompt.push_str("\n\n");
    prompt.push_str(FORMAT_RULES);
    prompt.push_str(
        "\n\nAnswer strictly in this format:
TITLE: <short title>
SUMMARY:
1. <short topic>: <sentence>
- <optional sub-item>
2. ...

Content (partial):\n",
    );
    prompt.push_str(truncate_chars(request.raw_text(), MAX_PROMPT_CHARS));
    prompt
}

/// Messages for the first generation call of a request.
pub fn build_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    match request.mode() {
        SourceKind::Web => vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(summary_prompt(request)),
        ],
        SourceKind::Pdf => vec![ChatMessage::user(pdf_prompt(request))],
    }
}

/// Deep summaries must end with the expansion section.
pub fn needs_expansion(level: DetailLevel, language: Language, response: &str) -> bool {
    if level != DetailLevel::Deep {
        return false;
    }
    let heading = expansion_heading(language).to_lowercase();
    !response.to_lowercase().contains(&heading)
}

/// Follow-up asking only for the missing expansion section. Replays the
/// first exchange as it was sent.
pub fn build_expansion_messages(request: &GenerationRequest, summary: &str) -> Vec<ChatMessage> {
    let heading = expansion_heading(request.language());
    let mut ask = format!(
        "The summary above is missing its final section. Write only that section, starting \
         with the line \"{heading}\", in {}. Expand on the most important findings and their \
         limitations in 3 to 5 numbered points. Do not repeat the earlier sections.",
        request.language().prompt_name(),
    );
    if let Some(persona) = request.persona() {
        ask.push_str("\n\n");
        ask.push_str(&persona_instruction(persona));
    }
    ask.push_str("\n\n");
    ask.push_str(FORMAT_RULES);
    let mut messages = build_messages(request);
    messages.push(ChatMessage::assistant(summary));
    messages.push(ChatMessage::user(ask));
    messages
}
