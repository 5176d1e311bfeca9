//! Parsing of semi-structured model output.
//!
//! Nothing here fails: malformed output degrades to "use the whole response
//! as the summary".

const TITLE_MARKER: &str = "TITLE:";
const SUMMARY_MARKER: &str = "SUMMARY:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSummary {
    pub title: Option<String>,
    pub summary: String,
}

/// Case-insensitive prefix match; returns the remainder of the line.
fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let head = line.get(..marker.len())?;
    head.eq_ignore_ascii_case(marker).then(|| &line[marker.len()..])
}

/// Split a `TITLE:` / `SUMMARY:` answer into its parts.
///
/// Everything after the summary marker line is the summary body. Without a
/// summary marker the raw response is the summary and the title is `None`.
pub fn parse_title_summary(raw: &str) -> ParsedSummary {
    let lines: Vec<&str> = raw.lines().collect();
    let mut title = None;

    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        if let Some(rest) = strip_marker(line, TITLE_MARKER) {
            let rest = rest.trim();
            title = (!rest.is_empty()).then(|| rest.to_string());
        }
        if let Some(rest) = strip_marker(line, SUMMARY_MARKER) {
            let mut body = String::new();
            let inline = rest.trim();
            if !inline.is_empty() {
                body.push_str(inline);
            }
            let tail = lines[i + 1..].join("\n");
            let tail = tail.trim();
            if !tail.is_empty() {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(tail);
            }
            if body.is_empty() {
                break;
            }
            return ParsedSummary {
                title,
                summary: body,
            };
        }
    }

    ParsedSummary {
        title: None,
        summary: raw.to_string(),
    }
}

/// Remove a code fence the model wrapped around its answer.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("```") {
        // Drop the info string (e.g. ```text) on the opening line.
        let inner = match inner.find('\n') {
            Some(nl) => &inner[nl + 1..],
            None => inner,
        };
        if let Some(end) = inner.rfind("```") {
            return inner[..end].trim().to_string();
        }
    }
    trimmed.to_string()
}
