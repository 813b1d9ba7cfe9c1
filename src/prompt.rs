//! Prompt templating for the structuring stage and tolerant parsing of what
//! the model sends back.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::ml::OCR_ERROR_PREFIX;

pub const MIN_TAGS: usize = 3;
pub const MAX_TAGS: usize = 5;

/// Upper bound on OCR text pasted into a prompt. Small on-device models have
/// tight context windows.
const MAX_CONTEXT_CHARS: usize = 3000;
const MAX_TAG_CHARS: usize = 32;

/// Title, summary, source app and tags produced by the LLM stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredAnalysis {
    pub title: String,
    pub summary: String,
    pub source_app: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "details", alias = "description")]
    summary: Option<String>,
    #[serde(default, rename = "sourceApp", alias = "source_app", alias = "app")]
    source_app: Option<String>,
    #[serde(default)]
    tags: Option<Value>,
}

fn fenced_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)\s*```").expect("valid regex")
    })
}

/// Recognizers report failures inside the text itself, behind
/// [`OCR_ERROR_PREFIX`]. Such a message, or blank output, is not usable
/// content. Screen text that merely mentions an error is kept.
pub fn sanitize_ocr_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with(OCR_ERROR_PREFIX) {
        return None;
    }
    Some(trimmed.to_string())
}

fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

const RESPONSE_CONTRACT: &str = "Respond ONLY with a JSON object with these keys:\n\
\"title\": a short title (at most 8 words),\n\
\"summary\": one or two sentences describing what the screenshot shows,\n\
\"sourceApp\": the app or website the screenshot was taken in, or \"unknown\",\n\
\"tags\": an array of 3 to 5 short lowercase tags.\n\
Do not add any text outside the JSON object.";

/// Prompt for the OCR + caption route.
pub fn structuring_prompt(ocr_text: Option<&str>, caption: Option<&str>) -> String {
    let mut prompt = String::from(
        "You organize a user's phone screenshots. Analyze the screenshot described below.\n\n",
    );

    if let Some(caption) = caption.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str("Visual description:\n");
        prompt.push_str(clip(caption, MAX_CONTEXT_CHARS));
        prompt.push_str("\n\n");
    }

    if let Some(text) = ocr_text.map(str::trim).filter(|t| !t.is_empty()) {
        prompt.push_str("Text found in the screenshot:\n");
        prompt.push_str(clip(text, MAX_CONTEXT_CHARS));
        prompt.push_str("\n\n");
    }

    prompt.push_str(RESPONSE_CONTRACT);
    prompt
}

/// Prompt sent together with the image itself.
pub fn multimodal_prompt() -> String {
    format!("You organize a user's phone screenshots. Look at the attached screenshot.\n\n{RESPONSE_CONTRACT}")
}

/// Raw text kept when no LLM is available: caption first, then OCR text.
pub fn fallback_content(ocr_text: Option<&str>, caption: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [caption, ocr_text]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Pulls the JSON object out of a reply that may be fenced in markdown or
/// wrapped in prose.
pub fn extract_json_object(reply: &str) -> Option<&str> {
    let trimmed = reply.trim();
    let body = fenced_block_pattern()
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if start < end {
        Some(&body[start..=end])
    } else {
        None
    }
}

fn normalize_tags(value: Option<Value>) -> Vec<String> {
    let candidates: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(joined)) => joined.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };

    let mut tags: Vec<String> = Vec::new();
    for candidate in candidates {
        let cleaned = candidate
            .trim()
            .trim_start_matches('#')
            .trim()
            .to_lowercase();
        if cleaned.is_empty() || cleaned.chars().count() > MAX_TAG_CHARS {
            continue;
        }
        if tags.iter().any(|existing| existing == &cleaned) {
            continue;
        }
        tags.push(cleaned);
    }
    tags
}

fn clean_field(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses a model reply into a [`StructuredAnalysis`].
///
/// Anything short of a complete result is an error: the caller must leave
/// the record untouched rather than store half an analysis.
pub fn parse_structured(reply: &str) -> Result<StructuredAnalysis> {
    let json = extract_json_object(reply)
        .ok_or_else(|| Error::MalformedOutput("reply contains no JSON object".to_string()))?;

    let raw: RawAnalysis = serde_json::from_str(json)
        .map_err(|error| Error::MalformedOutput(format!("invalid JSON: {error}")))?;

    let title = clean_field(raw.title)
        .ok_or_else(|| Error::MalformedOutput("missing title".to_string()))?;

    let mut tags = normalize_tags(raw.tags);
    if tags.len() < MIN_TAGS {
        return Err(Error::MalformedOutput(format!(
            "expected at least {MIN_TAGS} tags, got {}",
            tags.len()
        )));
    }
    tags.truncate(MAX_TAGS);

    let source_app = clean_field(raw.source_app)
        .filter(|app| !matches!(app.to_lowercase().as_str(), "unknown" | "n/a" | "none" | "null"));

    Ok(StructuredAnalysis {
        title,
        summary: clean_field(raw.summary).unwrap_or_default(),
        source_app,
        tags,
    })
}
