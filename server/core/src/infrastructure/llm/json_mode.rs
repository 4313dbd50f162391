// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! JSON-mode response handling.
//!
//! Remote models asked for `json_object` output still wrap their JSON
//! in prose or fences often enough that extraction is a ladder:
//! whole-response parse, fenced blocks, a brace-aware scan that feeds
//! every `{` offset to an incremental decoder (preferring non-empty
//! objects), and finally a round of mechanical repairs. Strict mode
//! refuses responses whose only valid parse is `{}`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("static regex")
});
static SINGLE_QUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^']*)'").expect("static regex"));
static UNQUOTED_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*:").expect("static regex"));
static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("static regex"));
static JSON_LIKE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("static regex"));

/// Instruction block appended to prompts when the grant asks for
/// `json_object` output.
pub const JSON_ENFORCE_PROMPT: &str = "\n\nCRITICAL REQUIREMENT: You MUST respond with ONLY valid \
JSON. Do not include any explanatory text, markdown formatting, or code blocks. Your entire \
response must be a single valid JSON object.\n\nExample of CORRECT format:\n{\"key\": \"value\", \
\"nested\": {\"field\": 123}}\n\nRemember: Output ONLY the raw JSON object, nothing else.";

pub fn enforce_json_prompt(prompt: &str) -> String {
    format!("{prompt}{JSON_ENFORCE_PROMPT}")
}

fn as_object(value: Value) -> Option<Value> {
    value.is_object().then_some(value)
}

/// Parse the first JSON value starting at `offset`, ignoring whatever
/// trails it.
fn parse_prefix(text: &str, offset: usize) -> Option<Value> {
    let mut stream = serde_json::Deserializer::from_str(&text[offset..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Some(value),
        _ => None,
    }
}

fn repair(candidate: &str) -> String {
    let fixed = SINGLE_QUOTE_RE.replace_all(candidate, "\"$1\"");
    let fixed = UNQUOTED_KEY_RE.replace_all(&fixed, "\"$1\":");
    TRAILING_COMMA_RE.replace_all(&fixed, "$1").into_owned()
}

/// Extract a JSON object from a model response.
///
/// Under `strict`, an empty object is rejected; otherwise an empty
/// object is returned only when nothing better parses.
pub fn extract_json(response: &str, strict: bool) -> Result<Value, String> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err("response is empty".to_string());
    }

    let mut empty_fallback: Option<Value> = None;
    let mut keep = |value: Value, fallback: &mut Option<Value>| -> Option<Value> {
        if value.as_object().is_some_and(|o| !o.is_empty()) {
            Some(value)
        } else {
            fallback.get_or_insert(value);
            None
        }
    };

    // Whole response.
    if let Some(obj) = serde_json::from_str::<Value>(trimmed).ok().and_then(as_object) {
        if let Some(found) = keep(obj, &mut empty_fallback) {
            return Ok(found);
        }
    }

    // Fenced blocks.
    for captures in FENCE_RE.captures_iter(trimmed) {
        if let Some(obj) = serde_json::from_str::<Value>(&captures[1])
            .ok()
            .and_then(as_object)
        {
            if let Some(found) = keep(obj, &mut empty_fallback) {
                return Ok(found);
            }
        }
    }

    // Every '{' offset through the incremental decoder. The decoder is
    // string- and escape-aware, so braces inside strings cannot confuse
    // the scan.
    for (offset, _) in trimmed.match_indices('{') {
        if let Some(obj) = parse_prefix(trimmed, offset).and_then(as_object) {
            if let Some(found) = keep(obj, &mut empty_fallback) {
                return Ok(found);
            }
        }
    }

    // Mechanical repairs on the first json-like region.
    if let Some(found) = JSON_LIKE_RE.find(trimmed) {
        if let Some(obj) = serde_json::from_str::<Value>(&repair(found.as_str()))
            .ok()
            .and_then(as_object)
        {
            if let Some(found) = keep(obj, &mut empty_fallback) {
                return Ok(found);
            }
        }
    }

    match empty_fallback {
        Some(_) if strict => Err("response parses only to an empty JSON object".to_string()),
        Some(empty) => Ok(empty),
        None => Err(format!(
            "no JSON object found in response ({} chars)",
            response.len()
        )),
    }
}
