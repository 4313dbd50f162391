// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Agent output parsing.
//!
//! Agents talk back over stdout: free-form logs, then exactly one JSON
//! result line, then the completion sentinel. [`LogScanner`] is the
//! line-by-line state machine both runtimes feed — it bounds memory at
//! the stdout cap, spots the sentinel, and allows a short grace window
//! of lines after it before closing the stream.

use serde_json::Value;

use super::AgentStatus;

/// Token an agent prints on its own line to signal completion.
pub const SENTINEL: &str = "__AGENT_DONE__";

/// Lines still read after the sentinel, to catch a result line flushed
/// late.
const POST_SENTINEL_GRACE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// Bounded, sentinel-aware line accumulator.
pub struct LogScanner {
    max_bytes: usize,
    captured_bytes: usize,
    lines: Vec<String>,
    sentinel_seen: bool,
    post_sentinel_lines: usize,
    truncated: bool,
}

impl LogScanner {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            captured_bytes: 0,
            lines: Vec::new(),
            sentinel_seen: false,
            post_sentinel_lines: 0,
            truncated: false,
        }
    }

    /// Feed one line; the return value tells the reader whether to keep
    /// streaming.
    pub fn push_line(&mut self, line: &str) -> ScanControl {
        if self.captured_bytes + line.len() > self.max_bytes {
            self.truncated = true;
            return ScanControl::Stop;
        }
        self.captured_bytes += line.len() + 1;
        self.lines.push(line.to_string());

        if line.contains(SENTINEL) {
            self.sentinel_seen = true;
            return ScanControl::Stop;
        }
        if self.sentinel_seen {
            self.post_sentinel_lines += 1;
            if self.post_sentinel_lines >= POST_SENTINEL_GRACE {
                return ScanControl::Stop;
            }
        }
        ScanControl::Continue
    }

    pub fn sentinel_seen(&self) -> bool {
        self.sentinel_seen
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Replace a known API key in captured output with
/// `<first four chars>[REDACTED]`.
pub fn redact(text: &str, api_key: Option<&str>) -> String {
    match api_key {
        Some(key) if key.len() > 8 => {
            text.replace(key, &format!("{}[REDACTED]", &key[..4]))
        }
        _ => text.to_string(),
    }
}

fn looks_like_result(obj: &Value) -> bool {
    ["status", "summary", "result", "artifacts"]
        .iter()
        .any(|field| obj.get(field).is_some())
}

fn result_score(obj: &Value) -> usize {
    ["status", "summary", "result", "artifacts"]
        .iter()
        .filter(|field| obj.get(*field).is_some())
        .count()
}

/// Scan captured lines bottom-up for the agent's JSON result line,
/// preferring the candidate carrying the most expected fields.
pub fn parse_agent_result(lines: &[String]) -> Option<Value> {
    let mut best: Option<Value> = None;

    for line in lines.iter().rev() {
        let line = line.trim();
        let (Some(start), Some(end)) = (line.find('{'), line.rfind('}')) else {
            continue;
        };
        if end < start {
            continue;
        }

        let Ok(parsed) = serde_json::from_str::<Value>(&line[start..=end]) else {
            continue;
        };
        if !parsed.is_object() || !looks_like_result(&parsed) {
            continue;
        }

        match &best {
            Some(current) if result_score(current) >= result_score(&parsed) => {}
            _ => best = Some(parsed),
        }
    }

    best
}

/// Decide the outcome status from the available evidence.
pub fn assess(
    parsed: Option<&Value>,
    sentinel_seen: bool,
    exit_code: Option<i64>,
) -> (AgentStatus, String) {
    if let Some(parsed) = parsed {
        let status = match parsed.get("status").and_then(Value::as_str) {
            Some("ok") => AgentStatus::Ok,
            Some(_) => AgentStatus::Error,
            None if sentinel_seen => AgentStatus::Ok,
            None => AgentStatus::Error,
        };
        let summary = parsed
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("Agent completed")
            .to_string();
        return (status, summary);
    }

    if sentinel_seen {
        return (
            AgentStatus::Warning,
            "Agent completed but produced no structured output".to_string(),
        );
    }

    if exit_code.is_some_and(|code| code != 0) {
        return (
            AgentStatus::Error,
            format!("Agent exited with code {}", exit_code.unwrap_or(-1)),
        );
    }

    (
        AgentStatus::Error,
        "Agent failed to complete (no result or sentinel)".to_string(),
    )
}
