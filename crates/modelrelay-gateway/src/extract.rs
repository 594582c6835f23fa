//! Free-text tool-call extraction.
//!
//! Some models emit tool calls inline as text instead of through the
//! structured channel.  This module is the best-effort fallback that pulls
//! a call out of such text: XML-like `<function>` forms, a handful of JSON
//! envelope keys, and a last-resort pattern match.  It is explicitly *not*
//! a general parser — [`lenient_json`] applies one bounded set of textual
//! repairs and one retry, and anything beyond that yields `None`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

/// A tool call recovered from free text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCall {
    pub name: String,
    pub arguments: Value,
}

static XML_ARGS_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<function>\s*(\w+)\s*</function>\s*([\{\[].*[\}\]])").expect("static regex")
});

static XML_ARGS_INSIDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<function>\s*(\w+)\s*([\{\[].*[\}\]])\s*</function>").expect("static regex")
});

static NAME_AND_ARGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\{[^}]*"name"\s*:\s*"([^"]+)"[^}]*"arguments"\s*:\s*(\{[\s\S]*\})"#)
        .expect("static regex")
});

static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(.*?)'").expect("static regex"));

static TRAILING_COMMA_OBJ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\}").expect("static regex"));

static TRAILING_COMMA_ARR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\]").expect("static regex"));

/// Parse a JSON string, tolerating two specific classes of model typo:
/// single-quoted strings and trailing commas.
///
/// Strict parse first; on failure the fixups are applied and parsing is
/// retried exactly once.  Returns `None` for anything still malformed —
/// this function never guesses beyond its documented repairs.
pub fn lenient_json(s: &str) -> Option<Value> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str(s) {
        return Some(v);
    }

    let fixed = SINGLE_QUOTED.replace_all(s, "\"$1\"");
    let fixed = TRAILING_COMMA_OBJ.replace_all(&fixed, "}");
    let fixed = TRAILING_COMMA_ARR.replace_all(&fixed, "]");
    serde_json::from_str(&fixed).ok()
}

/// Extract a tool call from a free-text message.
///
/// Recognized shapes, tried in order:
/// 1. `<function>name</function>{...}` and `<function>name{...}</function>`
/// 2. a JSON object that is itself `{"name": ..., "arguments": ...}` or
///    wraps one under `tool_call` / `tool_calls` / `function_call` / `tool`
/// 3. a last-resort scan for adjacent `"name"` and `"arguments"` fields
///
/// Write-class extractions are validated strictly: a
/// `create_or_update_file` call must carry string `file_path` and
/// `content`, and a `compose_project` call must carry a `files` array.
pub fn extract_tool_call(s: &str) -> Option<ExtractedCall> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }

    let call = xml_form(s)
        .or_else(|| json_form(trimmed))
        .or_else(|| pattern_form(s))?;

    validate(call)
}

fn xml_form(s: &str) -> Option<ExtractedCall> {
    for re in [&*XML_ARGS_AFTER, &*XML_ARGS_INSIDE] {
        if let Some(caps) = re.captures(s)
            && let Some(args) = lenient_json(&caps[2])
        {
            return Some(ExtractedCall {
                name: caps[1].to_owned(),
                arguments: args,
            });
        }
    }
    None
}

fn json_form(trimmed: &str) -> Option<ExtractedCall> {
    if !trimmed.starts_with('{') {
        return None;
    }
    let v = lenient_json(trimmed)?;

    // Direct format: {"name": "...", "arguments": {...}}.
    if v["name"].is_string() && v.get("arguments").is_some() {
        return call_from_value(&v);
    }

    if let Some(inner) = v.get("tool_call") {
        return call_from_value(inner);
    }
    if let Some(first) = v["tool_calls"].as_array().and_then(|calls| calls.first()) {
        return call_from_value(first);
    }
    if let Some(fc) = v.get("function_call") {
        return call_from_value(fc);
    }
    if let Some(tool) = v.get("tool") {
        // `tool` may be the call object or just the bare name.
        if let Some(name) = tool.as_str() {
            return Some(ExtractedCall {
                name: name.to_owned(),
                arguments: json!({}),
            });
        }
        return call_from_value(tool);
    }

    None
}

fn pattern_form(s: &str) -> Option<ExtractedCall> {
    let caps = NAME_AND_ARGS.captures(s)?;
    let args = lenient_json(&caps[2])?;
    Some(ExtractedCall {
        name: caps[1].to_owned(),
        arguments: args,
    })
}

/// Read `{name, arguments}` out of a value, decoding stringified arguments.
fn call_from_value(v: &Value) -> Option<ExtractedCall> {
    let name = v["name"].as_str()?.to_owned();
    let arguments = match v.get("arguments") {
        Some(Value::String(s)) => lenient_json(s).unwrap_or_else(|| json!({})),
        Some(args) if args.is_object() || args.is_array() => args.clone(),
        _ => json!({}),
    };
    Some(ExtractedCall { name, arguments })
}

/// Fail closed on write-class calls whose recovered arguments are unusable.
fn validate(call: ExtractedCall) -> Option<ExtractedCall> {
    if call.name.ends_with("create_or_update_file") {
        let path_ok = call.arguments["file_path"]
            .as_str()
            .is_some_and(|p| !p.is_empty());
        let content_ok = call.arguments["content"].is_string();
        if !path_ok || !content_ok {
            return None;
        }
    }
    if call.name.ends_with("compose_project") && !call.arguments["files"].is_array() {
        return None;
    }
    Some(call)
}

// ── tests ────────────────────────────────────────────────────────────
