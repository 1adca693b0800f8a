//! Tolerant decoder for memory-update actions returned by the chat model.
//!
//! The model is asked for a plain JSON array of `{type, role, id?, content}` actions
//! but frequently wraps it in markdown fences or leaves trailing commas; the decoder
//! strips both, accepts a single object in place of an array, `id` as an integer or a
//! numeric string, and mixed-case action types.

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::message::{Content, Role};

/// One decoded action. `Update.id` is the prompt-local index into the renumbered
/// related-memory list, not a record id; the manager maps it back.
#[derive(Clone, Debug, PartialEq)]
pub enum MemoryAction {
    Add { role: Role, content: Content },
    Update {
        id: i64,
        role: Role,
        content: Content,
    },
}

#[derive(Debug, Error)]
pub enum ActionParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("action missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid action: {0}")]
    Invalid(String),
}

/// Removes a surrounding markdown code fence (```json ... ``` or ``` ... ```).
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(trimmed)
}

/// Removes commas directly preceding a closing bracket or brace, outside strings.
fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next_meaningful = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next_meaningful, Some(']') | Some('}')) {
                    continue; // drop trailing comma
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn parse_role(value: Option<&JsonValue>) -> Role {
    value
        .and_then(JsonValue::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(Role::Assistant)
}

fn parse_content(value: &JsonValue) -> Content {
    match value {
        JsonValue::String(s) => Content::Text(s.clone()),
        JsonValue::Array(_) => serde_json::from_value(value.clone())
            .unwrap_or_else(|_| Content::Text(value.to_string())),
        other => Content::Text(other.to_string()),
    }
}

fn parse_id(value: &JsonValue) -> Result<i64, ActionParseError> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .ok_or_else(|| ActionParseError::Invalid(format!("non-integer id: {}", n))),
        JsonValue::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ActionParseError::Invalid(format!("non-numeric id: {:?}", s))),
        other => Err(ActionParseError::Invalid(format!(
            "unsupported id value: {}",
            other
        ))),
    }
}

fn parse_one(value: &JsonValue) -> Result<MemoryAction, ActionParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ActionParseError::Invalid(format!("action is not an object: {}", value)))?;
    let action_type = obj
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or(ActionParseError::MissingField("type"))?;
    let role = parse_role(obj.get("role"));
    let content = parse_content(
        obj.get("content")
            .ok_or(ActionParseError::MissingField("content"))?,
    );
    match action_type.to_uppercase().as_str() {
        "ADD" => Ok(MemoryAction::Add { role, content }),
        "UPDATE" => {
            let id = parse_id(obj.get("id").ok_or(ActionParseError::MissingField("id"))?)?;
            Ok(MemoryAction::Update { id, role, content })
        }
        other => Err(ActionParseError::Invalid(format!(
            "unknown action type: {}",
            other
        ))),
    }
}

/// Decodes a model response into actions.
pub fn decode_actions(raw: &str) -> Result<Vec<MemoryAction>, ActionParseError> {
    let cleaned = strip_trailing_commas(strip_code_fence(raw));
    let value: JsonValue = serde_json::from_str(cleaned.trim())?;
    let entries = match value {
        JsonValue::Array(entries) => entries,
        obj @ JsonValue::Object(_) => vec![obj],
        other => {
            return Err(ActionParseError::Invalid(format!(
                "expected array or object, got: {}",
                other
            )))
        }
    };
    entries.iter().map(parse_one).collect()
}
