//! Message and content-block model shared by memory and evaluation.
//!
//! A [`Message`] is immutable once built: id, sender name, role, content, optional
//! metadata, creation timestamp, optional correlation id for the LLM invocation that
//! produced it. Content is either a plain string or an ordered list of typed
//! [`ContentBlock`]s; everything that accepts "string or blocks" goes through the
//! helpers on [`Content`] so call sites never re-handle the two shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Sender role. The only three values the runtime accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("unknown role: {} (use system, user, assistant)", s)),
        }
    }
}

/// Media payload for image/audio/video blocks: inline base64 or a URL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// One typed content block. Each variant carries its own `type` discriminator on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },
    ToolResult {
        id: String,
        name: String,
        output: JsonValue,
    },
    Image {
        source: MediaSource,
    },
    Audio {
        source: MediaSource,
    },
    Video {
        source: MediaSource,
    },
    /// Pointer block listing side files a long message or summary was offloaded to.
    SourceFile {
        source_file: Vec<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }

    /// Source-file paths referenced by this block, empty for non-pointer blocks.
    pub fn source_files(&self) -> &[String] {
        match self {
            ContentBlock::SourceFile { source_file } => source_file,
            _ => &[],
        }
    }
}

/// Message content: a plain string or an ordered list of blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    pub fn blocks(blocks: Vec<ContentBlock>) -> Self {
        Content::Blocks(blocks)
    }

    /// The plain string form, if this content is plain text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            Content::Blocks(_) => None,
        }
    }

    /// The block list, empty for plain text.
    pub fn as_blocks(&self) -> &[ContentBlock] {
        match self {
            Content::Text(_) => &[],
            Content::Blocks(blocks) => blocks,
        }
    }

    /// Mutable block list; `None` for plain text.
    pub fn as_blocks_mut(&mut self) -> Option<&mut Vec<ContentBlock>> {
        match self {
            Content::Text(_) => None,
            Content::Blocks(blocks) => Some(blocks),
        }
    }

    /// Converts to a block list, wrapping plain text in a single text block.
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            Content::Text(s) => vec![ContentBlock::Text { text: s }],
            Content::Blocks(blocks) => blocks,
        }
    }

    /// Appends a block, converting plain text into a text block first.
    pub fn push_block(&mut self, block: ContentBlock) {
        if let Content::Text(s) = self {
            *self = Content::Blocks(vec![ContentBlock::Text {
                text: std::mem::take(s),
            }]);
        }
        if let Content::Blocks(blocks) = self {
            blocks.push(block);
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Blocks(blocks) => blocks.is_empty(),
        }
    }

    pub fn has_tool_use(&self) -> bool {
        self.as_blocks().iter().any(ContentBlock::is_tool_use)
    }

    pub fn has_tool_result(&self) -> bool {
        self.as_blocks().iter().any(ContentBlock::is_tool_result)
    }

    /// JSON form: string for text, array of block objects otherwise.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Content::Text(s) => JsonValue::String(s.clone()),
            Content::Blocks(blocks) => {
                serde_json::to_value(blocks).unwrap_or(JsonValue::Array(vec![]))
            }
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<Vec<ContentBlock>> for Content {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        Content::Blocks(blocks)
    }
}

/// Generates a short unique id (32 lowercase hex chars, uuid v4 without hyphens).
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// One chat message. Created by agents or users, never mutated once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, JsonValue>>,
    pub created_at: DateTime<Utc>,
    /// Correlation id linking this message to the LLM invocation that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
}

impl Message {
    pub fn new(name: impl Into<String>, role: Role, content: impl Into<Content>) -> Self {
        Self {
            id: short_id(),
            name: name.into(),
            role,
            content: content.into(),
            metadata: None,
            created_at: Utc::now(),
            invocation_id: None,
        }
    }

    pub fn system(name: impl Into<String>, content: impl Into<Content>) -> Self {
        Self::new(name, Role::System, content)
    }

    pub fn user(name: impl Into<String>, content: impl Into<Content>) -> Self {
        Self::new(name, Role::User, content)
    }

    pub fn assistant(name: impl Into<String>, content: impl Into<Content>) -> Self {
        Self::new(name, Role::Assistant, content)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, JsonValue>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_invocation_id(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = Some(invocation_id.into());
        self
    }

    /// Compact JSON object for prompt rendering and token counting.
    ///
    /// Block-content system messages render as assistant, matching what the
    /// memory-update prompt expects to see.
    pub fn render(&self, idx: Option<usize>) -> JsonValue {
        let role = match (&self.content, self.role) {
            (Content::Blocks(_), Role::System) => Role::Assistant,
            (_, role) => role,
        };
        let mut obj = serde_json::Map::new();
        if let Some(i) = idx {
            obj.insert("id".into(), JsonValue::from(i));
        }
        obj.insert("role".into(), JsonValue::String(role.as_str().into()));
        obj.insert("content".into(), self.content.to_json());
        JsonValue::Object(obj)
    }
}

/// Renders a message slice as a JSON array string, optionally numbering entries 0..n-1.
pub fn render_messages(msgs: &[Message], with_id: bool) -> String {
    let rendered: Vec<JsonValue> = msgs
        .iter()
        .enumerate()
        .map(|(i, m)| m.render(with_id.then_some(i)))
        .collect();
    serde_json::to_string(&rendered).unwrap_or_else(|_| "[]".to_string())
}

/// Renders one message as a single-element JSON array string (token counting unit).
pub fn render_message(msg: &Message) -> String {
    render_messages(std::slice::from_ref(msg), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_round_trips_with_type_tag() {
        let block = ContentBlock::ToolUse {
            id: "u1".into(),
            name: "search".into(),
            input: serde_json::json!({"q": "rust"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn content_untagged_accepts_string_and_blocks() {
        let text: Content = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(text.as_text(), Some("hello"));

        let blocks: Content =
            serde_json::from_str(r#"[{"type": "text", "text": "hi"}]"#).unwrap();
        assert_eq!(blocks.as_blocks().len(), 1);
    }

    #[test]
    fn push_block_converts_text_content() {
        let mut content = Content::text("reasoning");
        content.push_block(ContentBlock::ToolUse {
            id: "u1".into(),
            name: "bash".into(),
            input: JsonValue::Null,
        });
        let blocks = content.as_blocks();
        assert_eq!(blocks.len(), 2);
        assert!(matches!(blocks[0], ContentBlock::Text { .. }));
        assert!(blocks[1].is_tool_use());
    }

    #[test]
    fn render_numbers_messages_in_order() {
        let msgs = vec![
            Message::user("alice", "first"),
            Message::assistant("bot", "second"),
        ];
        let rendered: Vec<JsonValue> =
            serde_json::from_str(&render_messages(&msgs, true)).unwrap();
        assert_eq!(rendered[0]["id"], 0);
        assert_eq!(rendered[1]["id"], 1);
        assert_eq!(rendered[0]["content"], "first");
    }

    #[test]
    fn render_block_system_message_as_assistant() {
        let msg = Message::system("mgr", vec![ContentBlock::text("summary")]);
        let rendered = msg.render(None);
        assert_eq!(rendered["role"], "assistant");
    }

    #[test]
    fn plain_system_message_keeps_role() {
        let msg = Message::system("mgr", "prompt");
        let rendered = msg.render(None);
        assert_eq!(rendered["role"], "system");
    }

    #[test]
    fn short_ids_are_unique_and_hex() {
        let a = short_id();
        let b = short_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn role_from_str() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("robot".parse::<Role>().is_err());
    }
}
