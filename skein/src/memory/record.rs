//! Memory records: vector-store-backed entries derived from messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::message::{short_id, Content, Message, Role};

/// Payload stored alongside a record's embedding in the vector store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub data: Content,
    pub role: Role,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl RecordPayload {
    pub fn new(data: Content, role: Role, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            data,
            role,
            name: name.into(),
            created_at: now,
            last_modified_at: now,
        }
    }
}

/// One LLM-processed memory entry. Records are ordered by `last_modified_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub payload: RecordPayload,
}

impl MemoryRecord {
    pub fn new(data: Content, role: Role, name: impl Into<String>) -> Self {
        Self {
            id: short_id(),
            embedding: None,
            payload: RecordPayload::new(data, role, name),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Replaces content and embedding, bumping `last_modified_at`.
    pub fn update(&mut self, data: Content, embedding: Option<Vec<f32>>) {
        self.payload.data = data;
        if embedding.is_some() {
            self.embedding = embedding;
        }
        self.payload.last_modified_at = Utc::now();
    }

    /// Recovers a [`Message`] from this record; the record id is preserved.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::new(
            self.payload.name.clone(),
            self.payload.role,
            Content::Blocks(self.payload.data.clone().into_blocks()),
        );
        msg.id = self.id.clone();
        msg.created_at = self.payload.created_at;
        msg
    }

    /// Compact JSON object for prompt rendering and token counting.
    pub fn render(&self, idx: Option<usize>) -> JsonValue {
        let mut obj = serde_json::Map::new();
        if let Some(i) = idx {
            obj.insert("id".into(), JsonValue::from(i));
        }
        obj.insert(
            "role".into(),
            JsonValue::String(self.payload.role.as_str().into()),
        );
        obj.insert("content".into(), self.payload.data.to_json());
        JsonValue::Object(obj)
    }

    /// Side-file paths referenced by this record's pointer blocks.
    pub fn source_files(&self) -> Vec<String> {
        self.payload
            .data
            .as_blocks()
            .iter()
            .flat_map(|b| b.source_files().iter().cloned())
            .collect()
    }
}

/// Renders a record slice as a JSON array string, optionally numbering entries 0..n-1.
pub fn render_records(records: &[MemoryRecord], with_id: bool) -> String {
    let rendered: Vec<JsonValue> = records
        .iter()
        .enumerate()
        .map(|(i, r)| r.render(with_id.then_some(i)))
        .collect();
    serde_json::to_string(&rendered).unwrap_or_else(|_| "[]".to_string())
}

/// Renders one record as a single-element JSON array string (token counting unit).
pub fn render_record(record: &MemoryRecord) -> String {
    render_records(std::slice::from_ref(record), false)
}

/// Non-fatal sanity check: records must be in non-decreasing `last_modified_at` order.
pub fn records_in_time_order(records: &[MemoryRecord]) -> bool {
    records
        .windows(2)
        .all(|w| w[0].payload.last_modified_at <= w[1].payload.last_modified_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentBlock;

    #[test]
    fn update_bumps_last_modified() {
        let mut record = MemoryRecord::new(Content::text("old"), Role::Assistant, "agent");
        let before = record.payload.last_modified_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        record.update(Content::text("new"), Some(vec![0.1]));
        assert!(record.payload.last_modified_at > before);
        assert_eq!(record.payload.data.as_text(), Some("new"));
        assert_eq!(record.embedding, Some(vec![0.1]));
    }

    #[test]
    fn to_message_wraps_text_in_blocks_and_keeps_id() {
        let record = MemoryRecord::new(Content::text("fact"), Role::System, "mgr");
        let msg = record.to_message();
        assert_eq!(msg.id, record.id);
        assert_eq!(msg.content.as_blocks().len(), 1);
        assert!(matches!(
            msg.content.as_blocks()[0],
            ContentBlock::Text { .. }
        ));
    }

    #[test]
    fn time_order_check_detects_violation() {
        let a = MemoryRecord::new(Content::text("a"), Role::Assistant, "agent");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = MemoryRecord::new(Content::text("b"), Role::Assistant, "agent");
        assert!(records_in_time_order(&[a.clone(), b.clone()]));
        assert!(!records_in_time_order(&[b, a]));
    }

    #[test]
    fn source_files_collects_pointer_blocks() {
        let record = MemoryRecord::new(
            Content::Blocks(vec![
                ContentBlock::text("summary"),
                ContentBlock::SourceFile {
                    source_file: vec!["tracing_1.md".into(), "tool_result_2.md".into()],
                },
            ]),
            Role::System,
            "mgr",
        );
        assert_eq!(record.source_files().len(), 2);
    }
}
