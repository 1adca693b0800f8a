//! Two-tier memory manager: verbatim chat history plus LLM-processed records.
//!
//! `chat_history` receives every incoming message unchanged and is never summarized.
//! `memory` holds processed [`MemoryRecord`]s mirrored into a [`VectorStore`]; the
//! manager coordinates the chat model, embedder, and splitter to keep it under
//! `max_memory_len` tokens via global summarization, and to keep individual entries
//! under the chunk limit via long-context processing with side files.
//!
//! Callers serialize access: methods take `&mut self` and there are no internal locks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::llm::{ChatModel, ModelError};
use crate::message::{
    render_message, render_messages, short_id, Content, ContentBlock, Message, Role,
};
use crate::splitter::{HeuristicCounter, RecursiveTextSplitter, TokenCounter};

use super::actions::{decode_actions, MemoryAction};
use super::embedder::Embedder;
use super::prompts::{render_template, MemoryPrompts};
use super::record::{records_in_time_order, render_record, render_records, MemoryRecord};
use super::store::{SearchHit, SearchQuery, StoreError, StoredVector, VectorStore};

pub const DEFAULT_MAX_CHAT_LEN: usize = 28_000;
pub const DEFAULT_MAX_MEMORY_LEN: usize = 28_000;
pub const DEFAULT_MAX_CHAT_MODEL_TOKENS: usize = 28_000;
pub const DEFAULT_MAX_CHUNK_TOKENS: usize = 7_000;
pub const DEFAULT_MAX_EMBEDDING_TOKENS: usize = 8_000;
pub const DEFAULT_OVERLAP_TOKENS: usize = 500;
pub const DEFAULT_MAX_TOOL_RESULT_TOKENS: usize = 5_000;
pub const DEFAULT_RECENT_N: usize = 28_000;

/// Which store `get_memory` reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieveType {
    /// The verbatim chat history.
    Source,
    /// The LLM-processed records.
    Processed,
    /// `processed` iff the chat-history token estimate exceeds `max_chat_len`.
    Auto,
}

/// Which store export/load operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Source,
    Processed,
}

/// Memory manager tuning knobs.
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Auto retrieval switches to processed memory above this chat-history estimate.
    pub max_chat_len: usize,
    /// Global summarization runs when the processed-memory estimate exceeds this.
    pub max_memory_len: usize,
    /// Chunk size for summarization and the packing limit for record groups.
    pub max_chat_model_tokens: usize,
    /// A single message above this (after tool-result offload) gets its text offloaded.
    pub max_chunk_tokens: usize,
    /// Text embedded for search is truncated to this many tokens.
    pub max_embedding_tokens: usize,
    /// Overlap carried between summarization chunks.
    pub overlap_tokens: usize,
    /// Tool results above this are saved to a side file and summarized in place.
    pub max_tool_result_tokens: usize,
    /// `get_memory` fallback when `recent_n` is absent or zero.
    pub default_recent_n: usize,
    pub retrieve_type: RetrieveType,
    /// When false, UPDATE actions are never eligible and always downgrade to ADD.
    pub global_update_allowed: bool,
    /// When false, `add` mirrors messages into memory without the LLM protocol.
    pub process_with_llm: bool,
    /// Target fraction of processed-memory tokens to compress away globally.
    pub compressed_ratio: f64,
    /// Directory for side files (offloaded tool results, tracing files).
    pub mount_dir: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_chat_len: DEFAULT_MAX_CHAT_LEN,
            max_memory_len: DEFAULT_MAX_MEMORY_LEN,
            max_chat_model_tokens: DEFAULT_MAX_CHAT_MODEL_TOKENS,
            max_chunk_tokens: DEFAULT_MAX_CHUNK_TOKENS,
            max_embedding_tokens: DEFAULT_MAX_EMBEDDING_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
            max_tool_result_tokens: DEFAULT_MAX_TOOL_RESULT_TOKENS,
            default_recent_n: DEFAULT_RECENT_N,
            retrieve_type: RetrieveType::Auto,
            global_update_allowed: false,
            process_with_llm: false,
            compressed_ratio: 0.5,
            mount_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("memory io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("memory serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("memory action failed: {0}")]
    ActionFailed(String),
}

/// Query accepted by [`MemoryManager::retrieve_from_vector_store`].
#[derive(Clone, Debug)]
pub enum MemoryQuery {
    Text(String),
    Message(Message),
    Record(MemoryRecord),
    Embedding(Vec<f32>),
}

/// Action ready to execute, with prompt-local indices resolved to record ids.
#[derive(Clone, Debug)]
enum ExecAction {
    Add {
        role: Role,
        content: Content,
    },
    Update {
        record_id: String,
        role: Role,
        content: Content,
    },
}

pub type RecordFilter<'a> = &'a (dyn Fn(&MemoryRecord) -> bool + Send + Sync);
pub type MessageFilter<'a> = &'a (dyn Fn(usize, &Message) -> bool + Send + Sync);
pub type PostProcess<'a> = &'a (dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync);

fn content_to_string(content: &Content) -> String {
    match content {
        Content::Text(s) => s.clone(),
        Content::Blocks(blocks) => serde_json::to_string(blocks).unwrap_or_default(),
    }
}

fn json_value_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn hits_in_time_order(hits: &[SearchHit]) -> bool {
    hits.windows(2)
        .all(|w| w[0].payload.last_modified_at <= w[1].payload.last_modified_at)
}

/// Two-tier memory for a single agent.
pub struct MemoryManager {
    config: MemoryConfig,
    prompts: MemoryPrompts,
    chat_model: Arc<dyn ChatModel>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    splitter: RecursiveTextSplitter,
    counter: Arc<dyn TokenCounter>,
    chat_history: Vec<Message>,
    memory: Vec<MemoryRecord>,
    /// Messages carrying tool_use blocks whose tool_result has not arrived yet.
    pending_tool_use: Vec<Message>,
    chat_tokens: usize,
    memory_tokens: usize,
}

impl MemoryManager {
    pub fn new(
        chat_model: Arc<dyn ChatModel>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: MemoryConfig,
    ) -> Self {
        let counter: Arc<dyn TokenCounter> = Arc::new(HeuristicCounter::default());
        let splitter = RecursiveTextSplitter::new(
            config.max_chat_model_tokens,
            config.overlap_tokens,
            counter.clone(),
        );
        Self {
            config,
            prompts: MemoryPrompts::default(),
            chat_model,
            embedder,
            store,
            splitter,
            counter,
            chat_history: Vec::new(),
            memory: Vec::new(),
            pending_tool_use: Vec::new(),
            chat_tokens: 0,
            memory_tokens: 0,
        }
    }

    pub fn with_prompts(mut self, prompts: MemoryPrompts) -> Self {
        self.prompts = prompts;
        self
    }

    /// Replaces the token counter (and the splitter built on it).
    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.splitter = RecursiveTextSplitter::new(
            self.config.max_chat_model_tokens,
            self.config.overlap_tokens,
            counter.clone(),
        );
        self.counter = counter;
        self
    }

    pub fn history(&self) -> &[Message] {
        &self.chat_history
    }

    pub fn records(&self) -> &[MemoryRecord] {
        &self.memory
    }

    pub fn chat_token_estimate(&self) -> usize {
        self.chat_tokens
    }

    pub fn memory_token_estimate(&self) -> usize {
        self.memory_tokens
    }

    /// Number of chat-history entries.
    pub fn size(&self) -> usize {
        self.chat_history.len()
    }

    fn count_text(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    fn count_message(&self, msg: &Message) -> usize {
        self.counter.count(&render_message(msg))
    }

    fn count_record(&self, record: &MemoryRecord) -> usize {
        self.counter.count(&render_record(record))
    }

    /// Cuts text to at most `max_tokens`, proportionally by characters.
    fn truncate_text(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        let mut out = text.to_string();
        let mut count = self.counter.count(&out);
        while count > max_tokens {
            let chars: Vec<char> = out.chars().collect();
            let keep = ((chars.len() * max_tokens) / count).min(chars.len().saturating_sub(1));
            out = chars.into_iter().take(keep).collect();
            if out.is_empty() {
                break;
            }
            count = self.counter.count(&out);
        }
        out
    }

    fn save_side_file(&self, name: &str, content: &str) -> Result<PathBuf, MemoryError> {
        std::fs::create_dir_all(&self.config.mount_dir)?;
        let path = self.config.mount_dir.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    // ------------------------------------------------------------------
    // Add protocol
    // ------------------------------------------------------------------

    /// Adds messages: always appends to chat history; with `process_with_llm` the
    /// messages additionally run through pairing, long-context processing, and the
    /// LLM-mediated action protocol before landing in processed memory.
    pub async fn add(&mut self, msgs: Vec<Message>) -> Result<(), MemoryError> {
        if msgs.is_empty() {
            return Ok(());
        }
        self.direct_add_chat_history(&msgs);
        if !self.config.process_with_llm {
            self.direct_add_memory(msgs, None, true).await?;
            return Ok(());
        }
        tracing::info!(count = msgs.len(), "adding messages to processed memory");
        let concerned = self.extract_concerned(&msgs);
        self.process_into_memory(concerned).await
    }

    async fn process_into_memory(&mut self, concerned: Vec<Message>) -> Result<(), MemoryError> {
        if concerned.is_empty() {
            return Ok(());
        }
        let concerned = self.long_context_process(concerned).await?;
        let actions = self.plan_actions(&concerned).await?;
        self.execute_actions(actions).await
    }

    /// Appends to the verbatim chat history and updates its token estimate.
    pub fn direct_add_chat_history(&mut self, msgs: &[Message]) {
        for msg in msgs {
            self.chat_tokens += self.count_message(msg);
            self.chat_history.push(msg.clone());
        }
    }

    /// Selects messages for processing, pairing buffered tool_use with incoming
    /// tool_result blocks by id. A message with an unmatched tool_use is buffered; a
    /// later matching tool_result merges with it (tool_use first, then the buffered
    /// text blocks, then the new content) into one concerned message.
    fn extract_concerned(&mut self, msgs: &[Message]) -> Vec<Message> {
        let mut concerned = Vec::new();
        for msg in msgs {
            if msg.content.as_text().is_some() {
                concerned.push(msg.clone());
                continue;
            }
            let has_use = msg.content.has_tool_use();
            let has_result = msg.content.has_tool_result();
            if has_use && !has_result {
                self.pending_tool_use.push(msg.clone());
            } else if has_result && !self.pending_tool_use.is_empty() {
                let mut matched = false;
                let mut moved: Vec<ContentBlock> = Vec::new();
                let mut buffered_empty = false;
                if let Some(last) = self.pending_tool_use.last_mut() {
                    if let Some(blocks) = last.content.as_blocks_mut() {
                        for block in msg.content.as_blocks() {
                            if let ContentBlock::ToolResult { id: result_id, .. } = block {
                                let pos = blocks.iter().position(|b| {
                                    matches!(b, ContentBlock::ToolUse { id, .. } if id == result_id)
                                });
                                if let Some(pos) = pos {
                                    matched = true;
                                    moved.push(blocks.remove(pos));
                                }
                            }
                        }
                        if matched {
                            let mut i = 0;
                            while i < blocks.len() {
                                if matches!(blocks[i], ContentBlock::Text { .. }) {
                                    moved.push(blocks.remove(i));
                                } else {
                                    i += 1;
                                }
                            }
                            buffered_empty = blocks.is_empty();
                        }
                    }
                }
                if matched {
                    let buffered = if buffered_empty {
                        self.pending_tool_use.pop()
                    } else {
                        self.pending_tool_use.last().cloned()
                    };
                    let (name, role) = buffered
                        .map(|b| (b.name, b.role))
                        .unwrap_or_else(|| (msg.name.clone(), msg.role));
                    moved.extend(msg.content.as_blocks().iter().cloned());
                    concerned.push(Message::new(name, role, Content::Blocks(moved)));
                } else {
                    tracing::warn!(
                        id = %msg.id,
                        "tool result does not match any buffered tool use"
                    );
                }
            } else {
                concerned.push(msg.clone());
            }
        }
        concerned
    }

    // ------------------------------------------------------------------
    // Long-context processing
    // ------------------------------------------------------------------

    /// Shrinks oversized messages: tool results above the limit are saved to side
    /// files and summarized in place; a message still above `max_chunk_tokens` gets
    /// its text blocks offloaded, then up to 3 whole-message summarization passes,
    /// then truncation. Referenced side files are appended as a source_file block.
    async fn long_context_process(
        &self,
        msgs: Vec<Message>,
    ) -> Result<Vec<Message>, MemoryError> {
        let mut out = Vec::with_capacity(msgs.len());
        for mut msg in msgs {
            let mut file_list: Vec<String> = Vec::new();

            let oversized: Vec<(String, String, String)> = msg
                .content
                .as_blocks()
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { id, name, output } => {
                        let text = json_value_to_text(output);
                        (self.count_text(&text) > self.config.max_tool_result_tokens)
                            .then(|| (id.clone(), name.clone(), text))
                    }
                    _ => None,
                })
                .collect();
            for (result_id, tool_name, text) in oversized {
                let path = format!("tool_result_{}.md", result_id);
                self.save_side_file(&path, &text)?;
                let query = format!("the result of tool {}", tool_name);
                let summary = self.summarize_sequential_with_query(&text, &query).await?;
                if let Some(blocks) = msg.content.as_blocks_mut() {
                    for block in blocks.iter_mut() {
                        if let ContentBlock::ToolResult { id, output, .. } = block {
                            if *id == result_id {
                                *output = JsonValue::String(format!(
                                    "{}. The original tool result is saved in {}.",
                                    summary, path
                                ));
                            }
                        }
                    }
                }
                file_list.push(path);
            }

            if self.count_message(&msg) > self.config.max_chunk_tokens {
                tracing::warn!(
                    id = %msg.id,
                    "message exceeds chunk limit after tool-result offload"
                );
                let blocks = msg.content.clone().into_blocks();
                let mut new_blocks = Vec::with_capacity(blocks.len());
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            let path = format!("reasoning_{}.md", short_id());
                            self.save_side_file(&path, &text)?;
                            let summary = self.summarize_sequential(&text).await?;
                            new_blocks.push(ContentBlock::Text {
                                text: format!(
                                    "{} For more details of the original reasoning process, \
                                     please refer to {}.",
                                    summary, path
                                ),
                            });
                            file_list.push(path);
                        }
                        other => new_blocks.push(other),
                    }
                }
                msg.content = Content::Blocks(new_blocks);

                let mut retries = 3;
                while self.count_message(&msg) > self.config.max_chunk_tokens && retries > 0 {
                    let summarized = self.summarize_single_message(&msg).await?;
                    msg.content = summarized.content;
                    retries -= 1;
                }
                if self.count_message(&msg) > self.config.max_chunk_tokens {
                    tracing::warn!("failed to shrink message after 3 passes, truncating");
                    let text = content_to_string(&msg.content);
                    let truncated = self.truncate_text(&text, self.config.max_chunk_tokens);
                    msg.content = Content::Blocks(vec![ContentBlock::Text {
                        text: format!(
                            "{} For more details, please refer to these files: {:?}.",
                            truncated, file_list
                        ),
                    }]);
                }
            }

            if !file_list.is_empty() {
                msg.content
                    .push_block(ContentBlock::SourceFile { source_file: file_list });
            }
            out.push(msg);
        }
        Ok(out)
    }

    /// Summarizes one message into a new message pointing at its side files.
    async fn summarize_single_message(&self, msg: &Message) -> Result<Message, MemoryError> {
        let path = format!("msg_{}.md", short_id());
        let rendered = render_message(msg);
        self.save_side_file(&path, &rendered)?;
        let summary = self.summarize_sequential(&rendered).await?;
        let mut files = vec![path];
        for block in msg.content.as_blocks() {
            files.extend(block.source_files().iter().cloned());
        }
        Ok(Message::new(
            msg.name.clone(),
            msg.role,
            Content::Blocks(vec![
                ContentBlock::Text {
                    text: format!(
                        "{} More details are saved in these files: {:?}.",
                        summary, files
                    ),
                },
                ContentBlock::SourceFile { source_file: files },
            ]),
        ))
    }

    // ------------------------------------------------------------------
    // Sequential summarization
    // ------------------------------------------------------------------

    /// Left-to-right chunked summarization: each step revises the running summary
    /// from (chunk, previous summary, progress).
    pub async fn summarize_sequential(&self, text: &str) -> Result<String, MemoryError> {
        let chunks = self.splitter.split_text(text);
        let total = chunks.len().to_string();
        let mut summary = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let prompt = render_template(
                &self.prompts.summarize_log,
                &[
                    ("chunk_idx", (i + 1).to_string().as_str()),
                    ("total_chunks", &total),
                    ("log_excerpt", chunk),
                    ("previous_summary", &summary),
                ],
            );
            let response = self
                .chat_model
                .call(&[Message::system("memory_manager", prompt)])
                .await?;
            summary = response.text();
        }
        Ok(summary)
    }

    /// Query-aware variant: the running summary is a note refined toward `query`.
    pub async fn summarize_sequential_with_query(
        &self,
        text: &str,
        query: &str,
    ) -> Result<String, MemoryError> {
        let chunks = self.splitter.split_text(text);
        let total = chunks.len().to_string();
        let mut notes = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let prompt = render_template(
                &self.prompts.summarize_log_with_query,
                &[
                    ("chunk_idx", (i + 1).to_string().as_str()),
                    ("total_chunks", &total),
                    ("chunk", chunk),
                    ("existing_notes", &notes),
                    ("question", query),
                ],
            );
            let response = self
                .chat_model
                .call(&[Message::system("memory_manager", prompt)])
                .await?;
            notes = response.text();
        }
        Ok(notes)
    }

    // ------------------------------------------------------------------
    // Memory-update action protocol
    // ------------------------------------------------------------------

    async fn plan_actions(
        &mut self,
        concerned: &[Message],
    ) -> Result<Vec<ExecAction>, MemoryError> {
        let queries: Vec<MemoryQuery> = concerned
            .iter()
            .cloned()
            .map(MemoryQuery::Message)
            .collect();
        let related = self.retrieve_from_vector_store(&queries, 5).await?;
        if !hits_in_time_order(&related) {
            tracing::warn!("retrieved memories are not in time order");
        }

        let latest_id = self.memory.last().map(|m| m.id.clone());
        let mut update_allowed = false;
        let mut index_to_id: Vec<String> = Vec::new();
        let mut database_entries: Vec<JsonValue> = Vec::new();
        if self.config.global_update_allowed {
            for (idx, hit) in related.iter().enumerate() {
                index_to_id.push(hit.id.clone());
                database_entries.push(serde_json::json!({
                    "id": idx,
                    "role": hit.payload.role.as_str(),
                    "content": hit.payload.data.to_json(),
                }));
                if Some(&hit.id) == latest_id.as_ref() {
                    update_allowed = true;
                }
            }
        }

        let database = serde_json::to_string(&database_entries)?;
        let new_chat = render_messages(concerned, true);
        let prompt = render_template(
            &self.prompts.update_memory,
            &[
                ("database", database.as_str()),
                ("new_chat_message", &new_chat),
                ("update_allowed", if update_allowed { "True" } else { "False" }),
            ],
        );

        for attempt in 1..=3u32 {
            let response = self
                .chat_model
                .call(&[Message::system("memory_manager", prompt.clone())])
                .await;
            let text = match response {
                Ok(r) => r.text(),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "memory-update model call failed");
                    continue;
                }
            };
            match self.validate_actions(
                &text,
                update_allowed,
                &index_to_id,
                latest_id.as_deref(),
                concerned,
            ) {
                Ok(actions) => return Ok(actions),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "memory actions rejected, retrying");
                }
            }
        }

        tracing::warn!("failed to obtain memory actions after 3 retries, adding directly");
        Ok(concerned
            .iter()
            .map(|m| ExecAction::Add {
                role: m.role,
                content: m.content.clone(),
            })
            .collect())
    }

    /// Maps decoded actions onto records. UPDATE without eligibility downgrades to
    /// ADD; UPDATE of anything but the latest record is rejected.
    fn validate_actions(
        &self,
        text: &str,
        update_allowed: bool,
        index_to_id: &[String],
        latest_id: Option<&str>,
        concerned: &[Message],
    ) -> Result<Vec<ExecAction>, String> {
        let actions = decode_actions(text).map_err(|e| e.to_string())?;
        let mut out = Vec::new();
        for action in actions {
            match action {
                MemoryAction::Add { role, content } => out.push(ExecAction::Add { role, content }),
                MemoryAction::Update { id, role, content } => {
                    if !update_allowed {
                        out.push(ExecAction::Add { role, content });
                        continue;
                    }
                    let record_id = usize::try_from(id)
                        .ok()
                        .and_then(|i| index_to_id.get(i))
                        .ok_or_else(|| format!("update references unknown memory index {}", id))?;
                    if Some(record_id.as_str()) != latest_id {
                        return Err(format!(
                            "update target {} is not the latest memory record",
                            id
                        ));
                    }
                    out.push(ExecAction::Update {
                        record_id: record_id.clone(),
                        role,
                        content,
                    });
                }
            }
        }
        if out.is_empty() && concerned.iter().any(|m| m.content.has_tool_result()) {
            return Err("tool results present but no memory actions returned".to_string());
        }
        Ok(out)
    }

    async fn execute_actions(&mut self, actions: Vec<ExecAction>) -> Result<(), MemoryError> {
        for action in actions {
            let mut attempts = 0u32;
            loop {
                match self.apply_action(&action).await {
                    Ok(()) => break,
                    Err(e) if attempts < 2 => {
                        attempts += 1;
                        tracing::warn!(attempts, error = %e, "memory action failed, retrying");
                    }
                    Err(e) => {
                        return Err(MemoryError::ActionFailed(format!(
                            "after 3 attempts: {}",
                            e
                        )))
                    }
                }
            }
        }
        if self.memory_tokens > self.config.max_memory_len {
            self.summarize_global(None, None).await?;
        }
        Ok(())
    }

    async fn apply_action(&mut self, action: &ExecAction) -> Result<(), MemoryError> {
        match action {
            ExecAction::Add { role, content } => {
                self.add_record_content(content.clone(), *role, "memory_manager", None)
                    .await
            }
            ExecAction::Update {
                record_id,
                role,
                content,
            } => {
                let Some(pos) = self.memory.iter().position(|m| &m.id == record_id) else {
                    tracing::warn!(id = %record_id, "memory record not found for update");
                    return Ok(());
                };
                let embedding = self.embed_content(content).await?;
                let old_tokens = self.count_record(&self.memory[pos]);
                let mut payload = self.memory[pos].payload.clone();
                payload.role = *role;
                payload.data = content.clone();
                payload.last_modified_at = chrono::Utc::now();
                // Store first: a failed update leaves the record list untouched for
                // the per-action retry.
                self.store
                    .update(record_id, embedding.clone(), payload.clone())
                    .await?;
                let mut record = self.memory.remove(pos);
                record.payload = payload;
                record.embedding = Some(embedding);
                let new_tokens = self.count_record(&record);
                // Move to the end to maintain last_modified_at order.
                self.memory.push(record);
                self.memory_tokens = self.memory_tokens.saturating_sub(old_tokens) + new_tokens;
                Ok(())
            }
        }
    }

    async fn embed_content(&self, content: &Content) -> Result<Vec<f32>, MemoryError> {
        let text = content_to_string(content);
        let text = self.truncate_text(&text, self.config.max_embedding_tokens);
        let vectors = self.embedder.embed(&[&text]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Embedding("no vector returned".to_string()).into())
    }

    /// Embeds and stores one record; `index` inserts mid-list, else appends.
    async fn add_record_content(
        &mut self,
        content: Content,
        role: Role,
        name: &str,
        index: Option<usize>,
    ) -> Result<(), MemoryError> {
        let embedding = self.embed_content(&content).await?;
        let record = MemoryRecord::new(content, role, name).with_embedding(embedding.clone());
        self.store
            .insert(vec![StoredVector {
                id: record.id.clone(),
                vector: embedding,
                payload: record.payload.clone(),
            }])
            .await?;
        self.memory_tokens += self.count_record(&record);
        match index {
            Some(i) if i <= self.memory.len() => self.memory.insert(i, record),
            _ => self.memory.push(record),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Direct operations
    // ------------------------------------------------------------------

    /// Adds messages straight to processed memory (single-record ADD per message),
    /// optionally running long-context processing first.
    pub async fn direct_add_memory(
        &mut self,
        msgs: Vec<Message>,
        index: Option<usize>,
        check_long_context: bool,
    ) -> Result<(), MemoryError> {
        let msgs = if check_long_context {
            self.long_context_process(msgs).await?
        } else {
            msgs
        };
        let mut at = index;
        for msg in msgs {
            self.add_record_content(msg.content.clone(), msg.role, &msg.name, at)
                .await?;
            if let Some(i) = at {
                at = Some(i + 1);
            }
        }
        Ok(())
    }

    /// Deletes a record from processed memory and the vector store; chat history is
    /// untouched.
    pub async fn direct_delete_memory(&mut self, id: &str) -> Result<(), MemoryError> {
        match self.memory.iter().position(|m| m.id == id) {
            Some(pos) => {
                let removed = self.memory.remove(pos);
                self.memory_tokens = self
                    .memory_tokens
                    .saturating_sub(self.count_record(&removed));
            }
            None => tracing::warn!(id, "memory record not found to delete"),
        }
        self.store.delete(id).await?;
        Ok(())
    }

    /// Deletes a chat-history entry by message id.
    pub fn direct_delete_chat_history(&mut self, id: &str) {
        match self.chat_history.iter().position(|m| m.id == id) {
            Some(pos) => {
                let removed = self.chat_history.remove(pos);
                self.chat_tokens = self
                    .chat_tokens
                    .saturating_sub(self.count_message(&removed));
            }
            None => tracing::warn!(id, "chat history entry not found to delete"),
        }
    }

    /// Updates a record in place (no reordering), bumping `last_modified_at`.
    pub async fn direct_update(
        &mut self,
        id: &str,
        role: Role,
        new_content: Content,
        embedding: Option<Vec<f32>>,
    ) -> Result<(), MemoryError> {
        let embedding = match embedding {
            Some(e) => e,
            None => self.embed_content(&new_content).await?,
        };
        let Some(pos) = self.memory.iter().position(|m| m.id == id) else {
            tracing::warn!(id, "memory record not found to update");
            return Ok(());
        };
        let old_tokens = self.count_record(&self.memory[pos]);
        self.memory[pos].payload.role = role;
        self.memory[pos].update(new_content, Some(embedding.clone()));
        let new_tokens = self.count_record(&self.memory[pos]);
        self.memory_tokens = self.memory_tokens.saturating_sub(old_tokens) + new_tokens;
        self.store
            .update(id, embedding, self.memory[pos].payload.clone())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Global summarization
    // ------------------------------------------------------------------

    /// Compresses processed memory by `compressed_ratio` (config default when `None`):
    /// records are packed into groups under `max_chat_model_tokens`, each group is
    /// saved to a tracing file and replaced by one summary record inserted at the
    /// position of the last removed record. `filter` defaults to skipping user-role
    /// records.
    pub async fn summarize_global(
        &mut self,
        compressed_ratio: Option<f64>,
        filter: Option<RecordFilter<'_>>,
    ) -> Result<(), MemoryError> {
        let ratio = compressed_ratio.unwrap_or(self.config.compressed_ratio);
        let skip_user = |r: &MemoryRecord| r.payload.role != Role::User;
        let effective: RecordFilter<'_> = match filter {
            Some(f) => f,
            None => &skip_user,
        };
        let records = self.memory.clone();
        let (summaries, remove_ids) = self
            .pack_and_summarize(records, ratio, Some(effective))
            .await?;

        if remove_ids.is_empty() {
            for summary in summaries {
                self.add_record_content(
                    summary.payload.data,
                    summary.payload.role,
                    "memory_manager",
                    None,
                )
                .await?;
            }
            return Ok(());
        }

        let insert_at = remove_ids.last().and_then(|last| {
            self.memory
                .iter()
                .position(|m| &m.id == last)
                .map(|i| i + 1)
        });
        let mut at = insert_at;
        for summary in summaries {
            self.add_record_content(
                summary.payload.data,
                summary.payload.role,
                "memory_manager",
                at,
            )
            .await?;
            if let Some(i) = at {
                at = Some(i + 1);
            }
        }
        for id in &remove_ids {
            self.direct_delete_memory(id).await?;
        }
        tracing::info!(
            records = self.memory.len(),
            tokens = self.memory_tokens,
            "processed memory compacted"
        );
        Ok(())
    }

    /// Summarizes the records with the given ids into new records substituted at the
    /// minimal index among the originals.
    pub async fn summarize_records(&mut self, ids: &[String]) -> Result<(), MemoryError> {
        let mut to_summarize = Vec::new();
        let mut min_index = self.memory.len();
        for id in ids {
            if let Some(pos) = self.memory.iter().position(|m| &m.id == id) {
                to_summarize.push(self.memory[pos].clone());
                min_index = min_index.min(pos);
            }
        }
        if to_summarize.is_empty() {
            return Ok(());
        }
        let (summaries, remove_ids) = self.pack_and_summarize(to_summarize, 1.0, None).await?;
        let mut at = Some(min_index.min(self.memory.len()));
        for summary in summaries {
            self.add_record_content(
                summary.payload.data,
                summary.payload.role,
                "memory_manager",
                at,
            )
            .await?;
            if let Some(i) = at {
                at = Some(i + 1);
            }
        }
        for id in &remove_ids {
            self.direct_delete_memory(id).await?;
        }
        Ok(())
    }

    /// Packs records into groups under `max_chat_model_tokens` and summarizes each,
    /// stopping once the compression budget (`total × ratio`) is spent. Returns the
    /// summary records and the ids to remove. A single record above the chunk limit
    /// is long-context-processed and repacked.
    async fn pack_and_summarize(
        &self,
        mut records: Vec<MemoryRecord>,
        compressed_ratio: f64,
        filter: Option<RecordFilter<'_>>,
    ) -> Result<(Vec<MemoryRecord>, Vec<String>), MemoryError> {
        let mut token_sizes: Vec<usize> = records.iter().map(|r| self.count_record(r)).collect();
        let total: usize = token_sizes.iter().sum();
        let mut budget = (total as f64 * compressed_ratio) as i64;

        let mut group: Vec<MemoryRecord> = Vec::new();
        let mut group_tokens = 0usize;
        let mut summaries = Vec::new();
        let mut remove_ids = Vec::new();
        let mut idx = 0usize;

        while idx < records.len() && budget > 0 {
            if let Some(f) = filter {
                if !f(&records[idx]) {
                    idx += 1;
                    continue;
                }
            }
            let mut size = token_sizes[idx];
            if group_tokens + size > self.config.max_chat_model_tokens {
                if !group.is_empty() {
                    let summary = self.summarize_group(&group).await?;
                    remove_ids.extend(group.iter().map(|r| r.id.clone()));
                    summaries.push(summary);
                    budget -= group_tokens as i64;
                    group.clear();
                    group_tokens = 0;
                } else {
                    tracing::warn!(tokens = size, "single record exceeds the chunk limit");
                    let processed = self
                        .long_context_process(vec![records[idx].to_message()])
                        .await?;
                    if let Some(msg) = processed.into_iter().next() {
                        records[idx].payload.data = msg.content;
                        size = self.count_record(&records[idx]);
                        token_sizes[idx] = size;
                    }
                }
            }
            group.push(records[idx].clone());
            group_tokens += size;
            idx += 1;
        }

        if !group.is_empty() && group_tokens > 0 && budget > 0 {
            let summary = self.summarize_group(&group).await?;
            remove_ids.extend(group.iter().map(|r| r.id.clone()));
            summaries.push(summary);
        }
        Ok((summaries, remove_ids))
    }

    /// Saves the group to a tracing file and produces one summary record (role
    /// system) carrying a source_file block with every referenced path.
    async fn summarize_group(&self, group: &[MemoryRecord]) -> Result<MemoryRecord, MemoryError> {
        let mut files: Vec<String> = group.iter().flat_map(|r| r.source_files()).collect();
        let path = format!("tracing_{}.md", short_id());
        let rendered = render_records(group, false);
        self.save_side_file(&path, &rendered)?;
        files.push(path);
        let summary = self.summarize_sequential(&rendered).await?;
        Ok(MemoryRecord::new(
            Content::Blocks(vec![
                ContentBlock::Text { text: summary },
                ContentBlock::SourceFile { source_file: files },
            ]),
            Role::System,
            "memory_manager",
        ))
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Retrieves memories per `retrieve_type` (instance default when `None`).
    ///
    /// When the filtered list is longer than `recent_n`, the first item is assumed
    /// to hold the root user request and is always kept, followed by the most
    /// recent `recent_n - 1` items.
    pub async fn get_memory(
        &mut self,
        recent_n: Option<usize>,
        filter: Option<MessageFilter<'_>>,
        post_process: Option<PostProcess<'_>>,
        retrieve_type: Option<RetrieveType>,
    ) -> Result<Vec<Message>, MemoryError> {
        let mode = retrieve_type.unwrap_or(self.config.retrieve_type);
        let recent_n = match recent_n {
            Some(n) if n > 0 => n,
            _ => {
                tracing::warn!(
                    fallback = self.config.default_recent_n,
                    "recent_n absent or not positive, using the default"
                );
                self.config.default_recent_n
            }
        };
        let resolved = match mode {
            RetrieveType::Auto => {
                if self.chat_tokens > self.config.max_chat_len {
                    RetrieveType::Processed
                } else {
                    RetrieveType::Source
                }
            }
            other => other,
        };

        if resolved == RetrieveType::Processed
            && self.config.process_with_llm
            && !self.pending_tool_use.is_empty()
        {
            self.flush_pending().await?;
        }

        let messages: Vec<Message> = match resolved {
            RetrieveType::Source | RetrieveType::Auto => self.chat_history.clone(),
            RetrieveType::Processed => {
                if !records_in_time_order(&self.memory) {
                    tracing::warn!("processed memories are not in time order");
                }
                self.memory.iter().map(|r| r.to_message()).collect()
            }
        };

        let mut filtered: Vec<Message> = match filter {
            Some(f) => messages
                .into_iter()
                .enumerate()
                .filter(|(i, m)| f(*i, m))
                .map(|(_, m)| m)
                .collect(),
            None => messages,
        };
        if let Some(pp) = post_process {
            filtered = pp(filtered);
        }

        if recent_n < filtered.len() {
            tracing::debug!(
                recent_n,
                total = filtered.len(),
                "returning the root user request plus the recent tail"
            );
            let mut out = vec![filtered[0].clone()];
            out.extend(filtered[filtered.len() - (recent_n - 1)..].iter().cloned());
            Ok(out)
        } else {
            Ok(filtered)
        }
    }

    /// Processes buffered tool-use messages whose non-tool_use content should be
    /// visible in processed retrieval; leftover tool_use blocks stay buffered.
    async fn flush_pending(&mut self) -> Result<(), MemoryError> {
        let pending = std::mem::take(&mut self.pending_tool_use);
        let mut to_process = Vec::new();
        let mut to_keep = Vec::new();
        for mut msg in pending {
            if msg.content.as_text().is_some() {
                to_process.push(msg);
                continue;
            }
            let blocks = msg.content.clone().into_blocks();
            let (tool_use, other): (Vec<_>, Vec<_>) =
                blocks.into_iter().partition(|b| b.is_tool_use());
            if !other.is_empty() {
                to_process.push(Message::new(
                    msg.name.clone(),
                    msg.role,
                    Content::Blocks(other),
                ));
            }
            if !tool_use.is_empty() {
                msg.content = Content::Blocks(tool_use);
                to_keep.push(msg);
            }
        }
        self.pending_tool_use = to_keep;
        self.process_into_memory(to_process).await
    }

    /// Retrieves the top `top_k` related records per query, merged by unique id and
    /// sorted by `last_modified_at` ascending. A query whose embedding fails is
    /// logged and skipped.
    pub async fn retrieve_from_vector_store(
        &self,
        queries: &[MemoryQuery],
        top_k: usize,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let mut merged: HashMap<String, SearchHit> = HashMap::new();
        for query in queries {
            let search_query = match query {
                MemoryQuery::Embedding(v) => SearchQuery::Vector(v.clone()),
                MemoryQuery::Record(r) => match &r.embedding {
                    Some(e) => SearchQuery::Vector(e.clone()),
                    None => SearchQuery::Text(content_to_string(&r.payload.data)),
                },
                MemoryQuery::Message(m) => SearchQuery::Text(render_message(m)),
                MemoryQuery::Text(s) => SearchQuery::Text(s.clone()),
            };
            let search_query = match search_query {
                SearchQuery::Text(t) => {
                    SearchQuery::Text(self.truncate_text(&t, self.config.max_embedding_tokens))
                }
                vector => vector,
            };
            match self.store.search(search_query, top_k).await {
                Ok(hits) => {
                    for hit in hits {
                        merged.insert(hit.id.clone(), hit);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "retrieval query failed, skipping");
                }
            }
        }
        let mut hits: Vec<SearchHit> = merged.into_values().collect();
        hits.sort_by_key(|h| h.payload.last_modified_at);
        Ok(hits)
    }

    /// Answers `query` from memory: retrieves related records (or reads one side
    /// file under `mount_dir` when `filename` is given), pulls in every referenced
    /// side file, and refines an answer over the combined content with query-aware
    /// sequential summarization.
    pub async fn answer_from_memory(
        &self,
        query: &str,
        filename: Option<&str>,
    ) -> Result<String, MemoryError> {
        let mut contents: Vec<String> = Vec::new();
        let mut files: Vec<String> = Vec::new();
        match filename {
            Some(name) => {
                contents.push(std::fs::read_to_string(self.config.mount_dir.join(name))?);
            }
            None => {
                let hits = self
                    .retrieve_from_vector_store(&[MemoryQuery::Text(query.to_string())], 5)
                    .await?;
                for hit in hits {
                    for block in hit.payload.data.as_blocks() {
                        files.extend(block.source_files().iter().cloned());
                    }
                    contents.push(content_to_string(&hit.payload.data));
                }
            }
        }
        for file in &files {
            match std::fs::read_to_string(self.config.mount_dir.join(file)) {
                Ok(text) => contents.push(text),
                Err(e) => tracing::warn!(file, error = %e, "referenced side file unreadable"),
            }
        }
        let body = contents.join("\n");
        self.save_side_file(&format!("tmp_detail_{}.md", short_id()), &body)?;
        self.summarize_sequential_with_query(&body, query).await
    }

    // ------------------------------------------------------------------
    // Export / import / lifecycle
    // ------------------------------------------------------------------

    /// Serializes the chosen store to pretty JSON.
    pub fn export(&self, kind: StoreKind) -> Result<String, MemoryError> {
        let json = match kind {
            StoreKind::Source => serde_json::to_string_pretty(&self.chat_history)?,
            StoreKind::Processed => serde_json::to_string_pretty(&self.memory)?,
        };
        Ok(json)
    }

    pub fn export_to_file(
        &self,
        path: impl AsRef<std::path::Path>,
        kind: StoreKind,
    ) -> Result<(), MemoryError> {
        std::fs::write(path, self.export(kind)?)?;
        Ok(())
    }

    /// Deserializes into the chosen store, replacing (`overwrite`) or appending.
    /// Token estimates are recomputed for the affected store.
    pub fn load(&mut self, data: &str, kind: StoreKind, overwrite: bool) -> Result<(), MemoryError> {
        match kind {
            StoreKind::Source => {
                let msgs: Vec<Message> = serde_json::from_str(data)?;
                if overwrite {
                    self.chat_history = msgs;
                } else {
                    self.chat_history.extend(msgs);
                }
                self.chat_tokens = self
                    .chat_history
                    .iter()
                    .map(|m| self.count_message(m))
                    .sum();
            }
            StoreKind::Processed => {
                let records: Vec<MemoryRecord> = serde_json::from_str(data)?;
                if overwrite {
                    self.memory = records;
                } else {
                    self.memory.extend(records);
                }
                self.memory_tokens = self.memory.iter().map(|r| self.count_record(r)).sum();
            }
        }
        Ok(())
    }

    pub fn load_from_file(
        &mut self,
        path: impl AsRef<std::path::Path>,
        kind: StoreKind,
        overwrite: bool,
    ) -> Result<(), MemoryError> {
        let data = std::fs::read_to_string(path)?;
        self.load(&data, kind, overwrite)
    }

    /// Clears both stores, the pending buffer, the token estimates, and the vector
    /// store.
    pub async fn clear(&mut self) -> Result<(), MemoryError> {
        self.chat_history.clear();
        self.memory.clear();
        self.pending_tool_use.clear();
        self.chat_tokens = 0;
        self.memory_tokens = 0;
        self.store.reset().await?;
        Ok(())
    }
}
