//! Chat model gateway used by the memory manager and agents.
//!
//! [`ChatModel`] is a single `call(messages)` seam returning a full assistant message;
//! `call_stream()` additionally accepts an optional `Sender<MessageChunk>` and emits
//! partial content as it arrives. Implementations that cannot stream fall back to the
//! default implementation that sends the whole content as one chunk.

mod mock;
mod openai;

pub use mock::MockChat;
pub use openai::ChatOpenAI;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::Message;

/// Errors from chat or embedding model calls.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model call error: {0}")]
    Call(String),
    #[error("empty response from model")]
    EmptyResponse,
}

/// Token usage for one model call (prompt + completion).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One partial content fragment emitted while streaming.
#[derive(Clone, Debug)]
pub struct MessageChunk {
    pub content: String,
}

/// Full response from a chat completion: the assistant message and optional usage.
#[derive(Clone, Debug)]
pub struct ChatResponse {
    pub message: Message,
    pub usage: Option<ChatUsage>,
}

impl ChatResponse {
    /// The response text, empty when the message carries no plain text.
    pub fn text(&self) -> String {
        match self.message.content.as_text() {
            Some(s) => s.to_string(),
            None => self
                .message
                .content
                .as_blocks()
                .iter()
                .filter_map(|b| match b {
                    crate::message::ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Chat model: given messages, returns a complete assistant message.
///
/// The memory manager drives its update prompt and summarization loops through this
/// trait; swap in [`MockChat`] for tests and [`ChatOpenAI`] for OpenAI-compatible APIs.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// One whole completion.
    async fn call(&self, messages: &[Message]) -> Result<ChatResponse, ModelError>;

    /// Streaming variant: when `chunk_tx` is `Some`, implementations send content
    /// fragments through the channel as they arrive and still return the complete
    /// response at the end. Default sends the full content as a single chunk.
    async fn call_stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<ChatResponse, ModelError> {
        let response = self.call(messages).await?;
        if let Some(tx) = chunk_tx {
            let content = response.text();
            if !content.is_empty() {
                let _ = tx.send(MessageChunk { content }).await;
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    struct StubModel {
        content: String,
    }

    #[async_trait]
    impl ChatModel for StubModel {
        async fn call(&self, _messages: &[Message]) -> Result<ChatResponse, ModelError> {
            Ok(ChatResponse {
                message: Message::assistant("stub", self.content.clone()),
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn default_call_stream_sends_single_chunk() {
        let model = StubModel {
            content: "hello".into(),
        };
        let (tx, mut rx) = mpsc::channel(2);
        let resp = model.call_stream(&[], Some(tx)).await.unwrap();
        assert_eq!(resp.text(), "hello");
        assert_eq!(resp.message.role, Role::Assistant);
        let chunk = rx.recv().await.expect("one chunk");
        assert_eq!(chunk.content, "hello");
    }

    #[tokio::test]
    async fn default_call_stream_skips_chunk_for_empty_content() {
        let model = StubModel {
            content: String::new(),
        };
        let (tx, mut rx) = mpsc::channel(2);
        let resp = model.call_stream(&[], Some(tx)).await.unwrap();
        assert!(resp.text().is_empty());
        assert!(rx.try_recv().is_err());
    }
}
