//! Mock chat model for tests: scripted replies in order, then the last reply repeats.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChatModel, ChatResponse, ModelError};
use crate::message::Message;

/// Scripted chat model. Pops replies front-to-back; once the script is exhausted the
/// final reply repeats, so summarization loops of unknown length stay deterministic.
pub struct MockChat {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: AtomicUsize,
}

impl MockChat {
    /// A mock that always returns `reply`.
    pub fn with_reply(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self {
            replies: Mutex::new(VecDeque::new()),
            last: Mutex::new(reply),
            calls: AtomicUsize::new(0),
        }
    }

    /// A mock that returns `replies` in order, then repeats the last entry.
    pub fn with_replies(replies: Vec<String>) -> Self {
        let last = replies.last().cloned().unwrap_or_default();
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `call` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for MockChat {
    async fn call(&self, _messages: &[Message]) -> Result<ChatResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = {
            let mut queue = self.replies.lock().map_err(|_| {
                ModelError::Call("mock reply queue poisoned".to_string())
            })?;
            match queue.pop_front() {
                Some(r) => r,
                None => self
                    .last
                    .lock()
                    .map_err(|_| ModelError::Call("mock reply queue poisoned".to_string()))?
                    .clone(),
            }
        };
        Ok(ChatResponse {
            message: Message::assistant("mock", reply),
            usage: None,
        })
    }
}
