//! Recursive text splitter: token-bounded chunks with configurable overlap.
//!
//! Splits on a separator hierarchy (paragraph, line, word, character), recursing into
//! finer separators only for pieces that still exceed the chunk size, then merges
//! adjacent pieces into chunks of at most `chunk_size` tokens carrying `chunk_overlap`
//! tokens between neighbours. Token counts come from a pluggable [`TokenCounter`].

use std::sync::Arc;

/// Counts tokens in text. Counts are estimates; the memory manager only requires
/// monotonic accounting, not agreement with the chat model's tokenizer.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Default counter: roughly 4 characters per token, rounded up.
#[derive(Clone, Copy, Debug)]
pub struct HeuristicCounter {
    chars_per_token: usize,
}

impl HeuristicCounter {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for HeuristicCounter {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        let chars = text.chars().count();
        chars.div_ceil(self.chars_per_token)
    }
}

/// Recursive splitter over a separator hierarchy.
pub struct RecursiveTextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
    counter: Arc<dyn TokenCounter>,
}

impl RecursiveTextSplitter {
    /// Creates a splitter with the default separators `["\n\n", "\n", " ", ""]`.
    pub fn new(chunk_size: usize, chunk_overlap: usize, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
            separators: vec!["\n\n".into(), "\n".into(), " ".into(), String::new()],
            counter,
        }
    }

    pub fn with_separators(mut self, separators: Vec<String>) -> Self {
        self.separators = separators;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn count(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Splits `text` into chunks of at most `chunk_size` tokens.
    ///
    /// A piece that cannot be broken further (no finer separator left) is emitted
    /// as-is even when it exceeds the chunk size.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        if self.count(text) <= self.chunk_size {
            return vec![text.to_string()];
        }
        let (separator, rest) = match separators.split_first() {
            Some((sep, rest)) => (sep.clone(), rest),
            None => return vec![text.to_string()],
        };

        let pieces = split_keeping_separator(text, &separator);

        let mut good: Vec<String> = Vec::new();
        for piece in pieces {
            if self.count(&piece) > self.chunk_size && !rest.is_empty() {
                good.extend(self.split_recursive(&piece, rest));
            } else {
                good.push(piece);
            }
        }
        self.merge_pieces(good)
    }

    /// Greedily packs pieces into chunks, carrying an overlap tail between neighbours.
    fn merge_pieces(&self, pieces: Vec<String>) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;

        for piece in pieces {
            let piece_tokens = self.count(&piece);
            if current_tokens + piece_tokens > self.chunk_size && !current.is_empty() {
                chunks.push(current.concat());
                // Keep a tail of at most chunk_overlap tokens for the next chunk.
                while !current.is_empty()
                    && (current_tokens > self.chunk_overlap
                        || current_tokens + piece_tokens > self.chunk_size)
                {
                    let removed = current.remove(0);
                    current_tokens = current_tokens.saturating_sub(self.count(&removed));
                }
            }
            current.push(piece);
            current_tokens += piece_tokens;
        }
        if !current.is_empty() {
            chunks.push(current.concat());
        }
        chunks.retain(|c| !c.is_empty());
        chunks
    }
}

/// Splits text by `separator`, keeping the separator attached to the preceding piece so
/// concatenating the pieces reproduces the input. Empty separator splits into characters.
fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(|c| c.to_string()).collect();
    }
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(separator) {
        let end = pos + separator.len();
        pieces.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces.retain(|p| !p.is_empty());
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(chunk_size: usize, overlap: usize) -> RecursiveTextSplitter {
        // 1 char per token makes chunk sizes exact in tests.
        RecursiveTextSplitter::new(chunk_size, overlap, Arc::new(HeuristicCounter::new(1)))
    }

    #[test]
    fn short_text_is_one_chunk() {
        let s = splitter(100, 10);
        let chunks = s.split_text("hello world");
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let s = splitter(100, 10);
        assert!(s.split_text("").is_empty());
    }

    #[test]
    fn chunks_respect_size_limit() {
        let s = splitter(20, 0);
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let chunks = s.split_text(text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20, "oversized chunk: {:?}", chunk);
        }
    }

    #[test]
    fn no_content_is_lost_without_overlap() {
        let s = splitter(16, 0);
        let text = "one two three four five six seven eight nine ten";
        let chunks = s.split_text(text);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn overlap_repeats_tail_tokens() {
        let s = splitter(20, 8);
        let text = "aaaa bbbb cccc dddd eeee ffff gggg";
        let chunks = s.split_text(text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(5).collect::<String>();
            let tail: String = tail.chars().rev().collect();
            assert!(
                pair[1].contains(tail.trim()) || tail.trim().is_empty(),
                "chunk {:?} does not carry overlap from {:?}",
                pair[1],
                pair[0]
            );
        }
    }

    #[test]
    fn paragraphs_split_before_words() {
        let s = splitter(12, 0);
        let text = "first para\n\nsecond para";
        let chunks = s.split_text(text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("first para"));
        assert_eq!(chunks[1], "second para");
    }

    #[test]
    fn unbreakable_piece_is_emitted_as_is() {
        let s = RecursiveTextSplitter::new(4, 0, Arc::new(HeuristicCounter::new(1)))
            .with_separators(vec![" ".into()]);
        let chunks = s.split_text("abcdefghij");
        assert_eq!(chunks, vec!["abcdefghij".to_string()]);
    }

    #[test]
    fn heuristic_counter_rounds_up() {
        let c = HeuristicCounter::default();
        assert_eq!(c.count(""), 0);
        assert_eq!(c.count("abc"), 1);
        assert_eq!(c.count("abcde"), 2);
    }
}
