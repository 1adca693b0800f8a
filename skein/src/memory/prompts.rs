//! Prompt templates for memory update and summarization.
//!
//! Defaults are embedded as YAML and parsed at construction; callers can load
//! overrides from a file. Templates use `{{placeholder}}` substitution.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_PROMPTS_YAML: &str = include_str!("default_prompts.yaml");

#[derive(Debug, Error)]
pub enum PromptsError {
    #[error("read prompts file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse prompts yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The three templates the memory manager drives its chat model with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryPrompts {
    /// Placeholders: `{{database}}`, `{{new_chat_message}}`, `{{update_allowed}}`.
    pub update_memory: String,
    /// Placeholders: `{{chunk_idx}}`, `{{total_chunks}}`, `{{log_excerpt}}`,
    /// `{{previous_summary}}`.
    pub summarize_log: String,
    /// Placeholders: `{{chunk_idx}}`, `{{total_chunks}}`, `{{chunk}}`,
    /// `{{existing_notes}}`, `{{question}}`.
    pub summarize_log_with_query: String,
}

impl Default for MemoryPrompts {
    fn default() -> Self {
        serde_yaml::from_str(DEFAULT_PROMPTS_YAML)
            .unwrap_or_else(|e| panic!("embedded default_prompts.yaml is invalid: {}", e))
    }
}

impl MemoryPrompts {
    /// Loads prompts from a YAML file with the same three keys as the default.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, PromptsError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Loads from the file when it exists, else returns the embedded defaults.
    pub fn load_or_default(path: impl AsRef<std::path::Path>) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

/// Substitutes every `{{key}}` occurrence with its value.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_and_carry_placeholders() {
        let prompts = MemoryPrompts::default();
        assert!(prompts.update_memory.contains("{{database}}"));
        assert!(prompts.update_memory.contains("{{new_chat_message}}"));
        assert!(prompts.update_memory.contains("{{update_allowed}}"));
        assert!(prompts.summarize_log.contains("{{log_excerpt}}"));
        assert!(prompts.summarize_log.contains("{{previous_summary}}"));
        assert!(prompts.summarize_log_with_query.contains("{{question}}"));
        assert!(prompts.summarize_log_with_query.contains("{{existing_notes}}"));
    }

    #[test]
    fn render_replaces_all_occurrences() {
        let out = render_template("{{a}} and {{a}} then {{b}}", &[("a", "x"), ("b", "y")]);
        assert_eq!(out, "x and x then y");
    }

    #[test]
    fn load_or_default_falls_back_for_missing_file() {
        let prompts = MemoryPrompts::load_or_default("/nonexistent/prompts.yaml");
        assert!(prompts.update_memory.contains("{{database}}"));
    }

    #[test]
    fn load_reads_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.yaml");
        std::fs::write(
            &path,
            "update_memory: \"u {{database}}\"\nsummarize_log: \"s\"\nsummarize_log_with_query: \"q\"\n",
        )
        .unwrap();
        let prompts = MemoryPrompts::load(&path).unwrap();
        assert_eq!(prompts.update_memory, "u {{database}}");
    }
}
