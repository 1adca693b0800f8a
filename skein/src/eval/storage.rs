//! Evaluator storage: resumable persistence for solution outputs, metric results,
//! aggregation, and agent console logs.
//!
//! The file layout, shared by every worker:
//!
//! ```text
//! <root>/evaluation_meta.json
//! <root>/evaluation_result.json
//! <root>/<repeat_id>/<task_id>/solution.json
//! <root>/<repeat_id>/<task_id>/evaluation/<metric_name>.json
//! <root>/<repeat_id>/<task_id>/logging.txt
//! ```
//!
//! Existence means a non-empty file; distinct (task, repeat, metric) keys give
//! workers lock-freedom, and the existence checks are the cross-worker dedup point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::error::EvalError;
use super::task::{MetricResult, SolutionOutput};
use crate::message::{ContentBlock, Message};

const SOLUTION_FILE: &str = "solution.json";
const EVALUATION_DIR: &str = "evaluation";
const EVALUATION_RESULT_FILE: &str = "evaluation_result.json";
const EVALUATION_META_FILE: &str = "evaluation_meta.json";
const AGENT_LOG_FILE: &str = "logging.txt";

/// Hook handed to the solution: `(message, last)`. When `last` is true the message's
/// textual rendering is appended to the unit's log file.
pub type PrePrintHook = Arc<dyn Fn(&Message, bool) + Send + Sync>;

/// Persistence contract for the evaluation driver.
pub trait EvaluatorStorage: Send + Sync {
    fn save_solution_result(
        &self,
        task_id: &str,
        repeat_id: &str,
        output: &SolutionOutput,
    ) -> Result<(), EvalError>;

    fn get_solution_result(&self, task_id: &str, repeat_id: &str)
        -> Result<SolutionOutput, EvalError>;

    fn solution_result_exists(&self, task_id: &str, repeat_id: &str) -> bool;

    fn save_evaluation_result(
        &self,
        task_id: &str,
        repeat_id: &str,
        result: &MetricResult,
    ) -> Result<(), EvalError>;

    fn get_evaluation_result(
        &self,
        task_id: &str,
        repeat_id: &str,
        metric_name: &str,
    ) -> Result<MetricResult, EvalError>;

    fn evaluation_result_exists(&self, task_id: &str, repeat_id: &str, metric_name: &str) -> bool;

    fn save_aggregation_result(&self, report: &JsonValue) -> Result<(), EvalError>;

    fn aggregation_result_exists(&self) -> bool;

    fn save_evaluation_meta(&self, meta: &JsonValue) -> Result<(), EvalError>;

    /// Hook appending the agent's final-frame messages to the unit's log file.
    fn agent_pre_print_hook(&self, task_id: &str, repeat_id: &str) -> PrePrintHook;
}

/// Renders one message's blocks to the log line format: text and thinking blocks get
/// a `name:` prefix, anything else is pretty JSON (prefixed only when it leads).
fn format_log_lines(msg: &Message) -> Vec<String> {
    let mut lines = Vec::new();
    let blocks = match &msg.content {
        crate::message::Content::Text(text) => {
            lines.push(format!("{}: {}", msg.name, text));
            return lines;
        }
        crate::message::Content::Blocks(blocks) => blocks,
    };
    for block in blocks {
        match block {
            ContentBlock::Text { text } => lines.push(format!("{}: {}", msg.name, text)),
            ContentBlock::Thinking { thinking } => {
                lines.push(format!("{} (thinking): {}", msg.name, thinking))
            }
            other => {
                let rendered = serde_json::to_string_pretty(other)
                    .unwrap_or_else(|_| "<unprintable block>".to_string());
                if lines.is_empty() {
                    lines.push(format!("{}: {}", msg.name, rendered));
                } else {
                    lines.push(rendered);
                }
            }
        }
    }
    lines
}

/// File-system backed [`EvaluatorStorage`].
pub struct FileEvaluatorStorage {
    root: PathBuf,
}

impl FileEvaluatorStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unit_dir(&self, task_id: &str, repeat_id: &str) -> PathBuf {
        self.root.join(repeat_id).join(task_id)
    }

    fn solution_path(&self, task_id: &str, repeat_id: &str) -> PathBuf {
        self.unit_dir(task_id, repeat_id).join(SOLUTION_FILE)
    }

    fn evaluation_path(&self, task_id: &str, repeat_id: &str, metric_name: &str) -> PathBuf {
        self.unit_dir(task_id, repeat_id)
            .join(EVALUATION_DIR)
            .join(format!("{}.json", metric_name))
    }

    fn write_json(path: &Path, value: &JsonValue) -> Result<(), EvalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    fn non_empty(path: &Path) -> bool {
        std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
    }
}

impl EvaluatorStorage for FileEvaluatorStorage {
    fn save_solution_result(
        &self,
        task_id: &str,
        repeat_id: &str,
        output: &SolutionOutput,
    ) -> Result<(), EvalError> {
        let value = serde_json::to_value(output)?;
        Self::write_json(&self.solution_path(task_id, repeat_id), &value)
    }

    fn get_solution_result(
        &self,
        task_id: &str,
        repeat_id: &str,
    ) -> Result<SolutionOutput, EvalError> {
        let path = self.solution_path(task_id, repeat_id);
        if !path.exists() {
            return Err(EvalError::NotFound(format!(
                "solution result for task {} repeat {}",
                task_id, repeat_id
            )));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn solution_result_exists(&self, task_id: &str, repeat_id: &str) -> bool {
        Self::non_empty(&self.solution_path(task_id, repeat_id))
    }

    fn save_evaluation_result(
        &self,
        task_id: &str,
        repeat_id: &str,
        result: &MetricResult,
    ) -> Result<(), EvalError> {
        let value = serde_json::to_value(result)?;
        Self::write_json(&self.evaluation_path(task_id, repeat_id, &result.name), &value)
    }

    fn get_evaluation_result(
        &self,
        task_id: &str,
        repeat_id: &str,
        metric_name: &str,
    ) -> Result<MetricResult, EvalError> {
        let path = self.evaluation_path(task_id, repeat_id, metric_name);
        if !path.exists() {
            return Err(EvalError::NotFound(format!(
                "evaluation result {} for task {} repeat {}",
                metric_name, task_id, repeat_id
            )));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn evaluation_result_exists(&self, task_id: &str, repeat_id: &str, metric_name: &str) -> bool {
        Self::non_empty(&self.evaluation_path(task_id, repeat_id, metric_name))
    }

    fn save_aggregation_result(&self, report: &JsonValue) -> Result<(), EvalError> {
        Self::write_json(&self.root.join(EVALUATION_RESULT_FILE), report)
    }

    fn aggregation_result_exists(&self) -> bool {
        Self::non_empty(&self.root.join(EVALUATION_RESULT_FILE))
    }

    fn save_evaluation_meta(&self, meta: &JsonValue) -> Result<(), EvalError> {
        Self::write_json(&self.root.join(EVALUATION_META_FILE), meta)
    }

    fn agent_pre_print_hook(&self, task_id: &str, repeat_id: &str) -> PrePrintHook {
        let log_path = self.unit_dir(task_id, repeat_id).join(AGENT_LOG_FILE);
        Arc::new(move |msg: &Message, last: bool| {
            if !last {
                return;
            }
            let lines = format_log_lines(msg);
            if lines.is_empty() {
                return;
            }
            if let Some(parent) = log_path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!(error = %e, "failed to create agent log directory");
                    return;
                }
            }
            use std::io::Write;
            let appended = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .and_then(|mut f| writeln!(f, "{}", lines.join("\n")));
            if let Err(e) = appended {
                tracing::warn!(error = %e, "failed to append agent log");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::task::MetricValue;

    fn storage() -> (tempfile::TempDir, FileEvaluatorStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileEvaluatorStorage::new(dir.path());
        (dir, storage)
    }

    #[test]
    fn solution_roundtrip_and_layout() {
        let (dir, storage) = storage();
        let output = SolutionOutput::new(true, serde_json::json!({"answer": "4"}));
        storage.save_solution_result("t1", "0", &output).unwrap();

        assert!(storage.solution_result_exists("t1", "0"));
        assert!(!storage.solution_result_exists("t1", "1"));
        assert!(dir.path().join("0").join("t1").join("solution.json").exists());

        let back = storage.get_solution_result("t1", "0").unwrap();
        assert!(back.success);
        assert_eq!(back.output, serde_json::json!({"answer": "4"}));
    }

    #[test]
    fn evaluation_result_roundtrip_and_layout() {
        let (dir, storage) = storage();
        let result = MetricResult::new("accuracy", 1.0);
        storage.save_evaluation_result("t1", "0", &result).unwrap();

        assert!(storage.evaluation_result_exists("t1", "0", "accuracy"));
        assert!(!storage.evaluation_result_exists("t1", "0", "other"));
        assert!(dir
            .path()
            .join("0")
            .join("t1")
            .join("evaluation")
            .join("accuracy.json")
            .exists());

        let back = storage.get_evaluation_result("t1", "0", "accuracy").unwrap();
        assert_eq!(back.result, MetricValue::Number(1.0));
    }

    #[test]
    fn missing_results_are_not_found() {
        let (_dir, storage) = storage();
        assert!(matches!(
            storage.get_solution_result("t1", "0"),
            Err(EvalError::NotFound(_))
        ));
        assert!(matches!(
            storage.get_evaluation_result("t1", "0", "m"),
            Err(EvalError::NotFound(_))
        ));
    }

    #[test]
    fn pre_print_hook_appends_only_last_frames() {
        let (dir, storage) = storage();
        let hook = storage.agent_pre_print_hook("t1", "0");
        let msg = Message::assistant("agent", "final answer");
        hook(&msg, false);
        let log_path = dir.path().join("0").join("t1").join("logging.txt");
        assert!(!log_path.exists());

        hook(&msg, true);
        hook(&msg, true);
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content, "agent: final answer\nagent: final answer\n");
    }

    #[test]
    fn pre_print_hook_formats_thinking_and_tool_blocks() {
        let (dir, storage) = storage();
        let hook = storage.agent_pre_print_hook("t1", "0");
        let msg = Message::assistant(
            "agent",
            vec![
                ContentBlock::Thinking {
                    thinking: "planning".into(),
                },
                ContentBlock::ToolUse {
                    id: "u1".into(),
                    name: "search".into(),
                    input: serde_json::json!({}),
                },
            ],
        );
        hook(&msg, true);
        let content =
            std::fs::read_to_string(dir.path().join("0").join("t1").join("logging.txt")).unwrap();
        assert!(content.starts_with("agent (thinking): planning\n"));
        assert!(content.contains("tool_use"));
    }

    #[test]
    fn aggregation_and_meta_land_at_the_root() {
        let (dir, storage) = storage();
        storage
            .save_aggregation_result(&serde_json::json!({"total_tasks": 1}))
            .unwrap();
        storage
            .save_evaluation_meta(&serde_json::json!({"evaluation_name": "demo"}))
            .unwrap();
        assert!(storage.aggregation_result_exists());
        assert!(dir.path().join("evaluation_result.json").exists());
        assert!(dir.path().join("evaluation_meta.json").exists());
    }
}
