//! Tasks, metrics, and solution outputs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::error::EvalError;
use crate::message::ContentBlock;

/// How a metric's result aggregates: a category label or a number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Category,
    Numerical,
}

/// A metric result value: string for CATEGORY metrics, number for NUMERICAL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Category(String),
}

impl MetricValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Category(_) => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            MetricValue::Category(s) => Some(s),
            MetricValue::Number(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(n: f64) -> Self {
        MetricValue::Number(n)
    }
}

impl From<&str> for MetricValue {
    fn from(s: &str) -> Self {
        MetricValue::Category(s.to_string())
    }
}

/// The persisted outcome of running one metric against one solution output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricResult {
    pub name: String,
    pub result: MetricValue,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, JsonValue>>,
}

impl MetricResult {
    pub fn new(name: impl Into<String>, result: impl Into<MetricValue>) -> Self {
        Self {
            name: name.into(),
            result: result.into(),
            created_at: Utc::now(),
            message: None,
            metadata: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// One evaluation metric: named, typed, and an evaluation function over
/// [`SolutionOutput`].
#[async_trait]
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    fn metric_type(&self) -> MetricType;

    fn description(&self) -> &str {
        ""
    }

    /// Candidate categories for CATEGORY metrics; `None` for numerical ones.
    fn categories(&self) -> Option<&[String]> {
        None
    }

    async fn evaluate(&self, solution: &SolutionOutput) -> Result<MetricResult, EvalError>;
}

/// What a solution function returns for one (task, repeat) unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolutionOutput {
    pub success: bool,
    pub output: JsonValue,
    /// Ordered tool_use/tool_result/text blocks tracing the agent's run.
    #[serde(default)]
    pub trajectory: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, JsonValue>>,
}

impl SolutionOutput {
    pub fn new(success: bool, output: JsonValue) -> Self {
        Self {
            success,
            output,
            trajectory: Vec::new(),
            meta: None,
        }
    }

    pub fn with_trajectory(mut self, trajectory: Vec<ContentBlock>) -> Self {
        self.trajectory = trajectory;
        self
    }
}

/// One item in a benchmark: input, ground truth, metrics, optional tags.
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub input: JsonValue,
    pub ground_truth: JsonValue,
    pub metrics: Vec<Arc<dyn Metric>>,
    pub tags: Option<HashMap<String, String>>,
    pub metadata: Option<serde_json::Map<String, JsonValue>>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        input: JsonValue,
        ground_truth: JsonValue,
        metrics: Vec<Arc<dyn Metric>>,
    ) -> Self {
        Self {
            id: id.into(),
            input,
            ground_truth,
            metrics,
            tags: None,
            metadata: None,
        }
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Runs every metric of this task against the solution.
    pub async fn evaluate(
        &self,
        solution: &SolutionOutput,
    ) -> Result<Vec<MetricResult>, EvalError> {
        let mut results = Vec::with_capacity(self.metrics.len());
        for metric in &self.metrics {
            results.push(metric.evaluate(solution).await?);
        }
        Ok(results)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("input", &self.input)
            .field(
                "metrics",
                &self.metrics.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PassFail;

    #[async_trait]
    impl Metric for PassFail {
        fn name(&self) -> &str {
            "pass_fail"
        }

        fn metric_type(&self) -> MetricType {
            MetricType::Category
        }

        async fn evaluate(&self, solution: &SolutionOutput) -> Result<MetricResult, EvalError> {
            let label = if solution.success { "pass" } else { "fail" };
            Ok(MetricResult::new(self.name(), label))
        }
    }

    #[tokio::test]
    async fn task_evaluate_runs_every_metric() {
        let task = Task::new(
            "t1",
            serde_json::json!("2+2"),
            serde_json::json!({"answer": "4"}),
            vec![Arc::new(PassFail)],
        );
        let output = SolutionOutput::new(true, serde_json::json!({"answer": "4"}));
        let results = task.evaluate(&output).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result.as_category(), Some("pass"));
    }

    #[test]
    fn metric_value_serializes_untagged() {
        let n = serde_json::to_value(MetricValue::Number(0.5)).unwrap();
        assert_eq!(n, serde_json::json!(0.5));
        let c = serde_json::to_value(MetricValue::Category("pass".into())).unwrap();
        assert_eq!(c, serde_json::json!("pass"));
    }

    #[test]
    fn solution_output_roundtrip() {
        let output = SolutionOutput::new(true, serde_json::json!({"answer": "4"}));
        let json = serde_json::to_string(&output).unwrap();
        let back: SolutionOutput = serde_json::from_str(&json).unwrap();
        assert!(back.success);
        assert!(back.trajectory.is_empty());
    }
}
