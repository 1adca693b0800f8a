//! Run a tiny benchmark end to end with the serial evaluator.
//!
//! ```bash
//! cargo run -p skein --example eval_quickstart
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use skein::eval::{
    solution_fn, EvalError, Evaluator, FileEvaluatorStorage, Metric, MetricResult, MetricType,
    SerialEvaluator, SolutionOutput, Task, VecBenchmark,
};

struct ExactMatch {
    expected: serde_json::Value,
}

#[async_trait]
impl Metric for ExactMatch {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn metric_type(&self) -> MetricType {
        MetricType::Numerical
    }

    async fn evaluate(&self, solution: &SolutionOutput) -> Result<MetricResult, EvalError> {
        let score = if solution.output == self.expected { 1.0 } else { 0.0 };
        Ok(MetricResult::new(self.name(), score))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let tasks = vec![
        Task::new(
            "add",
            json!("2+2"),
            json!({"answer": "4"}),
            vec![Arc::new(ExactMatch {
                expected: json!({"answer": "4"}),
            })],
        ),
        Task::new(
            "mul",
            json!("3*3"),
            json!({"answer": "9"}),
            vec![Arc::new(ExactMatch {
                expected: json!({"answer": "9"}),
            })],
        ),
    ];
    let benchmark = Arc::new(VecBenchmark::new("arithmetic", "toy benchmark", tasks));
    let storage = Arc::new(FileEvaluatorStorage::new("./eval-results"));
    let evaluator = SerialEvaluator::new("quickstart", benchmark, 2, storage)?;

    // A real solution would run an agent here; this one just echoes ground truth.
    let solution = solution_fn(|task: Task, _hook| async move {
        Ok(SolutionOutput::new(true, task.ground_truth.clone()))
    });
    evaluator.run(solution).await?;

    let report = evaluator.aggregate()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
