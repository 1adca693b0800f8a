//! Evaluation drivers: iterate benchmark × repeats, run the solution and metrics,
//! persist everything, aggregate.
//!
//! Two interchangeable strategies behind the [`Evaluator`] contract: a serial loop
//! for debugging and a bounded worker pool. Units are keyed (task, repeat); the
//! storage existence checks are the resume and cross-worker dedup point, so a failed
//! unit is simply left incomplete and shows up as such in aggregation.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::aggregate::aggregate;
use super::benchmark::{benchmark_tasks, Benchmark};
use super::error::EvalError;
use super::storage::{EvaluatorStorage, PrePrintHook};
use super::task::{SolutionOutput, Task};

/// Caller-supplied solution: runs one task and returns its output.
#[async_trait]
pub trait Solution: Send + Sync {
    async fn solve(&self, task: Task, hook: PrePrintHook) -> Result<SolutionOutput, EvalError>;
}

/// Adapter implementing [`Solution`] for plain async closures.
pub struct FnSolution<F>(pub F);

#[async_trait]
impl<F, Fut> Solution for FnSolution<F>
where
    F: Fn(Task, PrePrintHook) -> Fut + Send + Sync,
    Fut: Future<Output = Result<SolutionOutput, EvalError>> + Send,
{
    async fn solve(&self, task: Task, hook: PrePrintHook) -> Result<SolutionOutput, EvalError> {
        (self.0)(task, hook).await
    }
}

/// Wraps an async closure as an `Arc<dyn Solution>`.
pub fn solution_fn<F, Fut>(f: F) -> Arc<dyn Solution>
where
    F: Fn(Task, PrePrintHook) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SolutionOutput, EvalError>> + Send + 'static,
{
    Arc::new(FnSolution(f))
}

/// The driver contract: run every (task, repeat) unit, then aggregate.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn run(&self, solution: Arc<dyn Solution>) -> Result<(), EvalError>;
}

fn validate(benchmark: &dyn Benchmark, n_repeat: usize) -> Result<(), EvalError> {
    if benchmark.is_empty() {
        return Err(EvalError::InvalidArgument("benchmark is empty".into()));
    }
    if n_repeat == 0 {
        return Err(EvalError::InvalidArgument("n_repeat must be at least 1".into()));
    }
    Ok(())
}

fn evaluation_meta(name: &str, benchmark: &dyn Benchmark, n_repeat: usize) -> serde_json::Value {
    json!({
        "evaluation_name": name,
        "created_at": Utc::now().to_rfc3339(),
        "total_repeats": n_repeat,
        "benchmark": {
            "name": benchmark.name(),
            "description": benchmark.description(),
            "total_tasks": benchmark.len(),
        },
        "schema_version": 1,
    })
}

/// Runs one (task, repeat) unit: load-or-solve the solution, then run every metric
/// without a stored result. Failures mark the unit (or the metric) incomplete and
/// never propagate.
async fn run_unit(
    task: Task,
    repeat_id: String,
    storage: Arc<dyn EvaluatorStorage>,
    solution: Arc<dyn Solution>,
) {
    let solution_output = if storage.solution_result_exists(&task.id, &repeat_id) {
        match storage.get_solution_result(&task.id, &repeat_id) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(task = %task.id, repeat = %repeat_id, error = %e,
                    "stored solution unreadable, unit left incomplete");
                return;
            }
        }
    } else {
        let hook = storage.agent_pre_print_hook(&task.id, &repeat_id);
        match solution.solve(task.clone(), hook).await {
            Ok(output) => {
                if let Err(e) = storage.save_solution_result(&task.id, &repeat_id, &output) {
                    tracing::warn!(task = %task.id, repeat = %repeat_id, error = %e,
                        "failed to persist solution output");
                    return;
                }
                output
            }
            Err(e) => {
                tracing::warn!(task = %task.id, repeat = %repeat_id, error = %e,
                    "solution failed, unit left incomplete");
                return;
            }
        }
    };

    for metric in &task.metrics {
        if storage.evaluation_result_exists(&task.id, &repeat_id, metric.name()) {
            continue;
        }
        match metric.evaluate(&solution_output).await {
            Ok(result) => {
                if let Err(e) = storage.save_evaluation_result(&task.id, &repeat_id, &result) {
                    tracing::warn!(task = %task.id, repeat = %repeat_id,
                        metric = metric.name(), error = %e,
                        "failed to persist metric result");
                }
            }
            Err(e) => {
                tracing::warn!(task = %task.id, repeat = %repeat_id,
                    metric = metric.name(), error = %e,
                    "metric failed, left incomplete");
            }
        }
    }
}

/// Straightforward serial loop over every (task, repeat) unit. Used for debugging.
pub struct SerialEvaluator {
    name: String,
    benchmark: Arc<dyn Benchmark>,
    n_repeat: usize,
    storage: Arc<dyn EvaluatorStorage>,
}

impl std::fmt::Debug for SerialEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialEvaluator")
            .field("name", &self.name)
            .field("n_repeat", &self.n_repeat)
            .finish()
    }
}

impl SerialEvaluator {
    pub fn new(
        name: impl Into<String>,
        benchmark: Arc<dyn Benchmark>,
        n_repeat: usize,
        storage: Arc<dyn EvaluatorStorage>,
    ) -> Result<Self, EvalError> {
        validate(&*benchmark, n_repeat)?;
        Ok(Self {
            name: name.into(),
            benchmark,
            n_repeat,
            storage,
        })
    }

    /// Recomputes and persists the aggregate report from storage.
    pub fn aggregate(&self) -> Result<serde_json::Value, EvalError> {
        aggregate(&*self.benchmark, self.n_repeat, &*self.storage)
    }
}

#[async_trait]
impl Evaluator for SerialEvaluator {
    async fn run(&self, solution: Arc<dyn Solution>) -> Result<(), EvalError> {
        self.storage
            .save_evaluation_meta(&evaluation_meta(&self.name, &*self.benchmark, self.n_repeat))?;
        for repeat_index in 0..self.n_repeat {
            for task in benchmark_tasks(&*self.benchmark) {
                run_unit(
                    task,
                    repeat_index.to_string(),
                    self.storage.clone(),
                    solution.clone(),
                )
                .await;
            }
        }
        self.aggregate()?;
        Ok(())
    }
}

/// Worker pool: (task, repeat) units run on up to `n_workers` concurrent tasks.
/// Units are side-effect-isolated through the storage; a panicking or failing unit
/// never aborts the others. Aggregation runs only after every unit has finished.
pub struct ParallelEvaluator {
    name: String,
    benchmark: Arc<dyn Benchmark>,
    n_repeat: usize,
    storage: Arc<dyn EvaluatorStorage>,
    n_workers: usize,
}

impl std::fmt::Debug for ParallelEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelEvaluator")
            .field("name", &self.name)
            .field("n_repeat", &self.n_repeat)
            .field("n_workers", &self.n_workers)
            .finish()
    }
}

impl ParallelEvaluator {
    pub fn new(
        name: impl Into<String>,
        benchmark: Arc<dyn Benchmark>,
        n_repeat: usize,
        storage: Arc<dyn EvaluatorStorage>,
        n_workers: usize,
    ) -> Result<Self, EvalError> {
        validate(&*benchmark, n_repeat)?;
        if n_workers == 0 {
            return Err(EvalError::InvalidArgument("n_workers must be at least 1".into()));
        }
        Ok(Self {
            name: name.into(),
            benchmark,
            n_repeat,
            storage,
            n_workers,
        })
    }

    pub fn aggregate(&self) -> Result<serde_json::Value, EvalError> {
        aggregate(&*self.benchmark, self.n_repeat, &*self.storage)
    }
}

#[async_trait]
impl Evaluator for ParallelEvaluator {
    async fn run(&self, solution: Arc<dyn Solution>) -> Result<(), EvalError> {
        self.storage
            .save_evaluation_meta(&evaluation_meta(&self.name, &*self.benchmark, self.n_repeat))?;

        let semaphore = Arc::new(Semaphore::new(self.n_workers));
        let mut units = JoinSet::new();
        for repeat_index in 0..self.n_repeat {
            for task_index in 0..self.benchmark.len() {
                let Some(task) = self.benchmark.get(task_index) else {
                    continue;
                };
                let storage = self.storage.clone();
                let solution = solution.clone();
                let semaphore = semaphore.clone();
                let repeat_id = repeat_index.to_string();
                units.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    run_unit(task, repeat_id, storage, solution).await;
                });
            }
        }
        while let Some(joined) = units.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "evaluation unit panicked, left incomplete");
            }
        }

        self.aggregate()?;
        Ok(())
    }
}
