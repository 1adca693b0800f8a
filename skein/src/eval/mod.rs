//! # Evaluation: benchmark driver with resumable persistence
//!
//! A [`Benchmark`] produces [`Task`]s; the caller supplies a [`Solution`]; an
//! [`Evaluator`] iterates every (task, repeat) pair, persists solution outputs and
//! [`MetricResult`]s through an [`EvaluatorStorage`], and writes one aggregate
//! report. Stored results are never recomputed, which makes runs resumable and
//! lets parallel workers dedup through the storage alone.

mod aggregate;
mod benchmark;
mod error;
mod evaluator;
mod storage;
mod task;

pub use aggregate::aggregate;
pub use benchmark::{benchmark_tasks, Benchmark, VecBenchmark};
pub use error::EvalError;
pub use evaluator::{
    solution_fn, Evaluator, FnSolution, ParallelEvaluator, SerialEvaluator, Solution,
};
pub use storage::{EvaluatorStorage, FileEvaluatorStorage, PrePrintHook};
pub use task::{Metric, MetricResult, MetricType, MetricValue, SolutionOutput, Task};
