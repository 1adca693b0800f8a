//! # Skein
//!
//! Multi-agent runtime core: the pieces that make agents do interesting work
//! reliably, each usable on its own.
//!
//! - **Evaluation** ([`eval`]): run a benchmark of tasks against a caller-supplied
//!   solution with repetition, a parallel worker pool, resumable file persistence,
//!   per-task metric scoring, and aggregation.
//! - **Memory** ([`memory`]): two-tier agent memory — a verbatim chat log plus an
//!   LLM-processed semantic store backed by a vector store, with long-context
//!   chunking, summarization under budget pressure, and query-driven retrieval.
//! - **Model gateways** ([`llm`]): one `call(messages)` seam for chat completions
//!   (whole or streamed) and an [`Embedder`](memory::Embedder) seam for vectors,
//!   with an OpenAI-compatible implementation and mocks for tests.
//! - **Support**: bounded [`retry`] policies for cross-process calls, a recursive
//!   token-bounded [`splitter`], and a file-backed embedding [`cache`].
//!
//! The distributed RPC object layer lives in the sibling `skein-rpc` crate; model
//! credentials are read from the environment, populated by the `config` crate.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skein::eval::{
//!     solution_fn, Evaluator, FileEvaluatorStorage, SerialEvaluator, SolutionOutput,
//!     Task, VecBenchmark,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let benchmark = Arc::new(VecBenchmark::new(
//!     "demo",
//!     "one task",
//!     vec![Task::new("t1", serde_json::json!("2+2"), serde_json::json!("4"), vec![])],
//! ));
//! let storage = Arc::new(FileEvaluatorStorage::new("./eval-results"));
//! let evaluator = SerialEvaluator::new("demo-run", benchmark, 1, storage)?;
//! let solution = solution_fn(|task, _hook| async move {
//!     Ok(SolutionOutput::new(true, task.ground_truth.clone()))
//! });
//! evaluator.run(solution).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod eval;
pub mod llm;
pub mod memory;
pub mod message;
pub mod retry;
pub mod splitter;

pub use cache::{Cache, CacheError, CachedEmbedder, FileCache, InMemoryCache};
pub use eval::{
    aggregate, benchmark_tasks, solution_fn, Benchmark, EvalError, Evaluator, EvaluatorStorage,
    FileEvaluatorStorage, FnSolution, Metric, MetricResult, MetricType, MetricValue,
    ParallelEvaluator, PrePrintHook, SerialEvaluator, Solution, SolutionOutput, Task,
    VecBenchmark,
};
pub use llm::{ChatModel, ChatOpenAI, ChatResponse, ChatUsage, MessageChunk, MockChat, ModelError};
pub use memory::{
    Embedder, InMemoryVectorStore, MemoryConfig, MemoryError, MemoryManager, MemoryPrompts,
    MemoryQuery, MemoryRecord, OpenAIEmbedder, RecordPayload, RetrieveType, SearchHit,
    SearchQuery, SqliteVecStore, StoreError, StoreKind, StoredVector, VectorStore,
};
pub use message::{short_id, Content, ContentBlock, MediaSource, Message, Role};
pub use retry::{RetryError, RetryPolicy};
pub use splitter::{HeuristicCounter, RecursiveTextSplitter, TokenCounter};

/// Loads `.env` and XDG `config.toml` values into the process environment
/// (existing env always wins). Call once at startup, before constructing model
/// gateways that read credentials like `OPENAI_API_KEY`.
pub fn load_env() -> Result<(), env_config::LoadError> {
    env_config::load_and_apply_default()
}

/// When running `cargo test -p skein`, initializes tracing from `RUST_LOG` so that
/// unit tests in `src/**` can print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
