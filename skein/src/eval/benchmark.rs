//! Benchmark: an indexable collection of tasks.

use super::task::Task;

/// Caller-supplied evaluation dataset. Implementations produce tasks by ordinal.
pub trait Benchmark: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Task at `index`, `None` out of range.
    fn get(&self, index: usize) -> Option<Task>;
}

/// Iterates a benchmark's tasks in ordinal order.
pub fn benchmark_tasks(benchmark: &dyn Benchmark) -> impl Iterator<Item = Task> + '_ {
    (0..benchmark.len()).filter_map(move |i| benchmark.get(i))
}

/// In-memory benchmark over a task vector.
pub struct VecBenchmark {
    name: String,
    description: String,
    tasks: Vec<Task>,
}

impl VecBenchmark {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        tasks: Vec<Task>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tasks,
        }
    }
}

impl Benchmark for VecBenchmark {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn get(&self, index: usize) -> Option<Task> {
        self.tasks.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_benchmark_indexing_and_iteration() {
        let tasks = vec![
            Task::new("a", serde_json::json!(1), serde_json::json!(1), vec![]),
            Task::new("b", serde_json::json!(2), serde_json::json!(2), vec![]),
        ];
        let bench = VecBenchmark::new("demo", "two tasks", tasks);
        assert_eq!(bench.len(), 2);
        assert!(!bench.is_empty());
        assert_eq!(bench.get(1).map(|t| t.id), Some("b".to_string()));
        assert!(bench.get(2).is_none());
        let ids: Vec<String> = benchmark_tasks(&bench).map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
