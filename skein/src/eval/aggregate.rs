//! Aggregation: per-(repeat, metric) rollup of stored evaluation results.

use std::collections::BTreeMap;

use serde_json::{json, Value as JsonValue};

use super::benchmark::{benchmark_tasks, Benchmark};
use super::error::EvalError;
use super::storage::EvaluatorStorage;
use super::task::MetricType;

#[derive(Default)]
struct MetricRollup {
    metric_type: Option<MetricType>,
    involved: usize,
    completed: usize,
    incomplete: usize,
    /// CATEGORY: category -> task ids. NUMERICAL: task id -> score.
    category_distribution: BTreeMap<String, Vec<String>>,
    numerical_distribution: BTreeMap<String, f64>,
}

/// Walks every (task, metric) of the benchmark per repeat, counts
/// involved/completed/incomplete units from storage, and computes the per-metric
/// aggregation: category fractions over involved tasks, or mean/max/min over
/// completed scores. The report is persisted once via the storage.
pub fn aggregate(
    benchmark: &dyn Benchmark,
    n_repeat: usize,
    storage: &dyn EvaluatorStorage,
) -> Result<JsonValue, EvalError> {
    let mut repeats = serde_json::Map::new();

    for repeat_index in 0..n_repeat {
        let repeat_id = repeat_index.to_string();
        let mut completed_ids: Vec<String> = Vec::new();
        let mut incomplete_ids: Vec<String> = Vec::new();
        let mut metrics: BTreeMap<String, MetricRollup> = BTreeMap::new();

        for task in benchmark_tasks(benchmark) {
            for metric in &task.metrics {
                let rollup = metrics.entry(metric.name().to_string()).or_default();
                rollup.metric_type.get_or_insert(metric.metric_type());
                rollup.involved += 1;

                if !storage.evaluation_result_exists(&task.id, &repeat_id, metric.name()) {
                    if !incomplete_ids.contains(&task.id) {
                        incomplete_ids.push(task.id.clone());
                    }
                    rollup.incomplete += 1;
                    continue;
                }
                if !completed_ids.contains(&task.id) {
                    completed_ids.push(task.id.clone());
                }
                rollup.completed += 1;

                let result = storage.get_evaluation_result(&task.id, &repeat_id, metric.name())?;
                match metric.metric_type() {
                    MetricType::Category => {
                        let category = result
                            .result
                            .as_category()
                            .unwrap_or("<non-category>")
                            .to_string();
                        rollup
                            .category_distribution
                            .entry(category)
                            .or_default()
                            .push(task.id.clone());
                    }
                    MetricType::Numerical => {
                        let score = result.result.as_number().unwrap_or(0.0);
                        rollup.numerical_distribution.insert(task.id.clone(), score);
                    }
                }
            }
        }

        let mut metrics_json = serde_json::Map::new();
        for (name, rollup) in metrics {
            let metric_type = rollup.metric_type.unwrap_or(MetricType::Numerical);
            let (aggregation, distribution) = match metric_type {
                MetricType::Category => {
                    let mut fractions = serde_json::Map::new();
                    for (category, ids) in &rollup.category_distribution {
                        let fraction = ids.len() as f64 / rollup.involved.max(1) as f64;
                        fractions.insert(category.clone(), json!(fraction));
                    }
                    (
                        JsonValue::Object(fractions),
                        serde_json::to_value(&rollup.category_distribution)?,
                    )
                }
                MetricType::Numerical => {
                    let scores: Vec<f64> = rollup.numerical_distribution.values().copied().collect();
                    let aggregation = if scores.is_empty() {
                        json!({})
                    } else {
                        let sum: f64 = scores.iter().sum();
                        let max = scores.iter().copied().fold(f64::MIN, f64::max);
                        let min = scores.iter().copied().fold(f64::MAX, f64::min);
                        json!({
                            "mean": sum / scores.len() as f64,
                            "max": max,
                            "min": min,
                        })
                    };
                    (aggregation, serde_json::to_value(&rollup.numerical_distribution)?)
                }
            };
            tracing::info!(
                repeat = %repeat_id,
                metric = %name,
                involved = rollup.involved,
                completed = rollup.completed,
                incomplete = rollup.incomplete,
                aggregation = %aggregation,
                "metric aggregated"
            );
            metrics_json.insert(
                name,
                json!({
                    "type": metric_type,
                    "involved_tasks": rollup.involved,
                    "completed_tasks": rollup.completed,
                    "incomplete_tasks": rollup.incomplete,
                    "aggregation": aggregation,
                    "distribution": distribution,
                }),
            );
        }

        repeats.insert(
            repeat_id,
            json!({
                "completed_tasks": completed_ids.len(),
                "incomplete_tasks": incomplete_ids.len(),
                "completed_ids": completed_ids,
                "incomplete_ids": incomplete_ids,
                "metrics": metrics_json,
            }),
        );
    }

    let report = json!({
        "total_tasks": benchmark.len(),
        "total_repeats": n_repeat,
        "repeats": repeats,
        "schema_version": 1,
    });
    storage.save_aggregation_result(&report)?;
    Ok(report)
}
