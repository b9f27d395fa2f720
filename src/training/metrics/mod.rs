//! Metric computation for multi-task training
//!
//! This module provides the shared evaluator, per-task streaming MAE
//! tracking, and the bridge that collapses task-axis outputs into the
//! single-task layout the evaluator works on.
//!
//! # Main Components
//!
//! - **Evaluator**: `{total, numel, metric}` bookkeeping and energy/force metrics
//! - **MeanAbsoluteError**: streaming MAE accumulator
//! - **MetricTracker**: per-task, per-phase MAE accumulators
//! - **MetricsBridge**: aggregation and denormalization in front of the evaluator

pub mod bridge;
pub mod evaluator;
pub mod mae;
pub mod tracker;

pub use bridge::MetricsBridge;
pub use evaluator::{merge_stat, Evaluator, MetricEntry, Metrics, S2efEvaluator, S2efMetric, Stat};
pub use mae::MeanAbsoluteError;
pub use tracker::{MetricTracker, Phase, Quantity};
