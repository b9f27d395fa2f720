//! Metric bookkeeping and the structure-to-energy-and-forces evaluator
//!
//! Metrics are kept as `{total, numel, metric}` entries so that repeated
//! updates of the same key within a pass average instead of overwrite.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Accumulated value of one metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    /// Sum of all contributions
    pub total: f64,
    /// Number of contributions
    pub numel: f64,
    /// `total / numel`
    pub metric: f64,
}

/// Metric entries keyed by name
pub type Metrics = BTreeMap<String, MetricEntry>;

/// A partial sum to merge into a [`MetricEntry`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stat {
    /// Sum of the contributions
    pub total: f64,
    /// Number of contributions
    pub numel: f64,
}

/// Merge `stat` into `metrics[name]`
pub fn merge_stat(name: &str, stat: Stat, metrics: &mut Metrics) {
    let entry = metrics.entry(name.to_string()).or_default();
    entry.total += stat.total;
    entry.numel += stat.numel;
    entry.metric = if entry.numel == 0.0 {
        0.0
    } else {
        entry.total / entry.numel
    };
}

/// Metric computation shared with single-task training
pub trait Evaluator: Send + Sync {
    /// Add one scalar observation of `name`
    fn update(&self, name: &str, value: f64, metrics: &mut Metrics) {
        merge_stat(
            name,
            Stat {
                total: value,
                numel: 1.0,
            },
            metrics,
        );
    }

    /// Compute metrics on flattened, physical-unit outputs and targets and
    /// merge them into `metrics`
    fn eval(
        &self,
        outputs: &HashMap<String, Tensor>,
        targets: &HashMap<String, Tensor>,
        metrics: &mut Metrics,
    ) -> Result<()>;
}

/// Metrics of the structure-to-energy-and-forces task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum S2efMetric {
    /// Mean absolute energy error
    EnergyMae,
    /// Mean squared energy error
    EnergyMse,
    /// Mean absolute force component error
    ForcesMae,
    /// Mean squared force component error
    ForcesMse,
    /// Mean cosine similarity of force vectors
    ForcesCosineSimilarity,
    /// Mean absolute error of force magnitudes
    ForcesMagnitudeError,
}

impl S2efMetric {
    /// Every metric
    pub const ALL: [S2efMetric; 6] = [
        Self::EnergyMae,
        Self::EnergyMse,
        Self::ForcesMae,
        Self::ForcesMse,
        Self::ForcesCosineSimilarity,
        Self::ForcesMagnitudeError,
    ];

    /// Metric key
    pub fn name(&self) -> &'static str {
        match self {
            Self::EnergyMae => "energy_mae",
            Self::EnergyMse => "energy_mse",
            Self::ForcesMae => "forces_mae",
            Self::ForcesMse => "forces_mse",
            Self::ForcesCosineSimilarity => "forces_cosine_similarity",
            Self::ForcesMagnitudeError => "forces_magnitude_error",
        }
    }

    /// Target the metric is computed on
    pub fn target(&self) -> &'static str {
        match self {
            Self::EnergyMae | Self::EnergyMse => "energy",
            _ => "forces",
        }
    }

    fn compute(&self, pred: &Tensor, target: &Tensor) -> Result<Stat> {
        let pred = pred.to_dtype(DType::F64)?;
        let target = target.to_dtype(DType::F64)?;
        let diff = (&pred - &target)?;

        let (values, numel) = match self {
            Self::EnergyMae | Self::ForcesMae => (diff.abs()?, diff.elem_count()),
            Self::EnergyMse | Self::ForcesMse => (diff.sqr()?, diff.elem_count()),
            Self::ForcesCosineSimilarity => {
                let dot = (&pred * &target)?.sum(D::Minus1)?;
                let norms = (vector_norm(&pred)? * vector_norm(&target)?)?;
                let norms = norms.clamp(1e-8, f64::MAX)?;
                let cos = (dot / norms)?;
                let n = cos.elem_count();
                (cos, n)
            }
            Self::ForcesMagnitudeError => {
                let err = (vector_norm(&pred)? - vector_norm(&target)?)?.abs()?;
                let n = err.elem_count();
                (err, n)
            }
        };

        Ok(Stat {
            total: values.sum_all()?.to_scalar::<f64>()?,
            numel: numel as f64,
        })
    }
}

fn vector_norm(t: &Tensor) -> Result<Tensor> {
    Ok(t.sqr()?.sum(D::Minus1)?.sqrt()?)
}

/// Default evaluator for energy and force prediction
#[derive(Debug, Clone)]
pub struct S2efEvaluator {
    metrics: Vec<S2efMetric>,
}

impl Default for S2efEvaluator {
    fn default() -> Self {
        Self {
            metrics: S2efMetric::ALL.to_vec(),
        }
    }
}

impl S2efEvaluator {
    /// Evaluator restricted to `metrics`
    pub fn with_metrics(metrics: Vec<S2efMetric>) -> Self {
        Self { metrics }
    }

    /// Enabled metrics
    pub fn metrics(&self) -> &[S2efMetric] {
        &self.metrics
    }
}

impl Evaluator for S2efEvaluator {
    fn eval(
        &self,
        outputs: &HashMap<String, Tensor>,
        targets: &HashMap<String, Tensor>,
        metrics: &mut Metrics,
    ) -> Result<()> {
        for metric in &self.metrics {
            let key = metric.target();
            let (Some(pred), Some(target)) = (outputs.get(key), targets.get(key)) else {
                debug!("Skipping {}: '{}' not available", metric.name(), metric.target());
                continue;
            };
            if pred.elem_count() == 0 {
                continue;
            }
            let stat = metric.compute(pred, target)?;
            merge_stat(metric.name(), stat, metrics);
        }
        Ok(())
    }
}
