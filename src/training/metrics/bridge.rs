//! Collapsing multi-task outputs for metric computation
//!
//! The single-task evaluator expects one value per structure and one vector
//! per atom. [`MetricsBridge`] picks each row's active task out of the task
//! axis, restores physical units, runs the evaluator, and adds the per-task
//! metrics from the [`MetricTracker`].

use std::collections::HashMap;

use candle_core::Tensor;
use tracing::{debug, instrument};

use super::evaluator::{Evaluator, Metrics};
use super::tracker::{MetricTracker, Phase};
use crate::config::{MultiTaskConfig, OutputsConfig};
use crate::error::Result;
use crate::training::batch::MultiTaskBatch;
use crate::training::normalizer::NormalizerSet;
use crate::training::outputs::collapse_tasks;

/// Aggregation and denormalization in front of the shared evaluator
#[derive(Debug, Clone)]
pub struct MetricsBridge {
    mt: MultiTaskConfig,
    outputs: OutputsConfig,
    normalizers: NormalizerSet,
}

impl MetricsBridge {
    /// Create a bridge for the configured tasks and output heads
    pub fn new(mt: MultiTaskConfig, outputs: OutputsConfig, normalizers: NormalizerSet) -> Self {
        Self {
            mt,
            outputs,
            normalizers,
        }
    }

    /// Normalizers used to restore physical units
    pub fn normalizers(&self) -> &NormalizerSet {
        &self.normalizers
    }

    /// Collapse the task axis of every configured tensor in `tensors`.
    /// Entries without an output head are dropped.
    pub fn aggregate(
        &self,
        tensors: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
    ) -> Result<HashMap<String, Tensor>> {
        let example_mask = batch.task_mask();
        let atom_mask = batch.atom_task_mask()?;

        let mut aggregated = HashMap::with_capacity(tensors.len());
        for (target, value) in tensors {
            let Some(head) = self.outputs.get(target) else {
                debug!("No output head for '{}', not aggregated", target);
                continue;
            };
            let flat = collapse_tasks(value, head.level, example_mask, &atom_mask)?;
            aggregated.insert(target.clone(), flat);
        }
        Ok(aggregated)
    }

    /// Compute the metrics of one batch and merge them into `metrics`.
    ///
    /// Evaluator metrics are computed on collapsed, denormalized tensors;
    /// per-task metrics overwrite same-named entries. In the training phase
    /// the training accumulators are reset when `step` is on the print cadence.
    #[instrument(skip_all, fields(phase = ?phase, step = step))]
    #[allow(clippy::too_many_arguments)]
    pub fn compute_metrics(
        &self,
        tracker: &mut MetricTracker,
        evaluator: &dyn Evaluator,
        phase: Phase,
        step: usize,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
        metrics: &mut Metrics,
    ) -> Result<()> {
        let per_task = self
            .normalizers
            .with_denormalized(batch, outputs, |denormed_batch, denormed_outputs| {
                let flat_outputs = self.aggregate(denormed_outputs, denormed_batch)?;
                let flat_targets = self.aggregate(denormed_batch.targets(), denormed_batch)?;
                evaluator.eval(&flat_outputs, &flat_targets, metrics)?;

                tracker.compute_per_task(
                    phase,
                    &self.mt,
                    denormed_outputs,
                    denormed_batch,
                    evaluator,
                )
            })?;
        metrics.extend(per_task);

        if phase == Phase::Train {
            tracker.maybe_reset_train(step);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutputHeadConfig, TaskConfig};
    use crate::training::batch::tests::two_task_part;
    use crate::training::metrics::evaluator::S2efEvaluator;
    use crate::training::metrics::tracker::Quantity;
    use crate::training::normalizer::TaskNormalizer;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use std::collections::BTreeMap;

    fn bridge(normalizers: NormalizerSet) -> MetricsBridge {
        let mt = MultiTaskConfig {
            tasks: vec![
                TaskConfig {
                    idx: 0,
                    name: "oc20".into(),
                    loss_coefficients: BTreeMap::new(),
                },
                TaskConfig {
                    idx: 1,
                    name: "mptrj".into(),
                    loss_coefficients: BTreeMap::new(),
                },
            ],
        };
        let outputs = BTreeMap::from([
            ("energy".to_string(), OutputHeadConfig::system()),
            ("forces".to_string(), OutputHeadConfig::atom(true)),
        ]);
        MetricsBridge::new(mt, outputs, normalizers)
    }

    fn outputs(batch: &MultiTaskBatch, device: &Device) -> HashMap<String, Tensor> {
        HashMap::from([
            (
                "energy".to_string(),
                Tensor::new(&[[2.0f32, 50.0], [50.0, 5.0]], device).unwrap(),
            ),
            (
                "forces".to_string(),
                batch.target("forces").unwrap().affine(1.0, 1.0).unwrap(),
            ),
        ])
    }

    #[test]
    fn test_aggregate_collapses_task_axis() {
        let device = Device::Cpu;
        let batch = MultiTaskBatch::from_parts(&[two_task_part(&device)], &device).unwrap();
        let flat = bridge(NormalizerSet::new())
            .aggregate(&outputs(&batch, &device), &batch)
            .unwrap();
        assert_eq!(flat["energy"].to_vec1::<f32>().unwrap(), vec![2.0, 5.0]);
        assert_eq!(flat["forces"].dims(), &[4, 3]);
    }

    #[test]
    fn test_compute_metrics_with_denormalization() {
        let device = Device::Cpu;
        let batch = MultiTaskBatch::from_parts(&[two_task_part(&device)], &device).unwrap();
        let mut normalizers = NormalizerSet::new();
        let energy = TaskNormalizer::new(vec![0.0, 0.0], vec![10.0, 1.0]).unwrap();
        normalizers.insert("energy", energy);
        let bridge = bridge(normalizers);

        let mut tracker = MetricTracker::new(2, 100);
        let mut metrics = Metrics::new();
        bridge
            .compute_metrics(
                &mut tracker,
                &S2efEvaluator::default(),
                Phase::Val,
                1,
                &outputs(&batch, &device),
                &batch,
                &mut metrics,
            )
            .unwrap();

        // Task 0 errors are scaled by 10: |20 - 10| = 10; task 1: |5 - 2| = 3.
        assert_relative_eq!(metrics["energy_mae"].metric, 6.5);
        assert_relative_eq!(metrics["oc20_energy_mae"].metric, 10.0);
        assert_relative_eq!(metrics["mptrj_energy_mae"].metric, 3.0);
        assert_relative_eq!(metrics["forces_mae"].metric, 1.0, epsilon = 1e-6);
        assert_eq!(tracker.compute(Phase::Val, Quantity::Energy, 0), Some(10.0));
    }

    #[test]
    fn test_train_metrics_reset_on_cadence() {
        let device = Device::Cpu;
        let batch = MultiTaskBatch::from_parts(&[two_task_part(&device)], &device).unwrap();
        let bridge = bridge(NormalizerSet::new());
        let evaluator = S2efEvaluator::default();
        let mut tracker = MetricTracker::new(2, 2);

        let mut metrics = Metrics::new();
        let step_outputs = outputs(&batch, &device);
        bridge
            .compute_metrics(
                &mut tracker,
                &evaluator,
                Phase::Train,
                1,
                &step_outputs,
                &batch,
                &mut metrics,
            )
            .unwrap();
        assert_eq!(tracker.compute(Phase::Train, Quantity::Energy, 0), Some(1.0));

        let step_outputs = outputs(&batch, &device);
        bridge
            .compute_metrics(
                &mut tracker,
                &evaluator,
                Phase::Train,
                2,
                &step_outputs,
                &batch,
                &mut metrics,
            )
            .unwrap();
        assert_relative_eq!(metrics["oc20_energy_mae"].metric, 1.0);
        assert_eq!(tracker.compute(Phase::Train, Quantity::Energy, 0), Some(0.0));
    }
}
