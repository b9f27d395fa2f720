//! Multi-task trainer façade
//!
//! [`MultiTaskTrainer`] wires output merging, the multi-task loss and metric
//! computation around a [`MultiTaskModel`] for one training step or one
//! validation pass. Scheduling, optimization and checkpointing stay with the
//! caller.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use tracing::{debug, info, instrument};

use crate::config::TrainerConfig;
use crate::error::Result;
use crate::training::batch::MultiTaskBatch;
use crate::training::loss::MultiTaskLoss;
use crate::training::metrics::{
    Evaluator, MetricTracker, Metrics, MetricsBridge, Phase, S2efEvaluator,
};
use crate::training::normalizer::NormalizerSet;
use crate::training::outputs::OutputMerger;

/// A model producing per-task outputs keyed `"{target}_task_{idx}"`
pub trait MultiTaskModel {
    /// Run the model on a batch
    fn forward(&self, batch: &MultiTaskBatch) -> Result<HashMap<String, Tensor>>;
}

/// Result of one training step
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Scalar training loss, still attached to the model parameters
    pub loss: Tensor,
    /// Metrics of this step
    pub metrics: Metrics,
}

/// Loss and metric computation for multi-task training
pub struct MultiTaskTrainer {
    config: TrainerConfig,
    loss: MultiTaskLoss,
    merger: OutputMerger,
    bridge: MetricsBridge,
    tracker: MetricTracker,
    evaluator: Box<dyn Evaluator>,
    step: usize,
}

impl MultiTaskTrainer {
    /// Build a trainer from configuration, using the default energy and
    /// forces evaluator
    pub fn new(config: TrainerConfig) -> Result<Self> {
        let num_tasks = config.num_tasks();
        let normalizers = NormalizerSet::from_config(&config.normalizers, num_tasks)?;
        Self::with_normalizers(config, normalizers)
    }

    /// Build a trainer with externally provided normalizers
    pub fn with_normalizers(config: TrainerConfig, normalizers: NormalizerSet) -> Result<Self> {
        config.validate()?;
        let num_tasks = config.num_tasks();
        let loss = MultiTaskLoss::new(&config)?;
        let merger = OutputMerger::new(&config.outputs, num_tasks);
        let bridge = MetricsBridge::new(config.mt.clone(), config.outputs.clone(), normalizers);
        let tracker = MetricTracker::new(num_tasks, config.print_every);

        info!(
            "Multi-task trainer: {} tasks, {} loss terms, {} normalizers",
            num_tasks,
            loss.terms().len(),
            bridge.normalizers().len()
        );

        Ok(Self {
            config,
            loss,
            merger,
            bridge,
            tracker,
            evaluator: Box::new(S2efEvaluator::default()),
            step: 0,
        })
    }

    /// Replace the evaluator
    pub fn with_evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluator = Box::new(evaluator);
        self
    }

    /// Configuration the trainer was built from
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Resolved loss terms
    pub fn loss_fn(&self) -> &MultiTaskLoss {
        &self.loss
    }

    /// Per-task metric accumulators
    pub fn tracker(&self) -> &MetricTracker {
        &self.tracker
    }

    /// Normalizers in use
    pub fn normalizers(&self) -> &NormalizerSet {
        self.bridge.normalizers()
    }

    /// Number of completed training steps
    pub fn step(&self) -> usize {
        self.step
    }

    /// Run the model and merge its per-task outputs into task-axis tensors
    pub fn forward(
        &self,
        model: &dyn MultiTaskModel,
        batch: &MultiTaskBatch,
    ) -> Result<HashMap<String, Tensor>> {
        let outputs = model.forward(batch)?;
        self.merger.merge_and_validate(outputs)
    }

    /// Scalar loss of merged outputs
    pub fn compute_loss(
        &self,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
    ) -> Result<Tensor> {
        self.loss.compute(outputs, batch, self.bridge.normalizers())
    }

    /// Merge evaluator and per-task metrics of merged outputs into `metrics`
    pub fn compute_metrics(
        &mut self,
        phase: Phase,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
        metrics: &mut Metrics,
    ) -> Result<()> {
        self.bridge.compute_metrics(
            &mut self.tracker,
            self.evaluator.as_ref(),
            phase,
            self.step,
            outputs,
            batch,
            metrics,
        )
    }

    /// One training step: forward, loss and training metrics.
    ///
    /// The returned loss keeps its graph so the caller can run the backward
    /// pass and the optimizer.
    #[instrument(skip_all, fields(step = self.step + 1))]
    pub fn train_step(
        &mut self,
        model: &dyn MultiTaskModel,
        batch: &MultiTaskBatch,
    ) -> Result<StepOutput> {
        self.step += 1;
        let outputs = self.forward(model, batch)?;
        let loss = self.compute_loss(&outputs, batch)?;

        let mut metrics = Metrics::new();
        self.evaluator.update("loss", scalar(&loss)?, &mut metrics);
        self.compute_metrics(Phase::Train, &outputs, batch, &mut metrics)?;

        debug!("Step {} loss: {:.6}", self.step, metrics["loss"].metric);
        Ok(StepOutput { loss, metrics })
    }

    /// One full validation pass. Per-task validation MAE is reported as
    /// `task_{idx}_{quantity}_mae` once every batch has been seen.
    ///
    /// Outputs need no gradient graph, so a frozen model validates as well.
    #[instrument(skip_all, fields(step = self.step))]
    pub fn validate<'a>(
        &mut self,
        model: &dyn MultiTaskModel,
        batches: impl IntoIterator<Item = &'a MultiTaskBatch>,
    ) -> Result<Metrics> {
        let mut metrics = Metrics::new();
        let mut num_batches = 0usize;

        for batch in batches {
            if let Err(err) = self.validate_batch(model, batch, &mut metrics) {
                self.tracker.reset(Phase::Val);
                return Err(err);
            }
            num_batches += 1;
        }

        self.tracker
            .finalize_validation(self.evaluator.as_ref(), &mut metrics);

        let loss = metrics.get("loss").map(|entry| entry.metric).unwrap_or(0.0);
        info!(
            "Validation completed over {} batches - Loss: {:.4}",
            num_batches, loss
        );
        Ok(metrics)
    }

    fn validate_batch(
        &mut self,
        model: &dyn MultiTaskModel,
        batch: &MultiTaskBatch,
        metrics: &mut Metrics,
    ) -> Result<()> {
        let outputs = self.forward(model, batch)?;
        let loss = self
            .loss
            .compute_detached(&outputs, batch, self.bridge.normalizers())?;
        self.evaluator.update("loss", scalar(&loss)?, metrics);
        self.compute_metrics(Phase::Val, &outputs, batch, metrics)
    }
}

fn scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
