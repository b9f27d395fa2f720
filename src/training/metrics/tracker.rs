//! Per-task streaming metrics
//!
//! [`MetricTracker`] owns one [`MeanAbsoluteError`] per task, per tracked
//! quantity, per phase. Training accumulators are reset on the print cadence;
//! validation accumulators are read and reset once per full validation pass.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use tracing::{debug, instrument, warn};

use super::evaluator::{Evaluator, Metrics};
use super::mae::MeanAbsoluteError;
use crate::config::{MultiTaskConfig, OutputLevel};
use crate::error::{Error, Result};
use crate::training::batch::MultiTaskBatch;
use crate::training::outputs::select_active;

/// Training or validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Gradient steps
    Train,
    /// Evaluation passes
    Val,
}

/// Physical quantities tracked per task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    /// Per-structure energy
    Energy,
    /// Per-atom forces
    Forces,
}

impl Quantity {
    /// Every tracked quantity
    pub const ALL: [Quantity; 2] = [Self::Energy, Self::Forces];

    /// Target name of the quantity
    pub fn target(&self) -> &'static str {
        match self {
            Self::Energy => "energy",
            Self::Forces => "forces",
        }
    }

    /// Output level of the quantity
    pub fn level(&self) -> OutputLevel {
        match self {
            Self::Energy => OutputLevel::System,
            Self::Forces => OutputLevel::Atom,
        }
    }
}

/// Accumulators of one phase, indexed by task
#[derive(Debug, Clone)]
struct PhaseMetrics {
    energy: Vec<MeanAbsoluteError>,
    forces: Vec<MeanAbsoluteError>,
}

impl PhaseMetrics {
    fn new(num_tasks: usize) -> Self {
        Self {
            energy: vec![MeanAbsoluteError::new(); num_tasks],
            forces: vec![MeanAbsoluteError::new(); num_tasks],
        }
    }

    fn quantity(&self, quantity: Quantity) -> &[MeanAbsoluteError] {
        match quantity {
            Quantity::Energy => &self.energy,
            Quantity::Forces => &self.forces,
        }
    }

    fn quantity_mut(&mut self, quantity: Quantity) -> &mut [MeanAbsoluteError] {
        match quantity {
            Quantity::Energy => &mut self.energy,
            Quantity::Forces => &mut self.forces,
        }
    }

    fn reset(&mut self) {
        self.energy.iter_mut().for_each(MeanAbsoluteError::reset);
        self.forces.iter_mut().for_each(MeanAbsoluteError::reset);
    }
}

/// Train and validation per-task MAE accumulators
#[derive(Debug, Clone)]
pub struct MetricTracker {
    train: PhaseMetrics,
    val: PhaseMetrics,
    num_tasks: usize,
    print_every: usize,
}

impl MetricTracker {
    /// Accumulators for `num_tasks` tasks; training state resets every `print_every` steps
    pub fn new(num_tasks: usize, print_every: usize) -> Self {
        Self {
            train: PhaseMetrics::new(num_tasks),
            val: PhaseMetrics::new(num_tasks),
            num_tasks,
            print_every: print_every.max(1),
        }
    }

    /// Number of tracked tasks
    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    fn phase(&self, phase: Phase) -> &PhaseMetrics {
        match phase {
            Phase::Train => &self.train,
            Phase::Val => &self.val,
        }
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseMetrics {
        match phase {
            Phase::Train => &mut self.train,
            Phase::Val => &mut self.val,
        }
    }

    /// Feed an already denormalized, masked pair into a task's accumulator.
    /// Returns the MAE of this pair alone.
    pub fn update(
        &mut self,
        phase: Phase,
        quantity: Quantity,
        task: usize,
        pred: &Tensor,
        target: &Tensor,
    ) -> Result<f64> {
        let num_tasks = self.num_tasks;
        let accumulator = self
            .phase_mut(phase)
            .quantity_mut(quantity)
            .get_mut(task)
            .ok_or_else(|| {
                Error::invalid_input(format!("task {task} out of range 0..{num_tasks}"))
            })?;
        accumulator.update(pred, target)
    }

    /// Accumulated MAE of a task
    pub fn compute(&self, phase: Phase, quantity: Quantity, task: usize) -> Option<f64> {
        self.phase(phase)
            .quantity(quantity)
            .get(task)
            .map(MeanAbsoluteError::compute)
    }

    /// Reset every accumulator of `phase`
    pub fn reset(&mut self, phase: Phase) {
        self.phase_mut(phase).reset();
    }

    /// Reset the training accumulators when `step` falls on the print cadence
    pub fn maybe_reset_train(&mut self, step: usize) -> bool {
        if step % self.print_every == 0 {
            debug!("Resetting training per-task metrics at step {}", step);
            self.reset(Phase::Train);
            true
        } else {
            false
        }
    }

    /// Update the accumulators of `phase` from one batch of denormalized
    /// task-axis outputs and return the per-batch metrics, keyed
    /// `{task_name}_{quantity}_mae`.
    #[instrument(skip_all, fields(phase = ?phase))]
    pub fn compute_per_task(
        &mut self,
        phase: Phase,
        mt: &MultiTaskConfig,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
        evaluator: &dyn Evaluator,
    ) -> Result<Metrics> {
        let mut metrics = Metrics::new();

        let available: Vec<Quantity> = Quantity::ALL
            .into_iter()
            .filter(|quantity| {
                let present =
                    outputs.contains_key(quantity.target()) && batch.has_target(quantity.target());
                if !present {
                    warn!(
                        "'{}' missing from outputs or batch, skipping per-task metric",
                        quantity.target()
                    );
                }
                present
            })
            .collect();

        for task in mt.tasks_by_idx() {
            let mask = batch
                .task_mask()
                .broadcast_mul(&batch.examples_of_task(task.idx)?.unsqueeze(1)?)?;
            if mask.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()? == 0.0 {
                continue;
            }
            let node_mask = mask.index_select(batch.batch(), 0)?;

            for quantity in &available {
                let mask = match quantity.level() {
                    OutputLevel::System => &mask,
                    OutputLevel::Atom => &node_mask,
                };
                let pred = select_active(&outputs[quantity.target()], mask)?;
                let target = select_active(batch.target(quantity.target())?, mask)?;
                let value = self.update(phase, *quantity, task.idx, &pred, &target)?;
                evaluator.update(
                    &format!("{}_{}_mae", task.name, quantity.target()),
                    value,
                    &mut metrics,
                );
            }
        }

        Ok(metrics)
    }

    /// Report the accumulated validation MAE of every task as
    /// `task_{idx}_{quantity}_mae`, then reset the validation accumulators
    #[instrument(skip_all)]
    pub fn finalize_validation(&mut self, evaluator: &dyn Evaluator, metrics: &mut Metrics) {
        for task in 0..self.num_tasks {
            for quantity in Quantity::ALL {
                let accumulator = &self.val.quantity(quantity)[task];
                if accumulator.count() == 0 {
                    warn!("No validation samples for task {} {}", task, quantity.target());
                }
                evaluator.update(
                    &format!("task_{}_{}_mae", task, quantity.target()),
                    accumulator.compute(),
                    metrics,
                );
            }
        }
        self.reset(Phase::Val);
    }
}
