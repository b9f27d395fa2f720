//! Per-task loss aggregation
//!
//! For every declared loss term the aggregator pairs the one-hot ground truth
//! with the task-axis prediction, masks out inactive tasks (and fixed atoms
//! where configured), weights each task column by its coefficient, reduces,
//! and sums the terms into the training loss.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use tracing::{debug, instrument, Level};

use super::coefficients::LossCoefficients;
use super::functions::LossKind;
use super::reduction::{safe_divide, Reduction};
use crate::config::{LossTermConfig, MultiTaskConfig, OutputLevel, OutputsConfig, TrainerConfig};
use crate::error::{Error, Result};
use crate::training::batch::MultiTaskBatch;
use crate::training::normalizer::NormalizerSet;

/// A loss term with everything resolved from configuration
#[derive(Debug, Clone)]
pub struct LossTerm {
    target: String,
    level: OutputLevel,
    free_atoms_only: bool,
    loss: LossKind,
    reduction: Reduction,
    coefficient: f64,
    coefficients: LossCoefficients,
}

impl LossTerm {
    /// Resolve one declared term
    pub fn resolve(
        config: &LossTermConfig,
        mt: &MultiTaskConfig,
        outputs: &OutputsConfig,
    ) -> Result<Self> {
        let head = outputs.get(&config.target).ok_or_else(|| {
            Error::config(format!("loss target '{}' is not a declared output", config.target))
        })?;
        if config.reduction == Reduction::StructureWiseMean && head.level != OutputLevel::Atom {
            return Err(Error::config(format!(
                "structure_wise_mean requires an atom-level target, '{}' is {:?}",
                config.target, head.level
            )));
        }

        Ok(Self {
            target: config.target.clone(),
            level: head.level,
            free_atoms_only: head.trains_on_free_atoms(),
            loss: config.loss,
            reduction: config.reduction,
            coefficient: config.coefficient,
            coefficients: LossCoefficients::resolve(mt, &config.target)?,
        })
    }

    /// Target name
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Output level of the target
    pub fn level(&self) -> OutputLevel {
        self.level
    }

    /// Declared reduction
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Elementwise loss function
    pub fn loss_kind(&self) -> LossKind {
        self.loss
    }

    /// Global weight of the reduced term
    pub fn coefficient(&self) -> f64 {
        self.coefficient
    }

    /// Per-task coefficients
    pub fn coefficients(&self) -> &LossCoefficients {
        &self.coefficients
    }

    /// Activity mask for this term in the loss dtype, `(rows, T)`
    fn mask(&self, batch: &MultiTaskBatch, pred: &Tensor) -> Result<Tensor> {
        let mask = match self.level {
            OutputLevel::System => batch.task_mask().clone(),
            OutputLevel::Atom => batch.atom_task_mask()?,
        };
        let mask = if self.free_atoms_only {
            mask.broadcast_mul(&batch.free_mask()?.unsqueeze(1)?)?
        } else {
            mask
        };

        let rows = pred.dim(0)?;
        if mask.dims() != [rows, pred.dim(1)?].as_slice() {
            return Err(Error::shape(format!(
                "'{}' prediction {:?} does not match its {:?} task mask",
                self.target,
                pred.dims(),
                mask.dims()
            )));
        }
        Ok(mask.to_dtype(pred.dtype())?)
    }

    /// Reduced, weighted scalar loss of this term.
    ///
    /// Fails with [`Error::Internal`] if the result is detached from the
    /// prediction's computation graph.
    pub fn compute(
        &self,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
        normalizers: &NormalizerSet,
    ) -> Result<Tensor> {
        self.compute_with(outputs, batch, normalizers, true)
    }

    /// Reduced, weighted scalar loss of this term for evaluation only;
    /// predictions need not carry a computation graph
    pub fn compute_detached(
        &self,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
        normalizers: &NormalizerSet,
    ) -> Result<Tensor> {
        self.compute_with(outputs, batch, normalizers, false)
    }

    fn compute_with(
        &self,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
        normalizers: &NormalizerSet,
        require_grad: bool,
    ) -> Result<Tensor> {
        let pred = outputs.get(&self.target).ok_or_else(|| {
            Error::missing_output(format!("loss target '{}' missing from outputs", self.target))
        })?;
        let mut mask = self.mask(batch, pred)?;

        let target = normalizers
            .norm(&self.target, batch.target(&self.target)?)?
            .to_dtype(pred.dtype())?;

        let loss = self.loss.compute(pred, &target)?;
        let mut loss = self.coefficients.apply(&(loss * &mask)?)?;

        let mut reduction = self.reduction;
        if reduction == Reduction::StructureWiseMean {
            let zeros = Tensor::zeros(
                (batch.num_examples(), loss.dim(1)?),
                loss.dtype(),
                loss.device(),
            )?;
            let per_structure = zeros.index_add(batch.batch(), &loss, 0)?;
            let atoms_per_structure = zeros.index_add(batch.batch(), &mask, 0)?;
            loss = safe_divide(&per_structure, &atoms_per_structure)?;
            mask = atoms_per_structure.gt(0.0)?.to_dtype(loss.dtype())?;
            reduction = Reduction::Mean;
        }

        let reduced = reduction.reduce(&loss, &mask)?.affine(self.coefficient, 0.0)?;
        if require_grad && !reduced.track_op() {
            return Err(Error::internal(format!(
                "loss term '{}' is detached from the computation graph",
                self.target
            )));
        }
        Ok(reduced)
    }
}

/// Sum of all declared loss terms
#[derive(Debug, Clone)]
pub struct MultiTaskLoss {
    terms: Vec<LossTerm>,
}

impl MultiTaskLoss {
    /// Resolve every loss term of a validated configuration
    pub fn new(config: &TrainerConfig) -> Result<Self> {
        Self::from_parts(&config.mt, &config.outputs, &config.loss_fns)
    }

    /// Resolve loss terms from their configuration sections
    pub fn from_parts(
        mt: &MultiTaskConfig,
        outputs: &OutputsConfig,
        loss_fns: &[LossTermConfig],
    ) -> Result<Self> {
        let terms = loss_fns
            .iter()
            .map(|term| LossTerm::resolve(term, mt, outputs))
            .collect::<Result<Vec<_>>>()?;
        if terms.is_empty() {
            return Err(Error::config("at least one loss term must be configured"));
        }
        Ok(Self { terms })
    }

    /// Resolved loss terms in declaration order
    pub fn terms(&self) -> &[LossTerm] {
        &self.terms
    }

    /// Per-term scalars in declaration order
    pub fn compute_terms(
        &self,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
        normalizers: &NormalizerSet,
    ) -> Result<Vec<Tensor>> {
        self.terms
            .iter()
            .map(|term| term.compute(outputs, batch, normalizers))
            .collect()
    }

    /// Scalar training loss
    #[instrument(skip_all, fields(terms = self.terms.len()))]
    pub fn compute(
        &self,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
        normalizers: &NormalizerSet,
    ) -> Result<Tensor> {
        self.sum_terms(self.compute_terms(outputs, batch, normalizers)?)
    }

    /// Scalar evaluation loss, also for outputs without a computation graph
    #[instrument(skip_all, fields(terms = self.terms.len()))]
    pub fn compute_detached(
        &self,
        outputs: &HashMap<String, Tensor>,
        batch: &MultiTaskBatch,
        normalizers: &NormalizerSet,
    ) -> Result<Tensor> {
        let losses = self
            .terms
            .iter()
            .map(|term| term.compute_detached(outputs, batch, normalizers))
            .collect::<Result<Vec<_>>>()?;
        self.sum_terms(losses)
    }

    fn sum_terms(&self, losses: Vec<Tensor>) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for (term, loss) in self.terms.iter().zip(losses) {
            if tracing::enabled!(Level::DEBUG) {
                let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                debug!("{} ({}) loss: {}", term.target, term.reduction.as_str(), value);
            }
            total = Some(match total {
                Some(acc) => (acc + loss)?,
                None => loss,
            });
        }
        total.ok_or_else(|| Error::internal("no loss terms were computed"))
    }
}
