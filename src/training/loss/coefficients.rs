//! Per-task loss coefficients

use candle_core::Tensor;

use crate::config::MultiTaskConfig;
use crate::error::{Error, Result};

/// Coefficient vector of one target, one entry per task
#[derive(Debug, Clone, PartialEq)]
pub struct LossCoefficients {
    target: String,
    values: Vec<f64>,
}

impl LossCoefficients {
    /// Resolve the coefficients of `target` from every task's configuration.
    /// Tasks that do not mention the target weigh it by 1.0.
    pub fn resolve(mt: &MultiTaskConfig, target: &str) -> Result<Self> {
        let values = (0..mt.num_tasks())
            .map(|idx| {
                mt.task_by_idx(idx)
                    .map(|task| task.loss_coefficient(target))
                    .ok_or_else(|| Error::config(format!("no task with idx {idx}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            target: target.to_string(),
            values,
        })
    }

    /// Target the coefficients apply to
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Coefficient per task
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Multiply a `(rows, T)` loss by the coefficient of its task column
    pub fn apply(&self, loss: &Tensor) -> Result<Tensor> {
        let num_tasks = loss.dim(1)?;
        if num_tasks != self.values.len() {
            return Err(Error::shape(format!(
                "loss for '{}' has {num_tasks} task columns, expected {}",
                self.target,
                self.values.len()
            )));
        }

        let coeff = Tensor::new(self.values.as_slice(), loss.device())?.to_dtype(loss.dtype())?;
        Ok(loss.broadcast_mul(&coeff)?)
    }
}
