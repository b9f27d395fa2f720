//! Streaming mean absolute error

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Running mean absolute error over every element seen since the last reset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeanAbsoluteError {
    sum_abs_error: f64,
    total: usize,
}

impl MeanAbsoluteError {
    /// Fresh accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate a prediction/target pair and return the error of this pair alone
    pub fn update(&mut self, pred: &Tensor, target: &Tensor) -> Result<f64> {
        if pred.dims() != target.dims() {
            return Err(Error::shape(format!(
                "MAE prediction {:?} and target {:?} differ in shape",
                pred.dims(),
                target.dims()
            )));
        }

        let n = pred.elem_count();
        if n == 0 {
            return Ok(0.0);
        }

        let sum_abs_error = (pred - target)?
            .abs()?
            .to_dtype(DType::F64)?
            .sum_all()?
            .to_scalar::<f64>()?;
        self.sum_abs_error += sum_abs_error;
        self.total += n;
        Ok(sum_abs_error / n as f64)
    }

    /// Error accumulated since the last reset, 0.0 if nothing was seen
    pub fn compute(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sum_abs_error / self.total as f64
        }
    }

    /// Number of elements accumulated
    pub fn count(&self) -> usize {
        self.total
    }

    /// Forget all accumulated state
    pub fn reset(&mut self) {
        self.sum_abs_error = 0.0;
        self.total = 0;
    }
}
