//! Masked reductions over `(rows, tasks)` loss tensors
//!
//! Every division goes through [`safe_divide`], so an empty mask reduces to
//! zero instead of NaN.

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Loss reduction kinds
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Total sum over every element
    Sum,
    /// Sum of losses over the number of active elements
    #[default]
    Mean,
    /// Per-task mean, then the unweighted mean across tasks
    TaskMean,
    /// Per-structure mean of an atom-level loss, then `Mean` over structures
    StructureWiseMean,
}

impl Reduction {
    /// Reduce `loss` to a scalar under `mask`.
    ///
    /// `loss` and `mask` are `(rows, tasks)`; `mask` must already be in the
    /// loss dtype. `StructureWiseMean` is rewritten by the aggregator before
    /// reaching this point and is rejected here.
    pub fn reduce(self, loss: &Tensor, mask: &Tensor) -> Result<Tensor> {
        match self {
            Self::Sum => Ok(loss.sum_all()?),
            Self::Mean => safe_divide(&loss.sum_all()?, &mask.sum_all()?),
            Self::TaskMean => {
                let per_task = safe_divide(&loss.sum(0)?, &mask.sum(0)?)?;
                Ok(per_task.mean(D::Minus1)?)
            }
            Self::StructureWiseMean => Err(Error::config(
                "structure_wise_mean must be collapsed to per-structure losses before reduction",
            )),
        }
    }

    /// Name used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::TaskMean => "task_mean",
            Self::StructureWiseMean => "structure_wise_mean",
        }
    }
}

/// Elementwise `a / b` where zeros in `b` are replaced by 1.0
pub fn safe_divide(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let zero = b.eq(0.0)?;
    let denominator = zero.where_cond(&b.ones_like()?, b)?;
    Ok(a.broadcast_div(&denominator)?)
}
