//! Elementwise loss functions
//!
//! Each function maps a prediction/target pair of shape `(B, T)` or
//! `(N, T, 3)` to an unreduced `(rows, T)` loss; the vector dimension of
//! atom-level tensors is folded here so the reduction engine only ever sees
//! rank-2 inputs.

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Elementwise loss kinds
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Absolute error, averaged over the vector dimension
    #[default]
    Mae,
    /// Squared error, averaged over the vector dimension
    Mse,
    /// Euclidean norm of the error vector
    #[serde(rename = "l2mae")]
    L2Mae,
}

impl LossKind {
    /// Compute the unreduced loss
    pub fn compute(self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        if pred.dims() != target.dims() {
            return Err(Error::shape(format!(
                "prediction {:?} and target {:?} differ in shape",
                pred.dims(),
                target.dims()
            )));
        }

        let diff = (pred - target)?;
        let loss = match (self, diff.rank()) {
            (Self::Mae | Self::L2Mae, 2) => diff.abs()?,
            (Self::Mse, 2) => diff.sqr()?,
            (Self::Mae, 3) => diff.abs()?.mean(D::Minus1)?,
            (Self::Mse, 3) => diff.sqr()?.mean(D::Minus1)?,
            (Self::L2Mae, 3) => vector_norm(&diff)?,
            (_, rank) => {
                return Err(Error::shape(format!(
                    "loss inputs must be rank 2 or 3, got rank {rank}"
                )))
            }
        };
        Ok(loss)
    }
}

/// Euclidean norm over the last dimension with a zero subgradient at the origin
fn vector_norm(diff: &Tensor) -> Result<Tensor> {
    let sq = diff.sqr()?.sum(D::Minus1)?;
    let zero = sq.eq(0.0)?;
    let root = zero.where_cond(&sq.ones_like()?, &sq)?.sqrt()?;
    Ok(zero.where_cond(&sq.zeros_like()?, &root)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn test_system_level_losses() {
        let device = Device::Cpu;
        let pred = Tensor::new(&[[1.0f32, -2.0]], &device).unwrap();
        let target = Tensor::new(&[[0.0f32, 1.0]], &device).unwrap();

        let mae = LossKind::Mae.compute(&pred, &target).unwrap();
        assert_eq!(mae.to_vec2::<f32>().unwrap(), vec![vec![1.0, 3.0]]);

        let mse = LossKind::Mse.compute(&pred, &target).unwrap();
        assert_eq!(mse.to_vec2::<f32>().unwrap(), vec![vec![1.0, 9.0]]);
    }

    #[test]
    fn test_atom_level_l2mae() {
        let device = Device::Cpu;
        // One atom, two tasks, force vectors.
        let pred = Tensor::new(&[[[3.0f32, 4.0, 0.0], [1.0, 1.0, 1.0]]], &device).unwrap();
        let target = Tensor::zeros((1, 2, 3), candle_core::DType::F32, &device).unwrap();

        let l2 = LossKind::L2Mae.compute(&pred, &target).unwrap();
        let values = l2.to_vec2::<f32>().unwrap();
        assert_eq!(l2.dims(), &[1, 2]);
        assert!((values[0][0] - 5.0).abs() < 1e-6);
        assert!((values[0][1] - 3f32.sqrt()).abs() < 1e-6);

        let mae = LossKind::Mae.compute(&pred, &target).unwrap();
        let values = mae.to_vec2::<f32>().unwrap();
        assert!((values[0][0] - 7.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2mae_gradient_finite_at_zero_error() {
        let device = Device::Cpu;
        let target = Tensor::new(&[[[1.0f32, 0.0, 0.0], [0.0, 0.0, 0.0]]], &device).unwrap();
        let pred = Var::from_tensor(
            &Tensor::new(&[[[1.0f32, 0.0, 0.0], [0.0, 3.0, 4.0]]], &device).unwrap(),
        )
        .unwrap();

        let l2 = LossKind::L2Mae.compute(pred.as_tensor(), &target).unwrap();
        assert_eq!(l2.to_vec2::<f32>().unwrap(), vec![vec![0.0, 5.0]]);

        let grads = l2.sum_all().unwrap().backward().unwrap();
        let grad = grads.get(pred.as_tensor()).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(grad[0][0], vec![0.0, 0.0, 0.0]);
        assert!((grad[0][1][1] - 0.6).abs() < 1e-6);
        assert!((grad[0][1][2] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch() {
        let device = Device::Cpu;
        let pred = Tensor::zeros((2, 3), candle_core::DType::F32, &device).unwrap();
        let target = Tensor::zeros((2, 2), candle_core::DType::F32, &device).unwrap();
        assert!(matches!(
            LossKind::Mse.compute(&pred, &target).unwrap_err(),
            Error::Shape(_)
        ));
    }
}
