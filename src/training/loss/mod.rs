//! Multi-task loss computation
//!
//! # Key Components
//!
//! - **Reduction**: masked `sum`, `mean`, `task_mean` with zero-safe division
//! - **LossCoefficients**: per-task weights of a target
//! - **LossKind**: elementwise `mae`, `mse`, `l2mae`
//! - **MultiTaskLoss**: per-term masking, normalization, reduction and summation
//!
//! # Usage
//!
//! ```rust,ignore
//! use ocp_mt::training::loss::MultiTaskLoss;
//!
//! let loss_fn = MultiTaskLoss::new(&config)?;
//! let loss = loss_fn.compute(&outputs, &batch, &normalizers)?;
//! let grads = loss.backward()?;
//! ```

pub mod aggregator;
pub mod coefficients;
pub mod functions;
pub mod reduction;

pub use aggregator::{LossTerm, MultiTaskLoss};
pub use coefficients::LossCoefficients;
pub use functions::LossKind;
pub use reduction::{safe_divide, Reduction};
