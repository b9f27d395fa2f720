//! Multi-task training core
//!
//! This module provides the loss and metric machinery for training one
//! model on several atomistic datasets at once. Every system-level target is
//! predicted as `(B, T)` and every atom-level target as `(N, T, 3)`, where
//! `T` is the number of tasks.
//!
//! # Main Components
//!
//! - **Batch**: concatenated multi-task graph batches with task masks
//! - **Outputs**: merging of per-task model outputs into task-axis tensors
//! - **Normalizer**: per-task target normalization
//! - **Loss**: masked, coefficient-weighted per-task loss terms
//! - **Metrics**: evaluator, per-task MAE tracking and the aggregation bridge
//! - **Trainer**: the façade wiring these together for a step or a validation pass
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ocp_mt::config::TrainerConfig;
//! use ocp_mt::training::MultiTaskTrainer;
//!
//! let config = TrainerConfig::from_file("mt.yaml")?;
//! let mut trainer = MultiTaskTrainer::new(config)?;
//!
//! let step = trainer.train_step(&model, &batch)?;
//! let grads = step.loss.backward()?;
//!
//! let val_metrics = trainer.validate(&model, &val_batches)?;
//! ```

pub mod batch;
pub mod loss;
pub mod metrics;
pub mod normalizer;
pub mod outputs;
pub mod trainer;

pub use batch::{GraphBatch, MultiTaskBatch};
pub use loss::{LossKind, MultiTaskLoss, Reduction};
pub use metrics::{Evaluator, MetricEntry, Metrics, Phase, S2efEvaluator};
pub use normalizer::{Normalizer, NormalizerSet, TaskNormalizer};
pub use outputs::OutputMerger;
pub use trainer::{MultiTaskModel, MultiTaskTrainer, StepOutput};
