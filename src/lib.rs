//! OCP-MT - multi-task loss and metric core for atomistic GNN training
//!
//! This crate turns per-task model outputs into a single training loss and
//! into per-task energy and force metrics, for graph neural networks trained
//! jointly on several datasets that share one backbone.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod training;

// Re-exports
pub use config::{MultiTaskConfig, OutputLevel, TrainerConfig};
pub use error::{Error, Result};
pub use training::{
    GraphBatch, MultiTaskBatch, MultiTaskLoss, MultiTaskModel, MultiTaskTrainer, NormalizerSet,
};
