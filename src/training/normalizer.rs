//! Target normalization
//!
//! Normalizers act on tensors in task layout: dimension 1 is the task axis
//! and the per-task shift/scale is broadcast over every other dimension.
//! Ground truth is normalized for the loss; both model outputs and ground
//! truth are denormalized for metric reporting through
//! [`NormalizerSet::with_denormalized`], which hands out denormalized copies
//! for the duration of a closure and drops them on every exit path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;
use tracing::debug;

use crate::config::NormalizerConfig;
use crate::error::{Error, Result};
use crate::training::batch::MultiTaskBatch;

/// Unit conversion for one target
pub trait Normalizer: Send + Sync + fmt::Debug {
    /// Model units from physical units
    fn norm(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Physical units from model units
    fn denorm(&self, tensor: &Tensor) -> Result<Tensor>;
}

/// Per-task mean/std normalizer
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNormalizer {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl TaskNormalizer {
    /// Create a normalizer from per-task shifts and scales
    pub fn new(mean: Vec<f64>, std: Vec<f64>) -> Result<Self> {
        if mean.len() != std.len() || mean.is_empty() {
            return Err(Error::config(format!(
                "normalizer needs matching non-empty mean/std, got {} and {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|s| *s == 0.0) {
            return Err(Error::config("normalizer std must be non-zero"));
        }
        Ok(Self { mean, std })
    }

    /// Build from configuration for `num_tasks` tasks
    pub fn from_config(config: &NormalizerConfig, num_tasks: usize) -> Result<Self> {
        Self::new(config.mean.per_task(num_tasks)?, config.std.per_task(num_tasks)?)
    }

    /// Shift and scale as `(1, T, 1, ..)` tensors matching `tensor`'s rank
    fn params(&self, tensor: &Tensor) -> Result<(Tensor, Tensor)> {
        let dims = tensor.dims();
        if dims.len() < 2 || dims[1] != self.mean.len() {
            return Err(Error::shape(format!(
                "normalizer expects a task axis of size {} at dim 1, got {dims:?}",
                self.mean.len()
            )));
        }

        let mut shape = vec![1usize; dims.len()];
        shape[1] = self.mean.len();
        let mean = Tensor::new(self.mean.as_slice(), tensor.device())?
            .to_dtype(tensor.dtype())?
            .reshape(shape.clone())?;
        let std = Tensor::new(self.std.as_slice(), tensor.device())?
            .to_dtype(tensor.dtype())?
            .reshape(shape)?;
        Ok((mean, std))
    }
}

impl Normalizer for TaskNormalizer {
    fn norm(&self, tensor: &Tensor) -> Result<Tensor> {
        let (mean, std) = self.params(tensor)?;
        Ok(tensor.broadcast_sub(&mean)?.broadcast_div(&std)?)
    }

    fn denorm(&self, tensor: &Tensor) -> Result<Tensor> {
        let (mean, std) = self.params(tensor)?;
        Ok(tensor.broadcast_mul(&std)?.broadcast_add(&mean)?)
    }
}

/// Normalizers keyed by target name
#[derive(Debug, Clone, Default)]
pub struct NormalizerSet {
    normalizers: HashMap<String, Arc<dyn Normalizer>>,
}

impl NormalizerSet {
    /// Empty set: every target is used in physical units
    pub fn new() -> Self {
        Self::default()
    }

    /// Build task normalizers from configuration
    pub fn from_config(
        configs: &BTreeMap<String, NormalizerConfig>,
        num_tasks: usize,
    ) -> Result<Self> {
        let mut set = Self::new();
        for (target, config) in configs {
            set.insert(target, TaskNormalizer::from_config(config, num_tasks)?);
        }
        Ok(set)
    }

    /// Register a normalizer for `target`
    pub fn insert(&mut self, target: impl Into<String>, normalizer: impl Normalizer + 'static) {
        self.normalizers.insert(target.into(), Arc::new(normalizer));
    }

    /// Normalizer registered for `target`
    pub fn get(&self, target: &str) -> Option<&Arc<dyn Normalizer>> {
        self.normalizers.get(target)
    }

    /// Number of registered normalizers
    pub fn len(&self) -> usize {
        self.normalizers.len()
    }

    /// Whether no normalizer is registered
    pub fn is_empty(&self) -> bool {
        self.normalizers.is_empty()
    }

    /// Normalize `tensor` if `target` has a normalizer
    pub fn norm(&self, target: &str, tensor: &Tensor) -> Result<Tensor> {
        match self.get(target) {
            Some(normalizer) => normalizer.norm(tensor),
            None => Ok(tensor.clone()),
        }
    }

    /// Denormalize `tensor` if `target` has a normalizer
    pub fn denorm(&self, target: &str, tensor: &Tensor) -> Result<Tensor> {
        match self.get(target) {
            Some(normalizer) => normalizer.denorm(tensor),
            None => Ok(tensor.clone()),
        }
    }

    /// Denormalize every tensor of a target-keyed map
    pub fn denorm_all(&self, tensors: &HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        tensors
            .iter()
            .map(|(target, tensor)| Ok((target.clone(), self.denorm(target, tensor)?)))
            .collect()
    }

    /// Run `f` on a denormalized view of the batch ground truth and the model
    /// outputs. The originals are never modified; the denormalized copies
    /// live only for the duration of the call.
    pub fn with_denormalized<T>(
        &self,
        batch: &MultiTaskBatch,
        outputs: &HashMap<String, Tensor>,
        f: impl FnOnce(&MultiTaskBatch, &HashMap<String, Tensor>) -> Result<T>,
    ) -> Result<T> {
        let denormed_batch = batch.with_targets(self.denorm_all(batch.targets())?);
        let denormed_outputs = self.denorm_all(outputs)?;
        debug!("Denormalized {} outputs for metric computation", denormed_outputs.len());
        f(&denormed_batch, &denormed_outputs)
    }
}
