//! Merging and validation of per-task model outputs
//!
//! Models emit one tensor per target and task under `"{target}_task_{idx}"`.
//! [`OutputMerger`] stacks them along a new task axis (dimension 1) into one
//! tensor per target and checks the resulting layout.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use tracing::{debug, warn};

use crate::config::{OutputHeadConfig, OutputLevel, OutputsConfig};
use crate::error::{Error, Result};

/// Key of the per-task output of `target` for task `idx`
pub fn task_key(target: &str, idx: usize) -> String {
    format!("{target}_task_{idx}")
}

/// Stacks per-task outputs into task-axis tensors and validates their shapes
#[derive(Debug, Clone)]
pub struct OutputMerger {
    targets: Vec<(String, OutputHeadConfig)>,
    num_tasks: usize,
}

impl OutputMerger {
    /// Create a merger for the configured output heads
    pub fn new(outputs: &OutputsConfig, num_tasks: usize) -> Self {
        Self {
            targets: outputs
                .iter()
                .map(|(name, head)| (name.clone(), head.clone()))
                .collect(),
            num_tasks,
        }
    }

    /// Number of tasks the merged outputs are checked against
    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    /// Replace every complete set of `{target}_task_{i}` entries by a single
    /// `target` entry stacked in task index order. Unrelated entries pass
    /// through unchanged.
    pub fn merge(&self, mut outputs: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        for (target, _) in &self.targets {
            let keys: Vec<String> = (0..self.num_tasks).map(|idx| task_key(target, idx)).collect();
            let present = keys.iter().filter(|key| outputs.contains_key(*key)).count();
            if present == 0 {
                continue;
            }
            if present != keys.len() {
                return Err(Error::missing_output(format!(
                    "only {present} of {} per-task outputs for '{target}'",
                    keys.len()
                )));
            }

            let per_task = keys
                .iter()
                .filter_map(|key| outputs.remove(key))
                .collect::<Vec<_>>();
            let merged = Tensor::stack(&per_task, 1)?;
            debug!("Merged '{}' into {:?}", target, merged.dims());
            outputs.insert(target.clone(), merged);
        }
        Ok(outputs)
    }

    /// Check every configured target against its expected layout.
    /// Targets absent from `outputs` are only warned about.
    pub fn validate(&self, outputs: &HashMap<String, Tensor>) -> Result<()> {
        for (target, head) in &self.targets {
            let Some(value) = outputs.get(target) else {
                warn!("Configured target '{}' not present in model outputs", target);
                continue;
            };

            let dims = value.dims();
            match head.level {
                OutputLevel::System => {
                    if dims.len() != 2 || dims[1] != self.num_tasks {
                        return Err(Error::shape(format!(
                            "system output '{target}' has shape {dims:?}, expected (bsz, {})",
                            self.num_tasks
                        )));
                    }
                }
                OutputLevel::Atom => {
                    if dims.len() != 3 || dims[1] != self.num_tasks {
                        return Err(Error::shape(format!(
                            "atom output '{target}' has shape {dims:?}, expected (n_atoms, {}, 3)",
                            self.num_tasks
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Merge then validate
    pub fn merge_and_validate(
        &self,
        outputs: HashMap<String, Tensor>,
    ) -> Result<HashMap<String, Tensor>> {
        let merged = self.merge(outputs)?;
        self.validate(&merged)?;
        Ok(merged)
    }
}

/// Select the entries of a task-axis tensor where `mask` is set.
///
/// `value` is `(rows, T, ..)` and `mask` is `(rows, T)`; the result is
/// `(k, ..)` with the selected entries in row-major order, `k` being the
/// number of set mask entries.
pub fn select_active(value: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (rows, num_tasks) = mask.dims2()?;
    let dims = value.dims();
    if dims.len() < 2 || dims[0] != rows || dims[1] != num_tasks {
        return Err(Error::shape(format!(
            "cannot select {dims:?} with a ({rows}, {num_tasks}) mask"
        )));
    }

    let trailing = &dims[2..];
    let flags = mask.flatten_all()?.to_dtype(DType::U8)?.to_vec1::<u8>()?;
    let indices: Vec<u32> = flags
        .iter()
        .enumerate()
        .filter(|(_, flag)| **flag != 0)
        .map(|(i, _)| i as u32)
        .collect();

    let mut out_shape = vec![indices.len()];
    out_shape.extend_from_slice(trailing);
    if indices.is_empty() {
        return Ok(Tensor::zeros(out_shape, value.dtype(), value.device())?);
    }

    let mut flat_shape = vec![rows * num_tasks];
    flat_shape.extend_from_slice(trailing);
    let flat = value.reshape(flat_shape)?;
    let ids = Tensor::from_vec(indices, (out_shape[0],), value.device())?;
    Ok(flat.index_select(&ids, 0)?)
}

/// Collapse the task axis of `value`, keeping each row's active task.
///
/// System-level outputs use the example mask directly; atom-level outputs use
/// the example mask broadcast to atoms.
pub fn collapse_tasks(
    value: &Tensor,
    level: OutputLevel,
    example_mask: &Tensor,
    atom_mask: &Tensor,
) -> Result<Tensor> {
    match level {
        OutputLevel::System => select_active(value, example_mask),
        OutputLevel::Atom => select_active(value, atom_mask),
    }
}
