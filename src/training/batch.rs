//! Multi-task batches of atomic graphs
//!
//! The multi-task sampler yields one [`GraphBatch`] per task partition. They
//! are concatenated into a single [`MultiTaskBatch`]: system-level tensors
//! along the example axis, atom-level tensors along the atom axis.

use std::collections::{BTreeSet, HashMap};

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{Error, Result};

/// One collated sub-batch as produced by the data pipeline
#[derive(Debug, Clone)]
pub struct GraphBatch {
    /// Atom to example index, `(N,)`
    pub batch: Tensor,
    /// 1 for fixed atoms, 0 for free atoms, `(N,)`
    pub fixed: Tensor,
    /// Which tasks each example carries a label for, `(B, T)`
    pub task_mask: Tensor,
    /// Nominal task of each example, `(B,)`
    pub task_idx: Tensor,
    /// One-hot ground truth keyed by target name, `(B, T)` or `(N, T, 3)`
    pub targets: HashMap<String, Tensor>,
}

/// Concatenation of all sub-batches of one step
#[derive(Debug, Clone)]
pub struct MultiTaskBatch {
    batch: Tensor,
    fixed: Tensor,
    task_mask: Tensor,
    task_idx: Tensor,
    targets: HashMap<String, Tensor>,
    num_examples: usize,
    num_tasks: usize,
}

impl MultiTaskBatch {
    /// Concatenate sub-batches onto `device`.
    ///
    /// Each part's atom to example index is offset by the number of examples
    /// of the parts before it.
    pub fn from_parts(parts: &[GraphBatch], device: &Device) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| Error::invalid_input("cannot build a batch from zero parts"))?;
        let num_tasks = first.task_mask.dims2()?.1;
        let target_names: BTreeSet<&String> = first.targets.keys().collect();

        let mut batch_idx: Vec<u32> = Vec::new();
        let mut fixed = Vec::with_capacity(parts.len());
        let mut task_mask = Vec::with_capacity(parts.len());
        let mut task_idx = Vec::with_capacity(parts.len());
        let mut targets: HashMap<String, Vec<Tensor>> = HashMap::new();
        let mut offset = 0usize;

        for (i, part) in parts.iter().enumerate() {
            let (num_examples, part_tasks) = part.task_mask.dims2()?;
            if part_tasks != num_tasks {
                return Err(Error::shape(format!(
                    "part {i} has a task mask with {part_tasks} tasks, expected {num_tasks}"
                )));
            }
            if part.task_idx.dims1()? != num_examples {
                return Err(Error::shape(format!(
                    "part {i} has {} task indices for {num_examples} examples",
                    part.task_idx.dims1()?
                )));
            }

            let atoms = part.batch.to_dtype(DType::U32)?.to_vec1::<u32>()?;
            if part.fixed.dims1()? != atoms.len() {
                return Err(Error::shape(format!(
                    "part {i} has {} fixed flags for {} atoms",
                    part.fixed.dims1()?,
                    atoms.len()
                )));
            }
            if let Some(bad) = atoms.iter().find(|&&b| b as usize >= num_examples) {
                return Err(Error::invalid_input(format!(
                    "part {i} maps an atom to example {bad}, but has only {num_examples} examples"
                )));
            }

            let part_names: BTreeSet<&String> = part.targets.keys().collect();
            if part_names != target_names {
                return Err(Error::invalid_input(format!(
                    "part {i} carries targets {part_names:?}, expected {target_names:?}"
                )));
            }

            batch_idx.extend(atoms.iter().map(|&b| b + offset as u32));
            fixed.push(part.fixed.to_dtype(DType::U8)?.to_device(device)?);
            task_mask.push(part.task_mask.to_dtype(DType::U8)?.to_device(device)?);
            task_idx.push(part.task_idx.to_dtype(DType::U32)?.to_device(device)?);
            for (name, tensor) in &part.targets {
                targets
                    .entry(name.clone())
                    .or_default()
                    .push(tensor.to_device(device)?);
            }
            offset += num_examples;
        }

        let num_atoms = batch_idx.len();
        let batch = Tensor::from_vec(batch_idx, (num_atoms,), device)?;
        let targets = targets
            .into_iter()
            .map(|(name, tensors)| Ok((name, Tensor::cat(&tensors, 0)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        debug!(
            "Concatenated {} parts into {} examples / {} atoms",
            parts.len(),
            offset,
            num_atoms
        );

        Ok(Self {
            batch,
            fixed: Tensor::cat(&fixed, 0)?,
            task_mask: Tensor::cat(&task_mask, 0)?,
            task_idx: Tensor::cat(&task_idx, 0)?,
            targets,
            num_examples: offset,
            num_tasks,
        })
    }

    /// Atom to example index, `U32` `(N,)`
    pub fn batch(&self) -> &Tensor {
        &self.batch
    }

    /// Fixed-atom flags, `U8` `(N,)`
    pub fn fixed(&self) -> &Tensor {
        &self.fixed
    }

    /// Example-level task mask, `U8` `(B, T)`
    pub fn task_mask(&self) -> &Tensor {
        &self.task_mask
    }

    /// Nominal task of each example, `U32` `(B,)`
    pub fn task_idx(&self) -> &Tensor {
        &self.task_idx
    }

    /// Number of examples `B`
    pub fn num_examples(&self) -> usize {
        self.num_examples
    }

    /// Number of atoms `N`
    pub fn num_atoms(&self) -> usize {
        self.batch.dims()[0]
    }

    /// Task mask width `T`
    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    /// Ground truth of `target` in one-hot task layout
    pub fn target(&self, target: &str) -> Result<&Tensor> {
        self.targets
            .get(target)
            .ok_or_else(|| Error::missing_target(format!("{target}_onehot")))
    }

    /// Whether a ground truth for `target` is present
    pub fn has_target(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    /// All ground-truth tensors
    pub fn targets(&self) -> &HashMap<String, Tensor> {
        &self.targets
    }

    /// Same batch with the ground-truth tensors replaced
    pub fn with_targets(&self, targets: HashMap<String, Tensor>) -> Self {
        Self {
            targets,
            ..self.clone()
        }
    }

    /// Task mask broadcast to atoms through the atom to example index, `U8` `(N, T)`
    pub fn atom_task_mask(&self) -> Result<Tensor> {
        Ok(self.task_mask.index_select(&self.batch, 0)?)
    }

    /// 1 for atoms that are not fixed, `U8` `(N,)`
    pub fn free_mask(&self) -> Result<Tensor> {
        Ok(self.fixed.eq(0u8)?)
    }

    /// Examples whose nominal task is `idx`, `U8` `(B,)`
    pub fn examples_of_task(&self, idx: usize) -> Result<Tensor> {
        Ok(self.task_idx.eq(idx as u32)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two structures of two atoms each, the first labelled for task 0 and
    /// the second for task 1. Atom 1 is fixed.
    pub(crate) fn two_task_part(device: &Device) -> GraphBatch {
        GraphBatch {
            batch: Tensor::new(&[0u32, 0, 1, 1], device).unwrap(),
            fixed: Tensor::new(&[0u8, 1, 0, 0], device).unwrap(),
            task_mask: Tensor::new(&[[1u8, 0], [0, 1]], device).unwrap(),
            task_idx: Tensor::new(&[0u32, 1], device).unwrap(),
            targets: HashMap::from([
                (
                    "energy".to_string(),
                    Tensor::new(&[[1.0f32, 0.0], [0.0, 2.0]], device).unwrap(),
                ),
                (
                    "forces".to_string(),
                    Tensor::new(
                        &[
                            [[1.0f32, 0.0, 0.0], [0.0, 0.0, 0.0]],
                            [[0.0, 1.0, 0.0], [0.0, 0.0, 0.0]],
                            [[0.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
                            [[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]],
                        ],
                        device,
                    )
                    .unwrap(),
                ),
            ]),
        }
    }

    #[test]
    fn test_concatenation_offsets_batch_index() {
        let device = Device::Cpu;
        let part = two_task_part(&device);
        let batch = MultiTaskBatch::from_parts(&[part.clone(), part], &device).unwrap();

        assert_eq!(batch.num_examples(), 4);
        assert_eq!(batch.num_atoms(), 8);
        assert_eq!(batch.num_tasks(), 2);
        assert_eq!(
            batch.batch().to_vec1::<u32>().unwrap(),
            vec![0, 0, 1, 1, 2, 2, 3, 3]
        );
        assert_eq!(batch.target("energy").unwrap().dims(), &[4, 2]);
        assert_eq!(batch.target("forces").unwrap().dims(), &[8, 2, 3]);
    }

    #[test]
    fn test_atom_task_mask_and_free_mask() {
        let device = Device::Cpu;
        let batch = MultiTaskBatch::from_parts(&[two_task_part(&device)], &device).unwrap();

        let atom_mask = batch.atom_task_mask().unwrap().to_vec2::<u8>().unwrap();
        assert_eq!(atom_mask, vec![vec![1, 0], vec![1, 0], vec![0, 1], vec![0, 1]]);

        let free = batch.free_mask().unwrap().to_vec1::<u8>().unwrap();
        assert_eq!(free, vec![1, 0, 1, 1]);

        let task_one = batch.examples_of_task(1).unwrap().to_vec1::<u8>().unwrap();
        assert_eq!(task_one, vec![0, 1]);
    }

    #[test]
    fn test_missing_target_reports_onehot_key() {
        let device = Device::Cpu;
        let batch = MultiTaskBatch::from_parts(&[two_task_part(&device)], &device).unwrap();
        let err = batch.target("stress").unwrap_err();
        assert!(err.to_string().contains("stress_onehot"));
    }

    #[test]
    fn test_rejects_out_of_range_batch_index() {
        let device = Device::Cpu;
        let mut part = two_task_part(&device);
        part.batch = Tensor::new(&[0u32, 0, 1, 2], &device).unwrap();
        assert!(MultiTaskBatch::from_parts(&[part], &device).is_err());
    }

    #[test]
    fn test_rejects_mismatched_targets() {
        let device = Device::Cpu;
        let first = two_task_part(&device);
        let mut second = two_task_part(&device);
        second.targets.remove("forces");
        assert!(MultiTaskBatch::from_parts(&[first, second], &device).is_err());
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert!(MultiTaskBatch::from_parts(&[], &Device::Cpu).is_err());
    }
}
