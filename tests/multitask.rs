//! End-to-end tests of the multi-task loss and metric pipeline

use std::collections::HashMap;
use std::io::Write;

use approx::assert_relative_eq;
use candle_core::{DType, Device, Tensor, Var};
use test_case::test_case;

use ocp_mt::training::outputs::task_key;
use ocp_mt::training::Phase;
use ocp_mt::{Error, GraphBatch, MultiTaskBatch, MultiTaskModel, MultiTaskTrainer, TrainerConfig};

const CONFIG_YAML: &str = r#"
mt:
  tasks:
    - idx: 0
      name: oc20
      loss_coefficients:
        energy: 1.0
    - idx: 1
      name: omat
outputs:
  energy:
    level: system
  forces:
    level: atom
    train_on_free_atoms: true
loss_fns:
  - target: energy
    fn: mae
    reduction: mean
  - target: forces
    fn: mae
    reduction: mean
normalizers:
  energy:
    mean: [0.0, 1.0]
    std: 2.0
print_every: 5
"#;

/// Task-axis parameters split into per-task outputs on every forward pass
struct LinearHeads {
    energy: Var,
    forces: Var,
}

impl LinearHeads {
    fn zeros(num_examples: usize, num_atoms: usize, device: &Device) -> Self {
        Self {
            energy: Var::zeros((num_examples, 2), DType::F32, device).unwrap(),
            forces: Var::zeros((num_atoms, 2, 3), DType::F32, device).unwrap(),
        }
    }

    fn sgd_step(&self, loss: &Tensor, lr: f64) {
        let grads = loss.backward().unwrap();
        for var in [&self.energy, &self.forces] {
            let grad = grads.get(var.as_tensor()).unwrap();
            let updated = (var.as_tensor() - grad.affine(lr, 0.0).unwrap()).unwrap();
            var.set(&updated).unwrap();
        }
    }
}

impl MultiTaskModel for LinearHeads {
    fn forward(&self, _batch: &MultiTaskBatch) -> ocp_mt::Result<HashMap<String, Tensor>> {
        let mut outputs = HashMap::new();
        for idx in 0..2 {
            outputs.insert(
                task_key("energy", idx),
                self.energy.as_tensor().narrow(1, idx, 1)?.squeeze(1)?,
            );
            outputs.insert(
                task_key("forces", idx),
                self.forces.as_tensor().narrow(1, idx, 1)?.squeeze(1)?,
            );
        }
        Ok(outputs)
    }
}

/// One structure of task 0 with a fixed third atom
fn oc20_part(device: &Device) -> GraphBatch {
    GraphBatch {
        batch: Tensor::new(&[0u32, 0, 0], device).unwrap(),
        fixed: Tensor::new(&[0u8, 0, 1], device).unwrap(),
        task_mask: Tensor::new(&[[1u8, 0]], device).unwrap(),
        task_idx: Tensor::new(&[0u32], device).unwrap(),
        targets: HashMap::from([
            (
                "energy".to_string(),
                Tensor::new(&[[-1.5f32, 0.0]], device).unwrap(),
            ),
            (
                "forces".to_string(),
                Tensor::new(
                    &[
                        [[1.0f32, 0.0, 0.0], [0.0, 0.0, 0.0]],
                        [[0.0, 2.0, 0.0], [0.0, 0.0, 0.0]],
                        [[0.0, 0.0, 3.0], [0.0, 0.0, 0.0]],
                    ],
                    device,
                )
                .unwrap(),
            ),
        ]),
    }
}

/// Two structures of task 1
fn omat_part(device: &Device) -> GraphBatch {
    GraphBatch {
        batch: Tensor::new(&[0u32, 1, 1], device).unwrap(),
        fixed: Tensor::new(&[0u8, 0, 0], device).unwrap(),
        task_mask: Tensor::new(&[[0u8, 1], [0, 1]], device).unwrap(),
        task_idx: Tensor::new(&[1u32, 1], device).unwrap(),
        targets: HashMap::from([
            (
                "energy".to_string(),
                Tensor::new(&[[0.0f32, 2.0], [0.0, 4.0]], device).unwrap(),
            ),
            (
                "forces".to_string(),
                Tensor::new(
                    &[
                        [[0.0f32, 0.0, 0.0], [1.0, 1.0, 1.0]],
                        [[0.0, 0.0, 0.0], [-1.0, -1.0, -1.0]],
                        [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
                    ],
                    device,
                )
                .unwrap(),
            ),
        ]),
    }
}

fn mixed_batch(device: &Device) -> MultiTaskBatch {
    MultiTaskBatch::from_parts(&[oc20_part(device), omat_part(device)], device).unwrap()
}

fn write_config(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn trainer_from_yaml() -> MultiTaskTrainer {
    let file = write_config(CONFIG_YAML, ".yaml");
    let config = TrainerConfig::from_file(file.path()).unwrap();
    MultiTaskTrainer::new(config).unwrap()
}

#[test]
fn test_config_file_round_trip() {
    let trainer = trainer_from_yaml();
    let config = trainer.config();
    assert_eq!(config.num_tasks(), 2);
    assert_eq!(config.print_every, 5);
    assert_eq!(trainer.normalizers().len(), 1);
    assert!(config.outputs["forces"].trains_on_free_atoms());

    let energy = &trainer.loss_fn().terms()[0];
    assert_eq!(energy.coefficients().values(), &[1.0, 1.0]);
}

#[test]
fn test_batch_concatenation_offsets_examples() {
    let device = Device::Cpu;
    let batch = mixed_batch(&device);
    assert_eq!(batch.num_examples(), 3);
    assert_eq!(batch.num_atoms(), 6);
    assert_eq!(batch.batch().to_vec1::<u32>().unwrap(), vec![0, 0, 0, 1, 2, 2]);
    assert_eq!(batch.task_idx().to_vec1::<u32>().unwrap(), vec![0, 1, 1]);
}

#[test]
fn test_initial_loss_uses_normalized_targets_and_free_atoms() {
    let device = Device::Cpu;
    let batch = mixed_batch(&device);
    let model = LinearHeads::zeros(3, 6, &device);
    let mut trainer = trainer_from_yaml();

    let step = trainer.train_step(&model, &batch).unwrap();
    let loss = step.loss.to_dtype(DType::F64).unwrap().to_scalar::<f64>().unwrap();

    // energy in model units: (0.75 + 0.5 + 1.5) / 3; forces: 3.0 over five free atoms
    assert_relative_eq!(loss, 2.75 / 3.0 + 0.6, epsilon = 1e-5);
    assert_relative_eq!(step.metrics["loss"].metric, loss, epsilon = 1e-9);
    // per-task metrics are reported in physical units
    assert_relative_eq!(step.metrics["oc20_energy_mae"].metric, 1.5, epsilon = 1e-6);
    assert_relative_eq!(step.metrics["omat_energy_mae"].metric, 2.0, epsilon = 1e-6);
    assert_relative_eq!(step.metrics["energy_mae"].metric, 5.5 / 3.0, epsilon = 1e-6);
}

#[test]
fn test_gradient_steps_reduce_loss() {
    let device = Device::Cpu;
    let batch = mixed_batch(&device);
    let model = LinearHeads::zeros(3, 6, &device);
    let mut trainer = trainer_from_yaml();

    let mut losses = Vec::new();
    for _ in 0..10 {
        let step = trainer.train_step(&model, &batch).unwrap();
        losses.push(step.loss.to_dtype(DType::F64).unwrap().to_scalar::<f64>().unwrap());
        model.sgd_step(&step.loss, 0.3);
    }

    assert_eq!(trainer.step(), 10);
    assert!(losses[9] < losses[0], "loss did not decrease: {losses:?}");
    // print_every = 5 resets the training accumulators at step 10
    assert_eq!(
        trainer
            .tracker()
            .compute(Phase::Train, ocp_mt::training::metrics::Quantity::Energy, 0),
        Some(0.0)
    );
}

#[test]
fn test_validation_pass_reports_per_task_mae() {
    let device = Device::Cpu;
    let batch = mixed_batch(&device);
    let model = LinearHeads::zeros(3, 6, &device);
    let mut trainer = trainer_from_yaml();

    let metrics = trainer.validate(&model, [&batch, &batch]).unwrap();

    assert_relative_eq!(metrics["task_0_energy_mae"].metric, 1.5, epsilon = 1e-6);
    assert_relative_eq!(metrics["task_1_energy_mae"].metric, 2.0, epsilon = 1e-6);
    assert_relative_eq!(metrics["task_0_forces_mae"].metric, 2.0 / 3.0, epsilon = 1e-6);
    assert_relative_eq!(metrics["task_1_forces_mae"].metric, 2.0 / 3.0, epsilon = 1e-6);
    assert_eq!(metrics["loss"].numel, 2.0);
    assert!(metrics.contains_key("forces_cosine_similarity"));
}

#[test_case("structure_wise_mean", "energy" ; "structure wise mean on system target")]
#[test_case("mean", "stress" ; "undeclared loss target")]
fn test_invalid_loss_term_rejected(reduction: &str, target: &str) {
    let json = format!(
        r#"{{
            "mt": {{"tasks": [{{"idx": 0, "name": "oc20"}}]}},
            "outputs": {{"energy": {{"level": "system"}}}},
            "loss_fns": [{{"target": "{target}", "fn": "mae", "reduction": "{reduction}"}}]
        }}"#
    );
    assert!(matches!(
        TrainerConfig::from_json_str(&json).unwrap_err(),
        Error::Config(_)
    ));
}

#[test]
fn test_unknown_reduction_rejected_from_file() {
    let yaml = CONFIG_YAML.replacen("reduction: mean", "reduction: median", 1);
    let file = write_config(&yaml, ".yaml");
    assert!(TrainerConfig::from_file(file.path()).is_err());
}
