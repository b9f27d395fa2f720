//! Configuration structures for the multi-task core
//!
//! A [`TrainerConfig`] bundles the multi-task table, the output heads, the
//! declared loss terms and the per-target normalizers. It is validated once,
//! before any tensor work, by [`validate_all_configs`].

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::training::loss::{LossKind, Reduction};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "OCP_MT";

/// Default training metric reset cadence
pub const DEFAULT_PRINT_EVERY: usize = 100;

/// Full configuration of the multi-task core
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainerConfig {
    /// Multi-task table
    pub mt: MultiTaskConfig,
    /// Output heads keyed by target name
    pub outputs: OutputsConfig,
    /// Loss terms, accumulated in declaration order
    pub loss_fns: Vec<LossTermConfig>,
    /// Normalizers keyed by target name
    #[serde(default)]
    pub normalizers: BTreeMap<String, NormalizerConfig>,
    /// Training per-task metrics are reset every `print_every` steps
    #[serde(default = "default_print_every")]
    pub print_every: usize,
}

fn default_print_every() -> usize {
    DEFAULT_PRINT_EVERY
}

/// The fixed set of tasks trained together
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiTaskConfig {
    /// Tasks, indexed by `idx`
    pub tasks: Vec<TaskConfig>,
}

/// A single task of the multi-task run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    /// 0-based task index, unique within the run
    pub idx: usize,
    /// Human readable task name
    pub name: String,
    /// Per-target loss coefficients for this task
    #[serde(default)]
    pub loss_coefficients: BTreeMap<String, f64>,
}

/// Granularity of a model output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    /// One value per structure, shape `(B, T)`
    System,
    /// One vector per atom, shape `(N, T, 3)`
    Atom,
}

/// Output head descriptor for one target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputHeadConfig {
    /// Output granularity
    pub level: OutputLevel,
    /// Restrict atom-level losses to free atoms. Defaults to `true` for atom heads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_on_free_atoms: Option<bool>,
}

/// Output heads keyed by target name
pub type OutputsConfig = BTreeMap<String, OutputHeadConfig>;

/// Declaration of one loss term
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LossTermConfig {
    /// Target the term is computed on
    pub target: String,
    /// Elementwise loss function
    #[serde(rename = "fn", default)]
    pub loss: LossKind,
    /// Reduction applied to the masked loss
    #[serde(default)]
    pub reduction: Reduction,
    /// Global weight of the reduced term
    #[serde(default = "default_coefficient")]
    pub coefficient: f64,
}

fn default_coefficient() -> f64 {
    1.0
}

/// Normalizer parameters for one target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizerConfig {
    /// Shift, either shared or per task
    #[serde(default = "NormValue::zero")]
    pub mean: NormValue,
    /// Scale, either shared or per task
    #[serde(default = "NormValue::one")]
    pub std: NormValue,
}

/// A normalizer parameter shared across tasks or given per task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NormValue {
    /// Same value for every task
    Scalar(f64),
    /// One value per task, in task index order
    PerTask(Vec<f64>),
}

impl NormValue {
    fn zero() -> Self {
        Self::Scalar(0.0)
    }

    fn one() -> Self {
        Self::Scalar(1.0)
    }

    /// Expand to one value per task
    pub fn per_task(&self, num_tasks: usize) -> Result<Vec<f64>> {
        match self {
            Self::Scalar(value) => Ok(vec![*value; num_tasks]),
            Self::PerTask(values) if values.len() == num_tasks => Ok(values.clone()),
            Self::PerTask(values) => Err(Error::config(format!(
                "per-task normalizer has {} values, expected {num_tasks}",
                values.len()
            ))),
        }
    }
}

impl MultiTaskConfig {
    /// Number of configured tasks
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Look a task up by index
    pub fn task_by_idx(&self, idx: usize) -> Option<&TaskConfig> {
        self.tasks.iter().find(|task| task.idx == idx)
    }

    /// Tasks sorted by index
    pub fn tasks_by_idx(&self) -> Vec<&TaskConfig> {
        let mut tasks: Vec<&TaskConfig> = self.tasks.iter().collect();
        tasks.sort_by_key(|task| task.idx);
        tasks
    }
}

impl TaskConfig {
    /// Loss coefficient of `target` for this task, 1.0 when unset
    pub fn loss_coefficient(&self, target: &str) -> f64 {
        self.loss_coefficients.get(target).copied().unwrap_or(1.0)
    }
}

impl OutputHeadConfig {
    /// System-level head
    pub fn system() -> Self {
        Self {
            level: OutputLevel::System,
            train_on_free_atoms: None,
        }
    }

    /// Atom-level head
    pub fn atom(train_on_free_atoms: bool) -> Self {
        Self {
            level: OutputLevel::Atom,
            train_on_free_atoms: Some(train_on_free_atoms),
        }
    }

    /// Whether atom-level losses should only see free atoms
    pub fn trains_on_free_atoms(&self) -> bool {
        self.level == OutputLevel::Atom && self.train_on_free_atoms.unwrap_or(true)
    }
}

impl TrainerConfig {
    /// Load configuration from a JSON, YAML or TOML file, with environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of configured tasks
    pub fn num_tasks(&self) -> usize {
        self.mt.num_tasks()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_all_configs(
            &self.mt,
            &self.outputs,
            &self.loss_fns,
            &self.normalizers,
        )?;

        if self.print_every == 0 {
            return Err(Error::config("print_every must be > 0"));
        }

        Ok(())
    }
}

/// Cross-check the multi-task table, output heads, loss terms and normalizers
pub fn validate_all_configs(
    mt: &MultiTaskConfig,
    outputs: &OutputsConfig,
    loss_fns: &[LossTermConfig],
    normalizers: &BTreeMap<String, NormalizerConfig>,
) -> Result<()> {
    let num_tasks = mt.num_tasks();
    if num_tasks == 0 {
        return Err(Error::config("at least one task must be configured"));
    }

    let mut seen_idx = vec![false; num_tasks];
    let mut seen_names = HashSet::new();
    for task in &mt.tasks {
        if task.idx >= num_tasks || seen_idx[task.idx] {
            return Err(Error::config(format!(
                "task indices must be exactly 0..{num_tasks}, got duplicate or out-of-range idx {}",
                task.idx
            )));
        }
        seen_idx[task.idx] = true;

        if !seen_names.insert(task.name.as_str()) {
            return Err(Error::config(format!("duplicate task name '{}'", task.name)));
        }

        for target in task.loss_coefficients.keys() {
            if !outputs.contains_key(target) {
                return Err(Error::config(format!(
                    "task '{}' sets a loss coefficient for undeclared target '{target}'",
                    task.name
                )));
            }
        }
    }

    for (target, head) in outputs {
        if head.level == OutputLevel::System && head.train_on_free_atoms.is_some() {
            return Err(Error::config(format!(
                "train_on_free_atoms is only valid for atom-level targets, \
                 '{target}' is system-level"
            )));
        }
    }

    if loss_fns.is_empty() {
        return Err(Error::config("at least one loss term must be configured"));
    }

    for term in loss_fns {
        let head = outputs.get(&term.target).ok_or_else(|| {
            Error::config(format!("loss target '{}' is not a declared output", term.target))
        })?;

        if term.reduction == Reduction::StructureWiseMean && head.level != OutputLevel::Atom {
            return Err(Error::config(format!(
                "structure_wise_mean requires an atom-level target, '{}' is {:?}",
                term.target, head.level
            )));
        }

        if !term.coefficient.is_finite() {
            return Err(Error::config(format!(
                "loss coefficient for '{}' must be finite",
                term.target
            )));
        }
    }

    for (target, normalizer) in normalizers {
        if !outputs.contains_key(target) {
            return Err(Error::config(format!(
                "normalizer target '{target}' is not a declared output"
            )));
        }
        normalizer.mean.per_task(num_tasks)?;
        if normalizer.std.per_task(num_tasks)?.iter().any(|std| *std == 0.0) {
            return Err(Error::config(format!(
                "normalizer std for '{target}' must be non-zero"
            )));
        }
    }

    Ok(())
}
