//! The scoring/value backend capability the PPO engine talks to.
//!
//! Out-of-band side effects (checkpoint loading, embedding initialisation,
//! the first checkpoint write) and training steps are all typed commands.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::rollout::Scorer;

/// Adam settings the backend builds or refreshes its optimizer with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub adam_eps: f64,
}

/// Loss coefficients and clipping bounds of one PPO step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PpoHyper {
    pub clip_eps: f64,
    pub entropy_coef: f64,
    pub value_loss_coef: f64,
    pub max_grad_norm: f64,
}

/// One minibatch of stored experience.
#[derive(Debug, Clone)]
pub struct TrainStepPayload {
    pub contexts: Vec<String>,
    pub candidates: Vec<Vec<String>>,
    pub actions: Vec<usize>,
    pub old_values: Vec<f32>,
    pub old_log_probs: Vec<f32>,
    pub advantages: Vec<f32>,
    pub returns: Vec<f32>,
    pub hyper: PpoHyper,
    /// Set on the first minibatch of an update cycle only.
    pub first_call: bool,
    pub number_updates: usize,
    pub template_test: u8,
    /// Where `distrib.csv` is appended.
    pub experiment_path: PathBuf,
    /// Root of the `last/` and `backup/` generations.
    pub checkpoint_dir: PathBuf,
}

/// Initialise embedding weights from `llm_path/model.safetensors`, then
/// write the first `last` generation.
#[derive(Debug, Clone)]
pub struct LoadEmbeddingPayload {
    pub llm_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub optimizer: OptimizerSettings,
}

/// Resume from `last`, falling back to `backup`.
#[derive(Debug, Clone)]
pub struct LoadCheckpointPayload {
    pub checkpoint_dir: PathBuf,
}

/// Write the untrained parameters as the first `last` generation.
#[derive(Debug, Clone)]
pub struct SaveFirstLastPayload {
    pub checkpoint_dir: PathBuf,
    pub optimizer: OptimizerSettings,
}

#[derive(Debug, Clone)]
pub enum UpdateCommand {
    TrainStep(TrainStepPayload),
    LoadEmbedding(LoadEmbeddingPayload),
    LoadCheckpoint(LoadCheckpointPayload),
    SaveFirstLast(SaveFirstLastPayload),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossReport {
    pub loss: f32,
    pub entropy: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    /// Global gradient norm measured before clipping.
    pub grad_norm: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateOutcome {
    Trained(LossReport),
    /// A side-effect command ran (or had already run).
    Applied,
}

pub trait ScoringBackend: Scorer {
    /// Value estimate per context.
    fn value_of(&self, contexts: &[String], candidates: &[Vec<String>]) -> Result<Vec<f32>>;

    fn update(&mut self, command: UpdateCommand) -> Result<UpdateOutcome>;
}
