use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use candle_core::{D, Tensor};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::backend::{
    LoadCheckpointPayload, LoadEmbeddingPayload, OptimizerSettings, PpoHyper,
    SaveFirstLastPayload, ScoringBackend, TrainStepPayload, UpdateCommand, UpdateOutcome,
};
use crate::checkpoint::GenerationalCheckpoint;
use crate::config::PpoConfig;
use crate::env::VecEnv;
use crate::eval::generate_trajectories;
use crate::experience::ExperienceBuffer;
use crate::prompt::PromptModifier;
use crate::reward::RewardShaping;
use crate::rollout::{EpisodeLog, RolloutDriver, Selection};
use crate::trainer::{Algo, UpdateLogs};

// =============================================================================
// Loss
// =============================================================================

/// Stored quantities of a minibatch, all `(batch,)`.
pub struct PpoTargets {
    pub old_log_probs: Tensor,
    pub advantages: Tensor,
    pub old_values: Tensor,
    pub returns: Tensor,
}

pub struct PpoLosses {
    pub loss: Tensor,
    pub policy_loss: Tensor,
    pub value_loss: Tensor,
    pub entropy: Tensor,
}

/// Log-probability of `actions` (u32, `(batch,)`) under a categorical over
/// `logits` (`(batch, n)`), and the mean entropy.
pub fn categorical(logits: &Tensor, actions: &Tensor) -> Result<(Tensor, Tensor)> {
    let log_p = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let p = log_p.exp()?;
    let entropy = (p * &log_p)?.sum(D::Minus1)?.neg()?.mean_all()?;
    let log_prob = log_p.gather(&actions.unsqueeze(1)?, 1)?.squeeze(1)?;
    Ok((log_prob, entropy))
}

/// Clipped surrogate, clipped value loss and entropy bonus.
///
/// A `log_prob` of rank > 1 is summed over its last dimension first.
pub fn ppo_loss(
    log_prob: &Tensor,
    entropy: &Tensor,
    values: &Tensor,
    targets: &PpoTargets,
    hyper: &PpoHyper,
) -> Result<PpoLosses> {
    let log_prob = if log_prob.rank() > 1 {
        log_prob.sum(D::Minus1)?
    } else {
        log_prob.clone()
    };
    let eps = hyper.clip_eps;

    let ratio = (log_prob - &targets.old_log_probs)?.exp()?;
    let surr1 = (&ratio * &targets.advantages)?;
    let surr2 = (ratio.clamp(1.0 - eps, 1.0 + eps)? * &targets.advantages)?;
    let policy_loss = surr1.minimum(&surr2)?.mean_all()?.neg()?;

    let value_clipped = (&targets.old_values + (values - &targets.old_values)?.clamp(-eps, eps)?)?;
    let surr_v1 = (values - &targets.returns)?.sqr()?;
    let surr_v2 = (value_clipped - &targets.returns)?.sqr()?;
    let value_loss = surr_v1.maximum(&surr_v2)?.mean_all()?;

    let loss = ((&policy_loss - (entropy * hyper.entropy_coef)?)?
        + (&value_loss * hyper.value_loss_coef)?)?;
    Ok(PpoLosses {
        loss,
        policy_loss,
        value_loss,
        entropy: entropy.clone(),
    })
}

// =============================================================================
// Backend bootstrap
// =============================================================================

/// Brings a backend to its starting state: resume `last` when it exists,
/// else create both generations and either load pretrained embeddings or
/// write the untrained parameters as the first `last`.
pub fn bootstrap_backend<B: ScoringBackend + ?Sized>(
    backend: &mut B,
    checkpoint_dir: &Path,
    pretrained: bool,
    load_embedding: bool,
    llm_path: &Path,
    optimizer: OptimizerSettings,
) -> Result<()> {
    let generations = GenerationalCheckpoint::new(checkpoint_dir);
    let command = if generations.has_last() {
        tracing::info!(dir = %checkpoint_dir.display(), "resuming fine-tuned parameters");
        UpdateCommand::LoadCheckpoint(LoadCheckpointPayload {
            checkpoint_dir: checkpoint_dir.to_path_buf(),
        })
    } else {
        generations.create_dirs()?;
        if !pretrained && load_embedding {
            UpdateCommand::LoadEmbedding(LoadEmbeddingPayload {
                llm_path: llm_path.to_path_buf(),
                checkpoint_dir: checkpoint_dir.to_path_buf(),
                optimizer,
            })
        } else {
            UpdateCommand::SaveFirstLast(SaveFirstLastPayload {
                checkpoint_dir: checkpoint_dir.to_path_buf(),
                optimizer,
            })
        }
    };
    backend.update(command)?;
    Ok(())
}

// =============================================================================
// PPO agent
// =============================================================================

pub struct PpoAgent<E: VecEnv, B: ScoringBackend> {
    driver: RolloutDriver<E>,
    backend: B,
    buffer: ExperienceBuffer,
    shaping: RewardShaping,
    config: PpoConfig,
    checkpoint_dir: PathBuf,
    experiment_path: PathBuf,
    rng: SmallRng,
}

impl<E: VecEnv, B: ScoringBackend> PpoAgent<E, B> {
    pub fn new(
        driver: RolloutDriver<E>,
        backend: B,
        shaping: RewardShaping,
        config: PpoConfig,
        checkpoint_dir: PathBuf,
        experiment_path: PathBuf,
        seed: u64,
    ) -> Result<Self> {
        if config.frames_per_proc == 0 {
            bail!("frames_per_proc must be positive");
        }
        let buffer = ExperienceBuffer::new(driver.n_envs(), config.frames_per_proc);
        Ok(Self {
            driver,
            backend,
            buffer,
            shaping,
            config,
            checkpoint_dir,
            experiment_path,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn driver(&self) -> &RolloutDriver<E> {
        &self.driver
    }

    pub fn buffer(&self) -> &ExperienceBuffer {
        &self.buffer
    }

    pub fn hyper(&self) -> PpoHyper {
        PpoHyper {
            clip_eps: self.config.clip_eps,
            entropy_coef: self.config.entropy_coef,
            value_loss_coef: self.config.value_loss_coef,
            max_grad_norm: self.config.max_grad_norm,
        }
    }

    /// Fills the buffer with `frames_per_proc` sampled ticks and computes
    /// advantages against the values of the prompts that follow.
    pub fn collect_experiences(&mut self) -> Result<usize> {
        self.buffer.clear();
        let mut episodes_done = 0;
        for _ in 0..self.config.frames_per_proc {
            let rec = self
                .driver
                .tick(&self.backend, Selection::Sample, &self.shaping, &mut self.rng)?;
            if rec.scores.iter().any(|s| s.value.is_none()) {
                bail!("backend returned scores without value estimates");
            }
            episodes_done += rec.episodes_done;
            self.buffer.push_tick(&rec)?;
        }
        let next_values = self
            .backend
            .value_of(&self.driver.prompts(), self.driver.subgoals())?;
        self.buffer.compute_advantages(
            &next_values,
            self.config.discount as f32,
            self.config.gae_lambda as f32,
        )?;
        Ok(episodes_done)
    }

    pub fn evaluate(&mut self, n_tests: usize, modifier: Option<PromptModifier>) -> Result<EpisodeLog> {
        generate_trajectories(
            &mut self.driver,
            &self.backend,
            &self.shaping,
            n_tests,
            modifier,
            Selection::Sample,
            &mut self.rng,
        )
    }

    fn minibatch(&self, indices: &[usize], first_call: bool, number_updates: usize) -> TrainStepPayload {
        let n_envs = self.buffer.n_envs();
        let b = &self.buffer;
        TrainStepPayload {
            contexts: indices.iter().map(|&i| b.prompts[i].clone()).collect(),
            candidates: indices
                .iter()
                .map(|&i| self.driver.subgoals()[i % n_envs].clone())
                .collect(),
            actions: indices.iter().map(|&i| b.actions[i]).collect(),
            old_values: indices.iter().map(|&i| b.values[i]).collect(),
            old_log_probs: indices.iter().map(|&i| b.log_probs[i]).collect(),
            advantages: indices.iter().map(|&i| b.advantages[i]).collect(),
            returns: indices.iter().map(|&i| b.returns[i]).collect(),
            hyper: self.hyper(),
            first_call,
            number_updates,
            template_test: self.config.template_test,
            experiment_path: self.experiment_path.clone(),
            checkpoint_dir: self.checkpoint_dir.clone(),
        }
    }
}

impl<E: VecEnv, B: ScoringBackend> Algo for PpoAgent<E, B> {
    fn update_parameters(&mut self, number_updates: usize) -> Result<UpdateLogs> {
        let episodes_done = self.collect_experiences()?;

        let mut reports = Vec::new();
        let mut first_call = true;
        let mut indices: Vec<usize> = (0..self.buffer.len()).collect();
        for _ in 0..self.config.epochs {
            indices.shuffle(&mut self.rng);
            for chunk in indices.chunks(self.config.batch_size) {
                let payload = self.minibatch(chunk, first_call, number_updates);
                first_call = false;
                match self.backend.update(UpdateCommand::TrainStep(payload))? {
                    UpdateOutcome::Trained(report) => reports.push(report),
                    UpdateOutcome::Applied => bail!("backend did not train on a TrainStep"),
                }
            }
        }

        let n = reports.len().max(1) as f32;
        let mean = |f: fn(&crate::backend::LossReport) -> f32| reports.iter().map(f).sum::<f32>() / n;
        Ok(UpdateLogs {
            episodes: self.driver.take_log(),
            num_frames: self.buffer.len(),
            episodes_done,
            entropy: mean(|r| r.entropy),
            policy_loss: mean(|r| r.policy_loss),
            value_loss: mean(|r| r.value_loss),
            loss: mean(|r| r.loss),
            grad_norm: mean(|r| r.grad_norm),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn hyper() -> PpoHyper {
        PpoHyper {
            clip_eps: 0.2,
            entropy_coef: 0.01,
            value_loss_coef: 0.5,
            max_grad_norm: 0.5,
        }
    }

    fn t(v: &[f32]) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_ratio_one_reduces_to_mean_advantage() {
        let logits = Tensor::new(&[[0.2f32, 1.0, -0.5], [0.0, 0.3, 0.1]], &Device::Cpu).unwrap();
        let actions = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();
        let (log_prob, entropy) = categorical(&logits, &actions).unwrap();
        let targets = PpoTargets {
            old_log_probs: log_prob.clone(),
            advantages: t(&[1.5, -0.5]),
            old_values: t(&[0.0, 0.0]),
            returns: t(&[0.0, 0.0]),
        };
        let losses = ppo_loss(&log_prob, &entropy, &t(&[0.0, 0.0]), &targets, &hyper()).unwrap();
        let policy: f32 = losses.policy_loss.to_scalar().unwrap();
        assert!((policy - (-0.5)).abs() < 1e-6);
        let value: f32 = losses.value_loss.to_scalar().unwrap();
        assert_eq!(value, 0.0);
    }

    #[test]
    fn test_ratio_is_clipped() {
        // ratio = e^1 > 1.2 with a positive advantage: the clipped term wins
        let targets = PpoTargets {
            old_log_probs: t(&[-2.0]),
            advantages: t(&[1.0]),
            old_values: t(&[0.0]),
            returns: t(&[0.0]),
        };
        let losses = ppo_loss(&t(&[-1.0]), &t(&[0.0]).sum_all().unwrap(), &t(&[0.0]), &targets, &hyper())
            .unwrap();
        let policy: f32 = losses.policy_loss.to_scalar().unwrap();
        assert!((policy + 1.2).abs() < 1e-6);
    }

    #[test]
    fn test_value_loss_takes_clipped_max() {
        // V moves 1.0 away from V_old but is clipped to 0.2 for the second term
        let targets = PpoTargets {
            old_log_probs: t(&[0.0]),
            advantages: t(&[0.0]),
            old_values: t(&[0.0]),
            returns: t(&[1.0]),
        };
        let losses = ppo_loss(&t(&[0.0]), &t(&[0.0]).sum_all().unwrap(), &t(&[1.0]), &targets, &hyper())
            .unwrap();
        let value: f32 = losses.value_loss.to_scalar().unwrap();
        // max(0^2, (0.2 - 1)^2)
        assert!((value - 0.64).abs() < 1e-6);
    }

    #[test]
    fn test_multi_dimensional_log_probs_are_summed() {
        let log_prob = Tensor::new(&[[-0.5f32, -0.25], [-1.0, 0.0]], &Device::Cpu).unwrap();
        let targets = PpoTargets {
            old_log_probs: t(&[-0.75, -1.0]),
            advantages: t(&[2.0, 4.0]),
            old_values: t(&[0.0, 0.0]),
            returns: t(&[0.0, 0.0]),
        };
        let losses = ppo_loss(&log_prob, &t(&[0.0]).sum_all().unwrap(), &t(&[0.0, 0.0]), &targets, &hyper())
            .unwrap();
        let policy: f32 = losses.policy_loss.to_scalar().unwrap();
        assert!((policy + 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_total_combines_terms() {
        let targets = PpoTargets {
            old_log_probs: t(&[0.0]),
            advantages: t(&[1.0]),
            old_values: t(&[0.0]),
            returns: t(&[0.1]),
        };
        let entropy = t(&[0.7]).sum_all().unwrap();
        let losses = ppo_loss(&t(&[0.0]), &entropy, &t(&[0.0]), &targets, &hyper()).unwrap();
        let total: f32 = losses.loss.to_scalar().unwrap();
        let expected = -1.0 - 0.01 * 0.7 + 0.5 * 0.01;
        assert!((total - expected).abs() < 1e-6);
    }

    #[test]
    fn test_entropy_of_uniform() {
        let logits = Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let actions = Tensor::new(&[0u32, 3], &Device::Cpu).unwrap();
        let (log_prob, entropy) = categorical(&logits, &actions).unwrap();
        let e: f32 = entropy.to_scalar().unwrap();
        assert!((e - 4f32.ln()).abs() < 1e-6);
        let lp: Vec<f32> = log_prob.to_vec1().unwrap();
        assert!(lp.iter().all(|l| (l + 4f32.ln()).abs() < 1e-6));
    }
}
