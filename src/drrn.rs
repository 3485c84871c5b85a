use std::path::PathBuf;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{ParamsAdamW, VarBuilder, VarMap};
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::checkpoint::DrrnCheckpoint;
use crate::config::DrrnConfig;
use crate::context::ExecContext;
use crate::encoder::Encoder;
use crate::env::VecEnv;
use crate::eval::generate_trajectories;
use crate::model::DrrnNet;
use crate::optim::{AdamW, clip_grad_norm};
use crate::prompt::PromptModifier;
use crate::replay::{PrioritizedReplay, TokenState};
use crate::reward::RewardShaping;
use crate::rollout::{EpisodeLog, RolloutDriver, Scored, Scorer, Selection};
use crate::trainer::{Algo, UpdateLogs};

// =============================================================================
// Network as a scorer
// =============================================================================

/// Scores prompts with a [`DrrnNet`]; the Q-values are the logits.
pub struct QScorer<'a> {
    pub net: &'a DrrnNet,
    pub encoder: &'a dyn Encoder,
}

impl Scorer for QScorer<'_> {
    fn score(&self, contexts: &[String], candidates: &[Vec<String>]) -> Result<Vec<Scored>> {
        let states: Vec<Vec<u32>> = contexts.iter().map(|c| self.encoder.encode(c)).collect();
        let acts = encode_candidates(self.encoder, candidates);
        let state_refs: Vec<&[u32]> = states.iter().map(|s| s.as_slice()).collect();
        let act_refs: Vec<&[Vec<u32>]> = acts.iter().map(|a| a.as_slice()).collect();
        self.net
            .forward(&state_refs, &act_refs)?
            .into_iter()
            .map(|q| {
                Ok(Scored {
                    logits: q.to_vec1::<f32>()?,
                    value: None,
                })
            })
            .collect()
    }
}

pub fn encode_candidates(encoder: &dyn Encoder, candidates: &[Vec<String>]) -> Vec<Vec<Vec<u32>>> {
    candidates
        .iter()
        .map(|cands| cands.iter().map(|c| encoder.encode(c)).collect())
        .collect()
}

// =============================================================================
// DRRN agent
// =============================================================================

pub struct DrrnAgent<E: VecEnv> {
    varmap: VarMap,
    net: DrrnNet,
    optimizer: AdamW,
    memory: PrioritizedReplay,
    driver: RolloutDriver<E>,
    encoder: Box<dyn Encoder>,
    encoded_actions: Vec<Vec<Vec<u32>>>,
    shaping: RewardShaping,
    checkpoint: DrrnCheckpoint,
    device: Device,
    gamma: f64,
    batch_size: usize,
    clip: f64,
    memory_size: usize,
    priority_fraction: f64,
    max_steps: usize,
    save_frequency: usize,
    inner_counter: usize,
    last_loss: f32,
    rng: SmallRng,
}

impl<E: VecEnv> DrrnAgent<E> {
    pub fn new(
        ctx: &ExecContext,
        driver: RolloutDriver<E>,
        encoder: Box<dyn Encoder>,
        shaping: RewardShaping,
        config: &DrrnConfig,
        checkpoint_dir: PathBuf,
        seed: u64,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &ctx.device);
        let net = DrrnNet::new(vb, encoder.vocab_size(), config.embedding_dim, config.hidden_dim)?;
        let optimizer = AdamW::from_varmap(
            &varmap,
            ParamsAdamW {
                lr: config.lr,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        let encoded_actions = encode_candidates(encoder.as_ref(), driver.subgoals());
        let max_steps = config.max_steps.unwrap_or(driver.n_envs() * 4);
        Ok(Self {
            varmap,
            net,
            optimizer,
            memory: PrioritizedReplay::new(config.memory_size, config.priority_fraction),
            driver,
            encoder,
            encoded_actions,
            shaping,
            checkpoint: DrrnCheckpoint::new(checkpoint_dir),
            device: ctx.device.clone(),
            gamma: config.gamma,
            batch_size: config.batch_size,
            clip: config.clip,
            memory_size: config.memory_size,
            priority_fraction: config.priority_fraction,
            max_steps,
            save_frequency: config.save_frequency,
            inner_counter: 0,
            last_loss: 0.0,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn memory(&self) -> &PrioritizedReplay {
        &self.memory
    }

    pub fn driver(&self) -> &RolloutDriver<E> {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut RolloutDriver<E> {
        &mut self.driver
    }

    pub fn net(&self) -> &DrrnNet {
        &self.net
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn checkpoint(&self) -> &DrrnCheckpoint {
        &self.checkpoint
    }

    pub fn last_loss(&self) -> f32 {
        self.last_loss
    }

    pub fn scorer(&self) -> QScorer<'_> {
        QScorer {
            net: &self.net,
            encoder: self.encoder.as_ref(),
        }
    }

    /// Stores one regular-priority transition.
    pub fn observe(
        &mut self,
        state: TokenState,
        action: Vec<u32>,
        reward: f32,
        next_state: TokenState,
        next_actions: Vec<Vec<u32>>,
        done: bool,
    ) {
        self.memory
            .push(false, state, action, reward, next_state, next_actions, done);
    }

    /// One gradient step on a sampled batch; `None` while the memory holds
    /// less than a batch.
    pub fn update(&mut self) -> Result<Option<f32>> {
        let Some(batch) = self.memory.sample(self.batch_size, &mut self.rng) else {
            return Ok(None);
        };
        let n = batch.len();

        // max_a' Q(s', a'), zeroed on terminal transitions
        let next_states: Vec<&[u32]> = batch.iter().map(|t| t.next_state.ids()).collect();
        let next_acts: Vec<&[Vec<u32>]> = batch.iter().map(|t| t.next_actions.as_slice()).collect();
        let next_q = self
            .net
            .forward(&next_states, &next_acts)?
            .iter()
            .map(|q| q.max(0))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let next_q = Tensor::stack(&next_q, 0)?.detach();
        let not_done: Vec<f32> = batch.iter().map(|t| if t.done { 0.0 } else { 1.0 }).collect();
        let not_done = Tensor::from_vec(not_done, n, &self.device)?;
        let rewards: Vec<f32> = batch.iter().map(|t| t.reward).collect();
        let rewards = Tensor::from_vec(rewards, n, &self.device)?;
        let target = rewards.add(&next_q.mul(&not_done)?.affine(self.gamma, 0.0)?)?;

        // Q(s, a) with the taken action as the only candidate
        let states: Vec<&[u32]> = batch.iter().map(|t| t.state.ids()).collect();
        let taken: Vec<Vec<Vec<u32>>> = batch.iter().map(|t| vec![t.action.clone()]).collect();
        let taken: Vec<&[Vec<u32>]> = taken.iter().map(|a| a.as_slice()).collect();
        let q = Tensor::cat(&self.net.forward(&states, &taken)?, 0)?;

        // Huber: 0.5*d^2 where |d| < 1, |d| - 0.5 elsewhere
        let diff = q.sub(&target.detach())?;
        let abs_diff = diff.abs()?;
        let ones = Tensor::ones_like(&abs_diff)?;
        let loss = abs_diff
            .lt(&ones)?
            .where_cond(&diff.sqr()?.affine(0.5, 0.0)?, &abs_diff.affine(1.0, -0.5)?)?
            .mean_all()?;

        let mut grads = loss.backward()?;
        let vars = self.optimizer.vars();
        clip_grad_norm(&mut grads, &vars, self.clip)?;
        self.optimizer.step(&grads)?;

        Ok(Some(loss.to_scalar::<f32>()?))
    }

    pub fn save(&self) -> Result<()> {
        self.checkpoint
            .save(&self.varmap, &self.optimizer, &self.memory)
    }

    /// Test episodes with the current Q-network; nothing is stored or learned.
    pub fn evaluate(&mut self, n_tests: usize, modifier: Option<PromptModifier>) -> Result<EpisodeLog> {
        let scorer = QScorer {
            net: &self.net,
            encoder: self.encoder.as_ref(),
        };
        generate_trajectories(
            &mut self.driver,
            &scorer,
            &self.shaping,
            n_tests,
            modifier,
            Selection::Sample,
            &mut self.rng,
        )
    }

    /// Restores weights (fatal), memory and optimizer (fresh on failure).
    pub fn load(&mut self) -> Result<()> {
        self.memory = match self.checkpoint.load(&mut self.varmap, &mut self.optimizer)? {
            Some(memory) => memory,
            None => PrioritizedReplay::new(self.memory_size, self.priority_fraction),
        };
        Ok(())
    }
}

impl<E: VecEnv> Algo for DrrnAgent<E> {
    /// `max_steps / n_envs` sampled ticks, then one update.
    fn update_parameters(&mut self, _number_updates: usize) -> Result<UpdateLogs> {
        let ticks = self.max_steps / self.driver.n_envs();
        let mut episodes_done = 0;
        for _ in 0..ticks {
            let scorer = QScorer {
                net: &self.net,
                encoder: self.encoder.as_ref(),
            };
            let rec = self
                .driver
                .tick(&scorer, Selection::Sample, &self.shaping, &mut self.rng)?;
            episodes_done += rec.episodes_done;

            for j in 0..rec.actions.len() {
                let state = TokenState(self.encoder.encode(&rec.prompts[j]));
                let next_state = TokenState(self.encoder.encode(&rec.next_prompts[j]));
                let action = self.encoded_actions[j][rec.actions[j]].clone();
                let next_actions = self.encoded_actions[j].clone();
                self.observe(
                    state,
                    action,
                    rec.reshaped[j].total,
                    next_state,
                    next_actions,
                    rec.dones[j],
                );
            }
        }

        let loss = self.update()?;
        self.inner_counter += 1;
        if self.save_frequency > 0 && self.inner_counter % self.save_frequency == 0 {
            self.save()?;
        }
        match loss {
            Some(loss) => self.last_loss = loss,
            None => tracing::debug!(
                stored = self.memory.len(),
                batch_size = self.batch_size,
                "not enough transitions, update skipped"
            ),
        }

        Ok(UpdateLogs {
            episodes: self.driver.take_log(),
            num_frames: self.max_steps,
            episodes_done,
            loss: self.last_loss,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{MEMORY_FILE, MODEL_FILE, OPTIMIZER_FILE};
    use crate::encoder::HashingEncoder;
    use crate::env::{ScriptedEnv, ScriptedTask};

    fn config(batch_size: usize, save_frequency: usize) -> DrrnConfig {
        DrrnConfig {
            batch_size,
            memory_size: 100,
            embedding_dim: 8,
            hidden_dim: 16,
            lr: 1e-3,
            save_frequency,
            ..Default::default()
        }
    }

    fn agent(dir: PathBuf, batch_size: usize, save_frequency: usize) -> DrrnAgent<ScriptedEnv> {
        let env = ScriptedEnv::new(vec![
            ScriptedTask::per_action("go to the ball", 3, vec![1.0, 0.0]),
            ScriptedTask::per_action("go to the ball", 3, vec![1.0, 0.0]),
        ])
        .unwrap();
        let subgoals = vec![vec!["go forward".to_string(), "turn left".to_string()]; 2];
        let driver = RolloutDriver::new(env, subgoals, 3, None).unwrap();
        DrrnAgent::new(
            &ExecContext::cpu(),
            driver,
            Box::new(HashingEncoder::new(64).unwrap()),
            RewardShaping::default(),
            &config(batch_size, save_frequency),
            dir,
            7,
        )
        .unwrap()
    }

    #[test]
    fn test_update_skipped_without_enough_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(dir.path().to_path_buf(), 64, 0);
        assert_eq!(agent.update().unwrap(), None);
        let logs = agent.update_parameters(0).unwrap();
        assert_eq!(logs.num_frames, 8);
        assert_eq!(agent.memory().len(), 8);
        assert_eq!(logs.loss, 0.0);
    }

    #[test]
    fn test_update_changes_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(dir.path().to_path_buf(), 4, 0);
        agent.update_parameters(0).unwrap();
        let before: Vec<f32> = agent.varmap().all_vars()[0]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let loss = agent.update().unwrap().unwrap();
        assert!(loss.is_finite());
        let after: Vec<f32> = agent.varmap().all_vars()[0]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_cycle_logs_episodes_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(dir.path().join("expe"), 4, 1);
        // 4 ticks per cycle over 3-step episodes
        let first = agent.update_parameters(0).unwrap();
        assert_eq!(first.episodes_done, 2);
        assert_eq!(first.episodes.num_frames_per_episode, vec![3, 3]);
        assert!(first.loss.is_finite());
        for file in [MODEL_FILE, OPTIMIZER_FILE, MEMORY_FILE] {
            assert!(agent.checkpoint().dir().join(file).exists());
        }
        let second = agent.update_parameters(1).unwrap();
        assert_eq!(second.episodes_done, 2);
        assert_eq!(second.episodes.len(), 2);
    }

    #[test]
    fn test_load_restores_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expe");
        let mut trained = agent(path.clone(), 4, 1);
        trained.update_parameters(0).unwrap();

        let mut fresh = agent(path, 4, 1);
        fresh.load().unwrap();
        assert_eq!(fresh.memory().len(), trained.memory().len());
    }
}
