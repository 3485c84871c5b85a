use anyhow::{Context, Result, bail};
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use serde::{Deserialize, Serialize};

use crate::env::VecEnv;
use crate::prompt::{HistoryArena, PromptModifier, generate_prompt};
use crate::reward::{Reshaped, RewardShaping, ShapingInput};

// =============================================================================
// Policy contract
// =============================================================================

/// Per-candidate scores for one context, plus a value estimate when the
/// scorer has a value head.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub logits: Vec<f32>,
    pub value: Option<f32>,
}

/// Anything that can rank the candidate actions of a batch of prompts.
pub trait Scorer {
    fn score(&self, contexts: &[String], candidates: &[Vec<String>]) -> Result<Vec<Scored>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Draw from the softmax of the scores (training).
    Sample,
    /// Arg-max of the scores (evaluation).
    Greedy,
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn select<R: Rng>(probs: &[f32], selection: Selection, rng: &mut R) -> Result<usize> {
    match selection {
        Selection::Greedy => probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .context("cannot select from an empty distribution"),
        Selection::Sample => {
            let dist = WeightedIndex::new(probs)
                .map_err(|e| anyhow::anyhow!("invalid action distribution {probs:?}: {e}"))?;
            Ok(dist.sample(rng))
        }
    }
}

// =============================================================================
// Episode statistics
// =============================================================================

/// Per-episode statistics, one entry per finished episode in finishing order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeLog {
    pub return_per_episode: Vec<f32>,
    pub reshaped_return_per_episode: Vec<f32>,
    pub reshaped_return_bonus_per_episode: Vec<f32>,
    pub num_frames_per_episode: Vec<usize>,
}

impl EpisodeLog {
    pub fn len(&self) -> usize {
        self.return_per_episode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.return_per_episode.is_empty()
    }

    pub fn extend(&mut self, other: EpisodeLog) {
        self.return_per_episode.extend(other.return_per_episode);
        self.reshaped_return_per_episode
            .extend(other.reshaped_return_per_episode);
        self.reshaped_return_bonus_per_episode
            .extend(other.reshaped_return_bonus_per_episode);
        self.num_frames_per_episode.extend(other.num_frames_per_episode);
    }
}

/// Everything an agent needs from one batched step.
#[derive(Debug, Clone)]
pub struct TickRecord {
    pub prompts: Vec<String>,
    pub scores: Vec<Scored>,
    pub probs: Vec<Vec<f32>>,
    /// Chosen candidate indices, before any index cap.
    pub actions: Vec<usize>,
    pub rewards: Vec<f32>,
    pub reshaped: Vec<Reshaped>,
    pub dones: Vec<bool>,
    pub next_prompts: Vec<String>,
    pub episodes_done: usize,
}

// =============================================================================
// Rollout driver
// =============================================================================

/// Steps a batch of environments in lock-step and keeps, per slot, the
/// goal, the recent observation/action history and the running episode
/// statistics.
pub struct RolloutDriver<E: VecEnv> {
    env: E,
    subgoals: Vec<Vec<String>>,
    goals: Vec<String>,
    obs_history: HistoryArena<Vec<String>>,
    act_history: HistoryArena<String>,
    returns: Vec<f32>,
    reshaped_returns: Vec<f32>,
    bonus_returns: Vec<f32>,
    frames: Vec<usize>,
    log: EpisodeLog,
    action_index_cap: Option<usize>,
    modifier: PromptModifier,
}

impl<E: VecEnv> RolloutDriver<E> {
    /// Resets `env` and seeds each slot's history with its first observation.
    /// `nbr_obs` observations and `nbr_obs - 1` actions are kept per slot.
    pub fn new(
        mut env: E,
        subgoals: Vec<Vec<String>>,
        nbr_obs: usize,
        action_index_cap: Option<usize>,
    ) -> Result<Self> {
        let n = env.len();
        if subgoals.len() != n {
            bail!("{n} environments but {} candidate lists", subgoals.len());
        }
        if let Some(j) = subgoals.iter().position(|s| s.is_empty()) {
            bail!("environment {j} has no candidate actions");
        }
        let (observations, infos) = env.reset()?;
        if observations.len() != n || infos.len() != n {
            bail!("reset returned {} observations for {n} environments", observations.len());
        }

        let mut obs_history = HistoryArena::new(n, nbr_obs);
        for (j, info) in infos.into_iter().enumerate() {
            obs_history.push(j, info.descriptions);
        }
        Ok(Self {
            env,
            subgoals,
            goals: observations.into_iter().map(|o| o.mission).collect(),
            obs_history,
            act_history: HistoryArena::new(n, nbr_obs.saturating_sub(1)),
            returns: vec![0.0; n],
            reshaped_returns: vec![0.0; n],
            bonus_returns: vec![0.0; n],
            frames: vec![0; n],
            log: EpisodeLog::default(),
            action_index_cap,
            modifier: PromptModifier::default(),
        })
    }

    pub fn n_envs(&self) -> usize {
        self.subgoals.len()
    }

    pub fn subgoals(&self) -> &[Vec<String>] {
        &self.subgoals
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn log(&self) -> &EpisodeLog {
        &self.log
    }

    /// Hands over the episodes finished since the last call.
    pub fn take_log(&mut self) -> EpisodeLog {
        std::mem::take(&mut self.log)
    }

    /// `(observations, actions)` currently remembered for slot `env`.
    pub fn history_len(&self, env: usize) -> (usize, usize) {
        (self.obs_history.len(env), self.act_history.len(env))
    }

    pub fn set_modifier(&mut self, modifier: PromptModifier) {
        self.modifier = modifier;
    }

    pub fn prompts(&self) -> Vec<String> {
        (0..self.n_envs())
            .map(|j| {
                let prompt = generate_prompt(
                    &self.goals[j],
                    &self.subgoals[j],
                    self.obs_history.iter(j),
                    self.act_history.iter(j),
                );
                if self.modifier.is_empty() {
                    prompt
                } else {
                    self.modifier.apply(&prompt)
                }
            })
            .collect()
    }

    /// Index actually sent to the environment for candidate `action` of slot `env`.
    fn executed_index(&self, env: usize, action: usize) -> usize {
        match self.action_index_cap {
            Some(cap) if self.subgoals[env].len() > cap => action.min(cap),
            _ => action,
        }
    }

    pub fn tick<S, R>(
        &mut self,
        scorer: &S,
        selection: Selection,
        shaping: &RewardShaping,
        rng: &mut R,
    ) -> Result<TickRecord>
    where
        S: Scorer + ?Sized,
        R: Rng,
    {
        let n = self.n_envs();
        let prompts = self.prompts();
        let scores = scorer.score(&prompts, &self.subgoals)?;
        if scores.len() != n {
            bail!("scorer returned {} results for {n} prompts", scores.len());
        }

        let mut probs = Vec::with_capacity(n);
        let mut actions = Vec::with_capacity(n);
        for (j, scored) in scores.iter().enumerate() {
            if scored.logits.len() != self.subgoals[j].len() {
                bail!(
                    "env {j}: {} scores for {} candidates",
                    scored.logits.len(),
                    self.subgoals[j].len()
                );
            }
            let p = softmax(&scored.logits);
            actions.push(select(&p, selection, rng)?);
            probs.push(p);
        }

        let executed: Vec<usize> = actions
            .iter()
            .enumerate()
            .map(|(j, &a)| self.executed_index(j, a))
            .collect();
        let batch = self.env.step(&executed)?;
        if batch.rewards.len() != n || batch.dones.len() != n || batch.infos.len() != n {
            bail!("environment step returned a partial batch");
        }

        let reshaped = (0..n)
            .map(|j| {
                shaping.reshape(ShapingInput {
                    reward: batch.rewards[j],
                    subgoal_proba: Some(probs[j][actions[j]]),
                    policy_value: Some(1.0 / self.subgoals[j].len() as f32),
                })
            })
            .collect::<Result<Vec<_>>>()
            .context("reward shaping failed")?;

        let mut episodes_done = 0;
        for j in 0..n {
            self.returns[j] += batch.rewards[j];
            self.reshaped_returns[j] += reshaped[j].total;
            self.bonus_returns[j] += reshaped[j].bonus;
            self.frames[j] += 1;
            if batch.dones[j] {
                episodes_done += 1;
                self.log.return_per_episode.push(self.returns[j]);
                self.log
                    .reshaped_return_per_episode
                    .push(self.reshaped_returns[j]);
                self.log
                    .reshaped_return_bonus_per_episode
                    .push(self.bonus_returns[j]);
                self.log.num_frames_per_episode.push(self.frames[j]);
                self.returns[j] = 0.0;
                self.reshaped_returns[j] = 0.0;
                self.bonus_returns[j] = 0.0;
                self.frames[j] = 0;
                self.obs_history.clear(j);
                self.act_history.clear(j);
            } else {
                self.act_history
                    .push(j, self.subgoals[j][actions[j]].clone());
                self.obs_history.push(j, batch.infos[j].descriptions.clone());
            }
        }
        for (goal, obs) in self.goals.iter_mut().zip(batch.observations) {
            *goal = obs.mission;
        }
        if episodes_done > 0 {
            tracing::debug!(episodes_done, "episodes finished");
        }

        Ok(TickRecord {
            prompts,
            scores,
            probs,
            actions,
            rewards: batch.rewards,
            reshaped,
            dones: batch.dones,
            next_prompts: self.prompts(),
            episodes_done,
        })
    }
}
