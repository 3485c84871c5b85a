//! On-policy trajectory storage and generalized advantage estimation.
//!
//! Every per-step array is laid out as `t * n_envs + env`.

use anyhow::{Result, bail};

use crate::rollout::TickRecord;

/// Advantages and returns for a whole `(T, n_envs)` rollout.
///
/// For each environment, backward from the last step:
/// `delta_t = r_t + gamma * V(s_{t+1}) * (1 - done_t) - V(s_t)`,
/// `A_t = delta_t + gamma * lambda * (1 - done_t) * A_{t+1}` and
/// `R_t = A_t + V(s_t)`. `next_values` holds `V(s_T)` per environment.
pub fn compute_gae(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    next_values: &[f32],
    n_envs: usize,
    gamma: f32,
    gae_lambda: f32,
) -> Result<(Vec<f32>, Vec<f32>)> {
    let total = rewards.len();
    if n_envs == 0 || total % n_envs != 0 {
        bail!("{total} steps do not split over {n_envs} environments");
    }
    if values.len() != total || dones.len() != total || next_values.len() != n_envs {
        bail!("rollout arrays disagree in length");
    }
    let horizon = total / n_envs;
    let mut advantages = vec![0.0f32; total];
    let mut returns = vec![0.0f32; total];

    for env in 0..n_envs {
        let mut gae = 0.0f32;
        let mut next_value = next_values[env];
        for t in (0..horizon).rev() {
            let i = t * n_envs + env;
            let not_done = if dones[i] { 0.0 } else { 1.0 };
            let delta = rewards[i] + gamma * next_value * not_done - values[i];
            gae = delta + gamma * gae_lambda * not_done * gae;
            advantages[i] = gae;
            returns[i] = gae + values[i];
            next_value = values[i];
        }
    }
    Ok((advantages, returns))
}

/// Fixed-horizon rollout storage, filled tick by tick and consumed once.
#[derive(Debug, Clone)]
pub struct ExperienceBuffer {
    n_envs: usize,
    horizon: usize,
    filled: usize,
    pub prompts: Vec<String>,
    pub actions: Vec<usize>,
    pub values: Vec<f32>,
    pub log_probs: Vec<f32>,
    pub rewards: Vec<f32>,
    pub bonuses: Vec<f32>,
    pub dones: Vec<bool>,
    pub advantages: Vec<f32>,
    pub returns: Vec<f32>,
}

impl ExperienceBuffer {
    pub fn new(n_envs: usize, horizon: usize) -> Self {
        let size = n_envs * horizon;
        Self {
            n_envs,
            horizon,
            filled: 0,
            prompts: vec![String::new(); size],
            actions: vec![0; size],
            values: vec![0.0; size],
            log_probs: vec![0.0; size],
            rewards: vec![0.0; size],
            bonuses: vec![0.0; size],
            dones: vec![false; size],
            advantages: vec![0.0; size],
            returns: vec![0.0; size],
        }
    }

    pub fn n_envs(&self) -> usize {
        self.n_envs
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Ticks stored since the last [`clear`](Self::clear).
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.horizon
    }

    pub fn len(&self) -> usize {
        self.n_envs * self.horizon
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }

    /// Stores one tick. Values and log-probs come from the scores the
    /// action was chosen with.
    pub fn push_tick(&mut self, rec: &TickRecord) -> Result<()> {
        if self.is_full() {
            bail!("experience buffer already holds {} ticks", self.horizon);
        }
        if rec.actions.len() != self.n_envs {
            bail!("tick covers {} environments, buffer {}", rec.actions.len(), self.n_envs);
        }
        let t = self.filled;
        for env in 0..self.n_envs {
            let i = t * self.n_envs + env;
            let action = rec.actions[env];
            self.prompts[i] = rec.prompts[env].clone();
            self.actions[i] = action;
            self.values[i] = rec.scores[env].value.unwrap_or(0.0);
            self.log_probs[i] = rec.probs[env][action].max(f32::MIN_POSITIVE).ln();
            self.rewards[i] = rec.reshaped[env].total;
            self.bonuses[i] = rec.reshaped[env].bonus;
            self.dones[i] = rec.dones[env];
        }
        self.filled += 1;
        Ok(())
    }

    pub fn compute_advantages(&mut self, next_values: &[f32], gamma: f32, gae_lambda: f32) -> Result<()> {
        if !self.is_full() {
            bail!("advantages need a full rollout ({} of {} ticks)", self.filled, self.horizon);
        }
        let (advantages, returns) = compute_gae(
            &self.rewards,
            &self.values,
            &self.dones,
            next_values,
            self.n_envs,
            gamma,
            gae_lambda,
        )?;
        self.advantages = advantages;
        self.returns = returns;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reward::Reshaped;
    use crate::rollout::Scored;

    #[test]
    fn test_zero_rewards_constant_value() {
        let (t, n) = (6, 2);
        let v = 0.0f32;
        let rewards = vec![0.0; t * n];
        let values = vec![v; t * n];
        let mut dones = vec![false; t * n];
        dones[2 * n] = true;
        let (adv, ret) = compute_gae(&rewards, &values, &dones, &[v, v], n, 0.9, 0.95).unwrap();
        assert!(adv.iter().all(|a| *a == 0.0));
        assert!(ret.iter().all(|r| *r == v));
    }

    #[test]
    fn test_zero_rewards_undiscounted_value_is_consistent() {
        // with gamma = 1 any constant V is self-consistent away from episode ends
        let v = 0.7f32;
        let (adv, ret) = compute_gae(&[0.0; 4], &[v; 4], &[false; 4], &[v], 1, 1.0, 0.95).unwrap();
        assert!(adv.iter().all(|a| a.abs() < 1e-7));
        assert!(ret.iter().all(|r| (r - v).abs() < 1e-7));
    }

    #[test]
    fn test_single_step_episode_has_no_bootstrap() {
        let (adv, ret) = compute_gae(&[1.5], &[0.25], &[true], &[100.0], 1, 0.9, 0.95).unwrap();
        assert_eq!(adv, vec![1.5 - 0.25]);
        assert_eq!(ret, vec![1.5]);
    }

    #[test]
    fn test_two_step_by_hand() {
        let (gamma, lambda) = (0.9f32, 0.95f32);
        let rewards = [1.0, 2.0];
        let values = [0.5, 0.4];
        let (adv, _) = compute_gae(&rewards, &values, &[false, false], &[0.3], 1, gamma, lambda).unwrap();
        let d1 = 2.0 + gamma * 0.3 - 0.4;
        let d0 = 1.0 + gamma * 0.4 - 0.5;
        assert!((adv[1] - d1).abs() < 1e-6);
        assert!((adv[0] - (d0 + gamma * lambda * d1)).abs() < 1e-6);
    }

    #[test]
    fn test_envs_are_independent() {
        // env 0 terminates at t=0, env 1 never does
        let rewards = [1.0, 0.0, 0.0, 1.0];
        let values = [0.0; 4];
        let dones = [true, false, false, false];
        let (adv, _) = compute_gae(&rewards, &values, &dones, &[0.0, 0.0], 2, 0.5, 1.0).unwrap();
        assert_eq!(adv[0], 1.0);
        assert_eq!(adv[1], 0.5);
        assert_eq!(adv[3], 1.0);
    }

    #[test]
    fn test_rejects_ragged_rollout() {
        assert!(compute_gae(&[0.0; 3], &[0.0; 3], &[false; 3], &[0.0, 0.0], 2, 0.9, 0.9).is_err());
    }

    #[test]
    fn test_buffer_layout() {
        let mut buffer = ExperienceBuffer::new(2, 2);
        for t in 0..2 {
            let rec = TickRecord {
                prompts: vec![format!("p{t}0"), format!("p{t}1")],
                scores: vec![
                    Scored { logits: vec![0.0, 0.0], value: Some(t as f32) },
                    Scored { logits: vec![0.0, 0.0], value: Some(10.0 + t as f32) },
                ],
                probs: vec![vec![0.5, 0.5]; 2],
                actions: vec![0, 1],
                rewards: vec![0.0, 1.0],
                reshaped: vec![Reshaped::default(), Reshaped { total: 20.0, bonus: 0.0 }],
                dones: vec![false, t == 1],
                next_prompts: vec![String::new(); 2],
                episodes_done: 0,
            };
            buffer.push_tick(&rec).unwrap();
        }
        assert!(buffer.is_full());
        assert_eq!(buffer.prompts[3], "p11");
        assert_eq!(buffer.values, vec![0.0, 10.0, 1.0, 11.0]);
        assert!((buffer.log_probs[0] - 0.5f32.ln()).abs() < 1e-6);
        assert_eq!(buffer.rewards[1], 20.0);
        buffer.compute_advantages(&[0.0, 0.0], 0.99, 0.95).unwrap();
        buffer.clear();
        assert_eq!(buffer.filled(), 0);
    }
}
