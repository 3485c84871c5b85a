use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

// =============================================================================
// Vectorized environment contract
// =============================================================================

/// What the policy sees of an environment besides the textual descriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub mission: String,
}

/// Auxiliary step information; `descriptions` feeds the prompt history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub descriptions: Vec<String>,
}

/// Result of one batched step, one entry per environment slot.
#[derive(Debug, Clone)]
pub struct StepBatch {
    pub observations: Vec<Observation>,
    pub rewards: Vec<f32>,
    pub dones: Vec<bool>,
    pub infos: Vec<Info>,
}

/// A batch of environments stepped in lock-step.
///
/// `step` is all-or-nothing: it returns a result for every slot or fails as a
/// whole. Finished environments are reset internally, so the returned
/// observation of a `done` slot already belongs to the next episode.
pub trait VecEnv {
    fn reset(&mut self) -> Result<(Vec<Observation>, Vec<Info>)>;
    fn step(&mut self, actions: &[usize]) -> Result<StepBatch>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Scripted environment
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardRule {
    /// Reward indexed by the executed action.
    PerAction(Vec<f32>),
    /// Reward indexed by the step number inside the episode.
    PerStep(Vec<f32>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedTask {
    pub mission: String,
    pub episode_len: usize,
    pub rewards: RewardRule,
    /// Highest action index the task accepts; larger indices fail the step.
    #[serde(default)]
    pub max_action: Option<usize>,
}

impl ScriptedTask {
    pub fn per_action(mission: &str, episode_len: usize, rewards: Vec<f32>) -> Self {
        Self {
            mission: mission.to_string(),
            episode_len,
            rewards: RewardRule::PerAction(rewards),
            max_action: None,
        }
    }

    pub fn per_step(mission: &str, rewards: Vec<f32>) -> Self {
        Self {
            mission: mission.to_string(),
            episode_len: rewards.len(),
            rewards: RewardRule::PerStep(rewards),
            max_action: None,
        }
    }
}

/// Deterministic environment batch driven by per-slot scripts. Used by the
/// CLI demo and the tests; it defines no grid semantics of its own.
#[derive(Debug, Clone)]
pub struct ScriptedEnv {
    tasks: Vec<ScriptedTask>,
    steps: Vec<usize>,
    episodes: Vec<usize>,
    executed: Vec<Vec<usize>>,
}

impl ScriptedEnv {
    pub fn new(tasks: Vec<ScriptedTask>) -> Result<Self> {
        if tasks.is_empty() {
            bail!("scripted env needs at least one task");
        }
        if let Some(task) = tasks.iter().find(|t| t.episode_len == 0) {
            bail!("task {:?} has an empty episode", task.mission);
        }
        let n = tasks.len();
        Ok(Self {
            tasks,
            steps: vec![0; n],
            episodes: vec![0; n],
            executed: vec![Vec::new(); n],
        })
    }

    /// Action indices actually received by slot `env`, in order.
    pub fn executed(&self, env: usize) -> &[usize] {
        &self.executed[env]
    }

    fn describe(&self, env: usize) -> Info {
        let task = &self.tasks[env];
        Info {
            descriptions: vec![
                format!("You see the target {} steps away", task.episode_len - self.steps[env]),
                format!("Episode {}", self.episodes[env]),
            ],
        }
    }

    fn observe(&self, env: usize) -> Observation {
        Observation {
            mission: self.tasks[env].mission.clone(),
        }
    }
}

impl VecEnv for ScriptedEnv {
    fn reset(&mut self) -> Result<(Vec<Observation>, Vec<Info>)> {
        for env in 0..self.tasks.len() {
            self.steps[env] = 0;
        }
        let obs = (0..self.tasks.len()).map(|j| self.observe(j)).collect();
        let infos = (0..self.tasks.len()).map(|j| self.describe(j)).collect();
        Ok((obs, infos))
    }

    fn step(&mut self, actions: &[usize]) -> Result<StepBatch> {
        if actions.len() != self.tasks.len() {
            bail!(
                "expected {} actions, got {}",
                self.tasks.len(),
                actions.len()
            );
        }
        // Validate everything first so a bad slot leaves no slot stepped.
        let mut rewards = Vec::with_capacity(actions.len());
        for (j, &a) in actions.iter().enumerate() {
            let task = &self.tasks[j];
            if let Some(max) = task.max_action {
                if a > max {
                    bail!("env {j} accepts actions up to {max}, got {a}");
                }
            }
            let reward = match &task.rewards {
                RewardRule::PerAction(table) => table.get(a).copied(),
                RewardRule::PerStep(table) => table.get(self.steps[j]).copied(),
            };
            match reward {
                Some(r) => rewards.push(r),
                None => bail!("env {j} has no reward for action {a} at step {}", self.steps[j]),
            }
        }

        let mut dones = Vec::with_capacity(actions.len());
        for (j, &a) in actions.iter().enumerate() {
            self.executed[j].push(a);
            self.steps[j] += 1;
            let done = self.steps[j] >= self.tasks[j].episode_len;
            if done {
                self.steps[j] = 0;
                self.episodes[j] += 1;
            }
            dones.push(done);
        }

        let observations = (0..self.tasks.len()).map(|j| self.observe(j)).collect();
        let infos = (0..self.tasks.len()).map(|j| self.describe(j)).collect();
        Ok(StepBatch {
            observations,
            rewards,
            dones,
            infos,
        })
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }
}
