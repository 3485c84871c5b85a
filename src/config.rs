use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::env::ScriptedTask;
use crate::reward::RewardShaping;

/// Complete configuration of a training or evaluation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub experiment: ExperimentConfig,
    pub drrn: DrrnConfig,
    pub ppo: PpoConfig,
    /// Scripted tasks backing the environment batch, one per slot. Empty
    /// means `number_envs` copies of a default task.
    pub tasks: Vec<ScriptedTask>,
}

/// Settings shared by both agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name_experiment: String,
    pub name_model: String,
    pub seed: u64,
    pub number_envs: usize,
    /// Candidate actions; underscores are shown to the policy as spaces.
    pub action_space: Vec<String>,
    /// Observations kept in the prompt history (actions keep one less).
    pub nbr_obs: usize,
    /// `0` keeps the plain scaled reward, anything else adds the log-ratio term.
    pub reward_shaping_beta: f32,
    /// Training stops once this many frames have been seen.
    pub num_steps: usize,
    pub saving_path_model: PathBuf,
    pub saving_path_logs: PathBuf,
    pub pretrained: bool,
    pub load_embedding: bool,
    /// PPO scores the action space with a fixed-size head on the state
    /// encoding instead of scoring each candidate.
    pub use_action_heads: bool,
    /// Candidate indices above this are clamped before reaching the
    /// environment when a list is longer than the cap.
    pub action_index_cap: Option<usize>,
    /// One token per line; the hashing encoder is used when absent.
    pub vocab_path: Option<PathBuf>,
    pub vocab_size: usize,
    /// Process rank inside the worker group and the rank that writes files.
    pub rank: usize,
    pub world_size: usize,
    pub coordinator_rank: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name_experiment: "subgoal_rl".to_string(),
            name_model: "drrn".to_string(),
            seed: 1,
            number_envs: 2,
            action_space: ["turn_left", "turn_right", "go_forward", "pick_up", "drop", "toggle"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            nbr_obs: 3,
            reward_shaping_beta: 0.0,
            num_steps: 1_500_000,
            saving_path_model: PathBuf::from("storage/models"),
            saving_path_logs: PathBuf::from("storage/logs"),
            pretrained: true,
            load_embedding: false,
            use_action_heads: false,
            action_index_cap: None,
            vocab_path: None,
            vocab_size: 4096,
            rank: 0,
            world_size: 1,
            coordinator_rank: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrrnConfig {
    pub gamma: f64,
    pub batch_size: usize,
    pub memory_size: usize,
    pub priority_fraction: f64,
    /// Gradient global-norm bound.
    pub clip: f64,
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub lr: f64,
    /// Environment steps per update cycle; `number_envs * 4` when unset.
    pub max_steps: Option<usize>,
    /// Checkpoint every this many update cycles.
    pub save_frequency: usize,
}

impl Default for DrrnConfig {
    fn default() -> Self {
        Self {
            gamma: 0.9,
            batch_size: 64,
            memory_size: 5_000_000,
            priority_fraction: 0.0,
            clip: 5.0,
            embedding_dim: 128,
            hidden_dim: 128,
            lr: 1e-4,
            max_steps: None,
            save_frequency: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    pub frames_per_proc: usize,
    pub discount: f64,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub adam_eps: f64,
    pub gae_lambda: f64,
    pub entropy_coef: f64,
    pub value_loss_coef: f64,
    pub max_grad_norm: f64,
    pub clip_eps: f64,
    pub epochs: usize,
    pub batch_size: usize,
    /// Diagnostic prompt set for the distribution log (1 full, 2 short).
    pub template_test: u8,
    /// Directory holding `model.safetensors` with pretrained embeddings.
    pub llm_path: PathBuf,
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub value_hidden_dim: usize,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            frames_per_proc: 40,
            discount: 0.99,
            lr: 1e-6,
            beta1: 0.9,
            beta2: 0.999,
            adam_eps: 1e-5,
            gae_lambda: 0.99,
            entropy_coef: 0.01,
            value_loss_coef: 0.5,
            max_grad_norm: 0.5,
            clip_eps: 0.2,
            epochs: 4,
            batch_size: 16,
            template_test: 1,
            llm_path: PathBuf::from("storage/llm"),
            embedding_dim: 128,
            hidden_dim: 128,
            value_hidden_dim: 1024,
        }
    }
}

impl TrainConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// The given file, or the defaults when no path is provided.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_json_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let e = &self.experiment;
        if e.number_envs == 0 {
            bail!("number_envs must be at least 1");
        }
        if e.action_space.is_empty() {
            bail!("action_space must not be empty");
        }
        if !self.tasks.is_empty() && self.tasks.len() != e.number_envs {
            bail!(
                "{} scripted tasks configured for {} environments",
                self.tasks.len(),
                e.number_envs
            );
        }
        if !(0.0..=1.0).contains(&self.drrn.priority_fraction) {
            bail!("priority_fraction must lie in [0, 1]");
        }
        if self.ppo.batch_size == 0 || self.drrn.batch_size == 0 {
            bail!("batch sizes must be positive");
        }
        if !matches!(self.ppo.template_test, 1 | 2) {
            bail!("template_test must be 1 or 2, got {}", self.ppo.template_test);
        }
        Ok(())
    }

    /// Candidate list shown to every environment.
    pub fn subgoals(&self) -> Vec<Vec<String>> {
        let actions: Vec<String> = self
            .experiment
            .action_space
            .iter()
            .map(|a| a.replace('_', " "))
            .collect();
        vec![actions; self.experiment.number_envs]
    }

    pub fn reward_shaping(&self) -> RewardShaping {
        RewardShaping::from_beta(self.experiment.reward_shaping_beta)
    }

    pub fn drrn_max_steps(&self) -> usize {
        self.drrn
            .max_steps
            .unwrap_or(self.experiment.number_envs * 4)
    }

    /// Configured tasks, or one task per slot rewarding "go forward".
    pub fn scripted_tasks(&self) -> Vec<ScriptedTask> {
        if !self.tasks.is_empty() {
            return self.tasks.clone();
        }
        let subgoals = self.subgoals();
        let rewards: Vec<f32> = subgoals[0]
            .iter()
            .map(|a| if a == "go forward" { 1.0 } else { 0.0 })
            .collect();
        (0..self.experiment.number_envs)
            .map(|_| ScriptedTask::per_action("go to the red ball", 3, rewards.clone()))
            .collect()
    }

    /// Experiment identifier used for the model and log directories.
    pub fn id_expe(&self) -> String {
        let e = &self.experiment;
        let mut id = format!(
            "{}_nbr_env_{}_{}_pretrained_{}_",
            e.name_experiment, e.number_envs, e.name_model, e.pretrained
        );
        if !e.pretrained {
            id.push_str(&format!("load_embedding_{}_", e.load_embedding));
        }
        if e.use_action_heads {
            id.push_str(&format!("use_action_heads_{}_", e.use_action_heads));
        }
        if e.nbr_obs != 3 {
            id.push_str(&format!("nbr_obs_{}_", e.nbr_obs));
        }
        id.push_str(&format!("nbr_actions_{}_", e.action_space.len()));
        for a in &e.action_space {
            id.push_str(a);
            id.push('_');
        }
        id.push_str(&format!(
            "shape_reward_beta_{}_seed_{}",
            e.reward_shaping_beta, e.seed
        ));
        id
    }

    pub fn model_dir(&self) -> PathBuf {
        self.experiment.saving_path_model.join(self.id_expe())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.experiment.saving_path_logs.join(self.id_expe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TrainConfig::default();
        config.validate().unwrap();
        assert_eq!(config.drrn_max_steps(), 8);
        assert_eq!(config.subgoals()[0][2], "go forward");
        assert_eq!(config.scripted_tasks().len(), 2);
    }

    #[test]
    fn test_id_expe_layout() {
        let mut config = TrainConfig::default();
        config.experiment.action_space = vec!["go_forward".into(), "turn_left".into()];
        assert_eq!(
            config.id_expe(),
            "subgoal_rl_nbr_env_2_drrn_pretrained_true_nbr_actions_2_go_forward_turn_left_shape_reward_beta_0_seed_1"
        );
        config.experiment.pretrained = false;
        config.experiment.nbr_obs = 5;
        let id = config.id_expe();
        assert!(id.contains("pretrained_false_load_embedding_false_nbr_obs_5_"));
        config.experiment.use_action_heads = true;
        let id = config.id_expe();
        assert!(id.contains("load_embedding_false_use_action_heads_true_nbr_obs_5_"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"experiment": {"number_envs": 3, "reward_shaping_beta": 1.0}, "ppo": {"epochs": 2}}"#,
        )
        .unwrap();
        let config = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(config.experiment.number_envs, 3);
        assert_eq!(config.ppo.epochs, 2);
        assert_eq!(config.ppo.frames_per_proc, 40);
        assert!(config.reward_shaping().needs_probabilities());
    }

    #[test]
    fn test_rejects_unknown_template() {
        let mut config = TrainConfig::default();
        config.ppo.template_test = 3;
        assert!(config.validate().is_err());
        config.ppo.template_test = 1;
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_mismatched_tasks() {
        let mut config = TrainConfig::default();
        config.tasks = vec![ScriptedTask::per_step("m", vec![0.0])];
        assert!(config.validate().is_err());
    }
}
