pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod drrn;
pub mod encoder;
pub mod env;
pub mod eval;
pub mod experience;
pub mod model;
pub mod optim;
pub mod ppo;
pub mod prompt;
pub mod replay;
pub mod reward;
pub mod rollout;
pub mod scorer;
pub mod trainer;

pub use backend::{LossReport, OptimizerSettings, ScoringBackend, UpdateCommand, UpdateOutcome};
pub use checkpoint::{DrrnCheckpoint, GenerationalCheckpoint, Slot, Status};
pub use config::{DrrnConfig, ExperimentConfig, PpoConfig, TrainConfig};
pub use context::ExecContext;
pub use drrn::{DrrnAgent, QScorer};
pub use encoder::{Encoder, HashingEncoder, VocabEncoder};
pub use env::{Info, Observation, ScriptedEnv, ScriptedTask, StepBatch, VecEnv};
pub use eval::generate_trajectories;
pub use experience::{ExperienceBuffer, compute_gae};
pub use ppo::{PpoAgent, bootstrap_backend, ppo_loss};
pub use prompt::{PromptModifier, generate_prompt};
pub use replay::{PrioritizedReplay, TokenState, Transition};
pub use reward::{Reshaped, RewardShaping};
pub use rollout::{EpisodeLog, RolloutDriver, Scored, Scorer, Selection, TickRecord};
pub use scorer::LocalScorer;
pub use trainer::{Algo, UpdateLogs, run_agent};
