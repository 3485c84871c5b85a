// =============================================================================
// Subgoal RL: DRRN and LLM-backed PPO agents picking natural-language subgoals
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- --agent drrn train
//   cargo run --release -- --config expe.json --agent ppo train
//   cargo run --release -- --agent ppo eval --n-tests 64 --modifier words.json
//   cargo run --release -- inspect-memory storage/models/<id>/memory.pkl

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use subgoal_rl::backend::OptimizerSettings;
use subgoal_rl::config::TrainConfig;
use subgoal_rl::context::ExecContext;
use subgoal_rl::drrn::DrrnAgent;
use subgoal_rl::encoder::{Encoder, HashingEncoder, VocabEncoder};
use subgoal_rl::env::ScriptedEnv;
use subgoal_rl::ppo::{PpoAgent, bootstrap_backend};
use subgoal_rl::prompt::PromptModifier;
use subgoal_rl::replay::PrioritizedReplay;
use subgoal_rl::rollout::{EpisodeLog, RolloutDriver};
use subgoal_rl::scorer::LocalScorer;
use subgoal_rl::trainer::{run_agent, synthesize};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "subgoal-rl", about = "DRRN / PPO agents over natural-language subgoals")]
struct Cli {
    /// JSON experiment file; defaults are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = AgentKind::Drrn, global = true)]
    agent: AgentKind,
    #[arg(long, default_value_t = false, global = true)]
    cpu: bool,
    /// Overrides `experiment.rank`
    #[arg(long, global = true)]
    rank: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AgentKind {
    Drrn,
    Ppo,
}

#[derive(Subcommand)]
enum Commands {
    /// Train until `num_steps` frames have been collected
    Train,
    /// Play test episodes with the saved parameters, without learning
    Eval(EvalArgs),
    /// Summarise a saved replay memory
    InspectMemory(InspectArgs),
}

#[derive(Parser)]
struct EvalArgs {
    #[arg(long, default_value = "32")]
    n_tests: usize,
    /// JSON array of `[from, to]` word substitutions, applied in order to every prompt
    #[arg(long)]
    modifier: Option<PathBuf>,
}

#[derive(Parser)]
struct InspectArgs {
    path: PathBuf,
}

// =============================================================================
// Setup
// =============================================================================

fn load_config(cli: &Cli) -> Result<TrainConfig> {
    let mut config = TrainConfig::load(cli.config.as_deref())?;
    if let Some(rank) = cli.rank {
        config.experiment.rank = rank;
    }
    match cli.agent {
        AgentKind::Drrn => config.experiment.name_model = "drrn".to_string(),
        AgentKind::Ppo if config.experiment.name_model == "drrn" => {
            config.experiment.name_model = "ppo".to_string()
        }
        AgentKind::Ppo => {}
    }
    config.validate()?;
    Ok(config)
}

fn exec_context(cli: &Cli, config: &TrainConfig) -> ExecContext {
    let e = &config.experiment;
    ExecContext::best_available(cli.cpu).with_rank(e.rank, e.world_size, e.coordinator_rank)
}

fn encoder(config: &TrainConfig) -> Result<Box<dyn Encoder>> {
    Ok(match &config.experiment.vocab_path {
        Some(path) => Box::new(VocabEncoder::from_file(path)?),
        None => Box::new(HashingEncoder::new(config.experiment.vocab_size)?),
    })
}

fn driver(config: &TrainConfig) -> Result<RolloutDriver<ScriptedEnv>> {
    let env = ScriptedEnv::new(config.scripted_tasks())?;
    RolloutDriver::new(
        env,
        config.subgoals(),
        config.experiment.nbr_obs,
        config.experiment.action_index_cap,
    )
}

fn drrn_agent(cli: &Cli, config: &TrainConfig) -> Result<DrrnAgent<ScriptedEnv>> {
    let mut drrn = config.drrn.clone();
    drrn.max_steps = Some(config.drrn_max_steps());
    let mut agent = DrrnAgent::new(
        &exec_context(cli, config),
        driver(config)?,
        encoder(config)?,
        config.reward_shaping(),
        &drrn,
        config.model_dir(),
        config.experiment.seed,
    )?;
    if agent.checkpoint().exists() {
        tracing::info!(dir = %agent.checkpoint().dir().display(), "loading DRRN checkpoint");
        agent.load()?;
    }
    Ok(agent)
}

fn ppo_agent(cli: &Cli, config: &TrainConfig) -> Result<PpoAgent<ScriptedEnv, LocalScorer>> {
    let ppo = &config.ppo;
    let ctx = exec_context(cli, config);
    let mut backend = if config.experiment.use_action_heads {
        LocalScorer::with_action_heads(ctx, encoder(config)?, ppo, config.experiment.action_space.len())?
    } else {
        LocalScorer::new(ctx, encoder(config)?, ppo)?
    };
    bootstrap_backend(
        &mut backend,
        &config.model_dir(),
        config.experiment.pretrained,
        config.experiment.load_embedding,
        &ppo.llm_path,
        OptimizerSettings {
            lr: ppo.lr,
            beta1: ppo.beta1,
            beta2: ppo.beta2,
            adam_eps: ppo.adam_eps,
        },
    )?;
    PpoAgent::new(
        driver(config)?,
        backend,
        config.reward_shaping(),
        ppo.clone(),
        config.model_dir(),
        config.log_dir(),
        config.experiment.seed,
    )
}

fn read_modifier(path: &Path) -> Result<PromptModifier> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read modifier {}", path.display()))?;
    let pairs: Vec<(String, String)> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse modifier {}", path.display()))?;
    Ok(PromptModifier::new(pairs))
}

// =============================================================================
// Commands
// =============================================================================

fn train(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    tracing::info!(id = %config.id_expe(), agent = %config.experiment.name_model, "starting training");
    let status = match cli.agent {
        AgentKind::Drrn => {
            let mut agent = drrn_agent(cli, &config)?;
            run_agent(&mut agent, config.experiment.num_steps, &config.log_dir())?
        }
        AgentKind::Ppo => {
            let mut agent = ppo_agent(cli, &config)?;
            run_agent(&mut agent, config.experiment.num_steps, &config.log_dir())?
        }
    };
    tracing::info!(
        updates = status.i,
        frames = status.num_frames,
        episodes = status.num_episodes,
        "training finished"
    );
    Ok(())
}

fn eval(cli: &Cli, args: &EvalArgs) -> Result<()> {
    let config = load_config(cli)?;
    let modifier = args.modifier.as_deref().map(read_modifier).transpose()?;
    let log: EpisodeLog = match cli.agent {
        AgentKind::Drrn => drrn_agent(cli, &config)?.evaluate(args.n_tests, modifier)?,
        AgentKind::Ppo => ppo_agent(cli, &config)?.evaluate(args.n_tests, modifier)?,
    };

    let returns = synthesize(&log.return_per_episode);
    let successes: Vec<f64> = log
        .return_per_episode
        .iter()
        .map(|&r| if r > 0.0 { 1.0 } else { 0.0 })
        .collect();
    let frames: Vec<f64> = log.num_frames_per_episode.iter().map(|&f| f as f64).collect();
    let frames = synthesize(&frames);
    println!(
        "Episodes: {} | Return: {:.3} +- {:.3} | Success Rate: {:.3} | Frames/Eps: {:.1} +- {:.1}",
        log.len(),
        returns.mean,
        returns.std,
        synthesize(&successes).mean,
        frames.mean,
        frames.std
    );

    let path = config.log_dir().join("test_results.json");
    std::fs::create_dir_all(config.log_dir())?;
    let json = serde_json::json!({
        "return_per_episode": log.return_per_episode,
        "reshaped_return_per_episode": log.reshaped_return_per_episode,
        "num_frames_per_episode": log.num_frames_per_episode,
    });
    std::fs::write(&path, serde_json::to_string_pretty(&json)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "test results saved");
    Ok(())
}

fn inspect_memory(args: &InspectArgs) -> Result<()> {
    let memory = PrioritizedReplay::load(&args.path)?;
    let rewarded = memory
        .priority_pool()
        .chain(memory.regular_pool())
        .filter(|t| t.reward > 0.0)
        .count();
    println!(
        "{}: {} transitions ({} priority, {} regular), {} rewarded, priority fraction {}",
        args.path.display(),
        memory.len(),
        memory.priority_len(),
        memory.regular_len(),
        rewarded,
        memory.priority_fraction()
    );
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train => train(&cli),
        Commands::Eval(args) => eval(&cli, args),
        Commands::InspectMemory(args) => inspect_memory(args),
    }
}
