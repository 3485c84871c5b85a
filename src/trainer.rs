use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};

use crate::checkpoint::{STATUS_FILE, Status};
use crate::rollout::EpisodeLog;

// =============================================================================
// Update cycle contract
// =============================================================================

/// What one update cycle reports to the run loop.
#[derive(Debug, Clone, Default)]
pub struct UpdateLogs {
    /// Episodes finished during this cycle.
    pub episodes: EpisodeLog,
    pub num_frames: usize,
    pub episodes_done: usize,
    pub entropy: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub loss: f32,
    pub grad_norm: f32,
}

/// A learner driven by [`run_agent`]: one call collects experience and
/// updates the parameters once.
pub trait Algo {
    fn update_parameters(&mut self, number_updates: usize) -> Result<UpdateLogs>;
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Synthesis {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Mean, population standard deviation, min and max; all NaN when empty.
pub fn synthesize<T: Copy + Into<f64>>(values: &[T]) -> Synthesis {
    if values.is_empty() {
        return Synthesis {
            mean: f64::NAN,
            std: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
        };
    }
    let xs: Vec<f64> = values.iter().map(|&v| v.into()).collect();
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    Synthesis {
        mean,
        std: var.sqrt(),
        min: xs.iter().copied().fold(f64::INFINITY, f64::min),
        max: xs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

pub fn log_header() -> Vec<String> {
    let stats = ["mean", "std", "min", "max"];
    let mut header: Vec<String> = ["update", "episodes", "frames", "FPS", "duration"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(stats.iter().map(|s| format!("return_{s}")));
    header.push("success_rate".to_string());
    for prefix in ["reshaped_return", "reshaped_return_bonus", "num_frames"] {
        header.extend(stats.iter().map(|s| format!("{prefix}_{s}")));
    }
    header.extend(
        ["entropy", "policy_loss", "value_loss", "loss", "grad_norm"]
            .iter()
            .map(|s| s.to_string()),
    );
    header
}

// =============================================================================
// Run loop
// =============================================================================

/// Runs update cycles until `num_steps` frames have been seen, appending a
/// row to `log.csv` and rewriting `status.json` after each one. An existing
/// status file resumes the counters.
pub fn run_agent<A: Algo + ?Sized>(algo: &mut A, num_steps: usize, experiment_path: &Path) -> Result<Status> {
    std::fs::create_dir_all(experiment_path)
        .with_context(|| format!("Failed to create {}", experiment_path.display()))?;

    let csv_path = experiment_path.join("log.csv");
    let first_created = !csv_path.exists();
    let mut csv = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;
    if first_created {
        writeln!(csv, "{}", log_header().join(","))?;
    }

    let status_path = experiment_path.join(STATUS_FILE);
    let mut status = Status::load_or_default(&status_path)?;
    if status.i > 0 {
        tracing::info!(
            update = status.i,
            frames = status.num_frames,
            episodes = status.num_episodes,
            "resuming run"
        );
    }

    let total_start = Instant::now();
    while status.num_frames < num_steps {
        let update_start = Instant::now();
        let logs = algo.update_parameters(status.i)?;
        let update_secs = update_start.elapsed().as_secs_f64();
        if logs.num_frames == 0 {
            bail!("update cycle {} collected no frames", status.i);
        }

        status.num_frames += logs.num_frames;
        status.num_episodes += logs.episodes_done;
        status.i += 1;

        let duration = total_start.elapsed().as_secs();
        let fps = logs.num_frames as f64 / update_secs.max(f64::EPSILON);
        let returns = synthesize(&logs.episodes.return_per_episode);
        let successes: Vec<f64> = logs
            .episodes
            .return_per_episode
            .iter()
            .map(|&r| if r > 0.0 { 1.0 } else { 0.0 })
            .collect();
        let success_rate = synthesize(&successes).mean;
        let reshaped = synthesize(&logs.episodes.reshaped_return_per_episode);
        let bonus = synthesize(&logs.episodes.reshaped_return_bonus_per_episode);
        let frames: Vec<f64> = logs
            .episodes
            .num_frames_per_episode
            .iter()
            .map(|&f| f as f64)
            .collect();
        let frames = synthesize(&frames);

        tracing::info!(
            update = status.i,
            episodes = status.num_episodes,
            frames = status.num_frames,
            fps = fps.round() as u64,
            elapsed_s = duration,
            "Reward: {:.2} +- {:.2} (Min: {:.2} Max: {:.2}) | Success Rate: {:.2} | \
             Reshaped: {:.2} +- {:.2} (Min: {:.2} Max: {:.2}) | Bonus: {:.2} +- {:.2} (Min: {:.2} Max: {:.2}) | \
             Frames/Eps: {:.1} +- {:.1} (Min: {}, Max {}) | \
             Entropy: {:.3} | Policy Loss: {:.3} | Value Loss: {:.5} | Loss: {:.3} | Grad Norm: {:.3}",
            returns.mean,
            returns.std,
            returns.min,
            returns.max,
            success_rate,
            reshaped.mean,
            reshaped.std,
            reshaped.min,
            reshaped.max,
            bonus.mean,
            bonus.std,
            bonus.min,
            bonus.max,
            frames.mean,
            frames.std,
            frames.min,
            frames.max,
            logs.entropy,
            logs.policy_loss,
            logs.value_loss,
            logs.loss,
            logs.grad_norm,
        );

        let row: Vec<String> = [
            status.i as f64,
            status.num_episodes as f64,
            status.num_frames as f64,
            fps,
            duration as f64,
            returns.mean,
            returns.std,
            returns.min,
            returns.max,
            success_rate,
            reshaped.mean,
            reshaped.std,
            reshaped.min,
            reshaped.max,
            bonus.mean,
            bonus.std,
            bonus.min,
            bonus.max,
            frames.mean,
            frames.std,
            frames.min,
            frames.max,
            logs.entropy as f64,
            logs.policy_loss as f64,
            logs.value_loss as f64,
            logs.loss as f64,
            logs.grad_norm as f64,
        ]
        .iter()
        .map(|v| v.to_string())
        .collect();
        writeln!(csv, "{}", row.join(","))?;
        csv.flush()?;

        status.save(&status_path)?;
    }
    Ok(status)
}
