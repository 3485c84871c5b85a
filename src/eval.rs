use anyhow::Result;
use rand::Rng;

use crate::env::VecEnv;
use crate::prompt::PromptModifier;
use crate::reward::RewardShaping;
use crate::rollout::{EpisodeLog, RolloutDriver, Scorer, Selection};

/// Plays until `n_tests` episodes have finished, without any learning, and
/// returns their statistics. `modifier` rewrites every prompt for the run
/// and is removed again afterwards.
pub fn generate_trajectories<E, S, R>(
    driver: &mut RolloutDriver<E>,
    scorer: &S,
    shaping: &RewardShaping,
    n_tests: usize,
    modifier: Option<PromptModifier>,
    selection: Selection,
    rng: &mut R,
) -> Result<EpisodeLog>
where
    E: VecEnv,
    S: Scorer + ?Sized,
    R: Rng,
{
    // episodes finished before the test run do not count
    driver.take_log();
    let restore = modifier.is_some();
    if let Some(modifier) = modifier {
        driver.set_modifier(modifier);
    }

    let mut ticks = 0usize;
    let outcome = loop {
        if driver.log().len() >= n_tests {
            break Ok(());
        }
        if let Err(err) = driver.tick(scorer, selection, shaping, rng) {
            break Err(err);
        }
        ticks += 1;
    };

    if restore {
        driver.set_modifier(PromptModifier::default());
    }
    outcome?;

    let mut log = driver.take_log();
    log.return_per_episode.truncate(n_tests);
    log.reshaped_return_per_episode.truncate(n_tests);
    log.reshaped_return_bonus_per_episode.truncate(n_tests);
    log.num_frames_per_episode.truncate(n_tests);
    tracing::info!(episodes = log.len(), ticks, "test trajectories generated");
    Ok(log)
}
