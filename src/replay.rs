use anyhow::{Context, Result};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;

// =============================================================================
// Transitions
// =============================================================================

/// Encoded prompt: goal plus recent observation/action history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState(pub Vec<u32>);

impl TokenState {
    pub fn ids(&self) -> &[u32] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: TokenState,
    pub action: Vec<u32>,
    pub reward: f32,
    pub next_state: TokenState,
    pub next_actions: Vec<Vec<u32>>,
    pub done: bool,
}

// =============================================================================
// Prioritized replay memory
// =============================================================================

/// Two FIFO pools: transitions flagged as priority and everything else.
///
/// Each pool is bounded on its own; a full pool evicts its own oldest entry
/// and never touches the other one. `priority_fraction` both sizes the
/// priority pool and sets its share of every sampled batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritizedReplay {
    priority: VecDeque<Transition>,
    regular: VecDeque<Transition>,
    priority_capacity: usize,
    regular_capacity: usize,
    priority_fraction: f64,
}

impl PrioritizedReplay {
    pub fn new(capacity: usize, priority_fraction: f64) -> Self {
        let priority_fraction = priority_fraction.clamp(0.0, 1.0);
        let priority_capacity = (capacity as f64 * priority_fraction).floor() as usize;
        let regular_capacity = capacity - priority_capacity;
        Self {
            priority: VecDeque::with_capacity(priority_capacity.min(4096)),
            regular: VecDeque::with_capacity(regular_capacity.min(4096)),
            priority_capacity,
            regular_capacity,
            priority_fraction,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        is_priority: bool,
        state: TokenState,
        action: Vec<u32>,
        reward: f32,
        next_state: TokenState,
        next_actions: Vec<Vec<u32>>,
        done: bool,
    ) {
        self.push_transition(
            is_priority,
            Transition {
                state,
                action,
                reward,
                next_state,
                next_actions,
                done,
            },
        );
    }

    pub fn push_transition(&mut self, is_priority: bool, t: Transition) {
        let (pool, capacity) = if is_priority {
            (&mut self.priority, self.priority_capacity)
        } else {
            (&mut self.regular, self.regular_capacity)
        };
        if capacity == 0 {
            tracing::trace!(is_priority, "dropping transition pushed into a zero-capacity pool");
            return;
        }
        if pool.len() >= capacity {
            pool.pop_front();
        }
        pool.push_back(t);
    }

    pub fn len(&self) -> usize {
        self.priority.len() + self.regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    pub fn regular_len(&self) -> usize {
        self.regular.len()
    }

    pub fn priority_fraction(&self) -> f64 {
        self.priority_fraction
    }

    /// Priority pool contents, oldest first.
    pub fn priority_pool(&self) -> impl Iterator<Item = &Transition> {
        self.priority.iter()
    }

    /// Regular pool contents, oldest first.
    pub fn regular_pool(&self) -> impl Iterator<Item = &Transition> {
        self.regular.iter()
    }

    /// Draw `batch_size` distinct transitions, or `None` when fewer are stored.
    ///
    /// `round(p * batch_size)` come from the priority pool (fewer if it is
    /// short) and the rest from the regular pool. When the regular pool cannot
    /// cover its share, or `p == 0`, the draw is uniform over both pools.
    pub fn sample<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Option<Vec<&Transition>> {
        if self.len() < batch_size {
            return None;
        }

        let from_priority =
            ((self.priority_fraction * batch_size as f64).round() as usize).min(self.priority.len());
        let from_regular = batch_size - from_priority;

        let mut batch: Vec<&Transition> = if self.priority_fraction == 0.0
            || self.regular.len() < from_regular
        {
            rand::seq::index::sample(rng, self.len(), batch_size)
                .into_iter()
                .map(|i| self.get(i))
                .collect()
        } else {
            let mut picked: Vec<&Transition> =
                rand::seq::index::sample(rng, self.priority.len(), from_priority)
                    .into_iter()
                    .map(|i| &self.priority[i])
                    .collect();
            picked.extend(
                rand::seq::index::sample(rng, self.regular.len(), from_regular)
                    .into_iter()
                    .map(|i| &self.regular[i]),
            );
            picked
        };
        batch.shuffle(rng);
        Some(batch)
    }

    /// Index over the concatenation priority ++ regular.
    fn get(&self, i: usize) -> &Transition {
        if i < self.priority.len() {
            &self.priority[i]
        } else {
            &self.regular[i - self.priority.len()]
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create replay file {}", path.display()))?;
        let writer = std::io::BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open replay file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let replay = bincode::deserialize_from(reader)
            .with_context(|| format!("Failed to decode replay file {}", path.display()))?;
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::collections::HashSet;

    fn transition(tag: u32) -> Transition {
        Transition {
            state: TokenState(vec![tag]),
            action: vec![tag, tag],
            reward: tag as f32,
            next_state: TokenState(vec![tag + 1]),
            next_actions: vec![vec![1], vec![2]],
            done: tag % 2 == 0,
        }
    }

    fn tags<'a>(it: impl Iterator<Item = &'a Transition>) -> Vec<u32> {
        it.map(|t| t.state.0[0]).collect()
    }

    #[test]
    fn test_fifo_eviction_per_pool() {
        let mut replay = PrioritizedReplay::new(10, 0.3);
        for tag in 0..7 {
            replay.push_transition(true, transition(tag));
        }
        for tag in 100..120 {
            replay.push_transition(false, transition(tag));
        }
        assert_eq!(replay.priority_len(), 3);
        assert_eq!(replay.regular_len(), 7);
        assert_eq!(tags(replay.priority_pool()), vec![4, 5, 6]);
        assert_eq!(tags(replay.regular_pool()), (113..120).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_capacity_priority_pool_drops() {
        let mut replay = PrioritizedReplay::new(4, 0.0);
        replay.push_transition(true, transition(1));
        assert!(replay.is_empty());
        replay.push_transition(false, transition(2));
        assert_eq!(replay.len(), 1);
    }

    #[test]
    fn test_sample_requires_enough_data() {
        let mut replay = PrioritizedReplay::new(10, 0.0);
        let mut rng = SmallRng::seed_from_u64(0);
        for tag in 0..3 {
            replay.push_transition(false, transition(tag));
        }
        assert!(replay.sample(4, &mut rng).is_none());
        assert_eq!(replay.sample(3, &mut rng).map(|b| b.len()), Some(3));
    }

    #[test]
    fn test_sample_returns_distinct_items() {
        let mut replay = PrioritizedReplay::new(100, 0.5);
        let mut rng = SmallRng::seed_from_u64(7);
        for tag in 0..20 {
            replay.push_transition(tag % 3 == 0, transition(tag));
        }
        for _ in 0..50 {
            let batch = replay.sample(16, &mut rng).unwrap();
            assert_eq!(batch.len(), 16);
            let unique: HashSet<u32> = batch.iter().map(|t| t.state.0[0]).collect();
            assert_eq!(unique.len(), 16);
        }
    }

    #[test]
    fn test_priority_share_matches_fraction() {
        let mut replay = PrioritizedReplay::new(1000, 0.25);
        let mut rng = SmallRng::seed_from_u64(3);
        for tag in 0..200 {
            replay.push_transition(true, transition(tag));
        }
        for tag in 1000..1500 {
            replay.push_transition(false, transition(tag));
        }
        let rounds = 200;
        let batch_size = 20;
        let mut from_priority = 0usize;
        for _ in 0..rounds {
            let batch = replay.sample(batch_size, &mut rng).unwrap();
            from_priority += batch.iter().filter(|t| t.state.0[0] < 1000).count();
        }
        let mean = from_priority as f64 / rounds as f64;
        assert!((mean - 0.25 * batch_size as f64).abs() < 1e-9);
    }

    #[test]
    fn test_falls_back_to_uniform_when_regular_pool_is_short() {
        let mut replay = PrioritizedReplay::new(100, 0.5);
        let mut rng = SmallRng::seed_from_u64(11);
        for tag in 0..30 {
            replay.push_transition(true, transition(tag));
        }
        replay.push_transition(false, transition(500));
        let batch = replay.sample(10, &mut rng).unwrap();
        assert_eq!(batch.len(), 10);
        let unique: HashSet<u32> = batch.iter().map(|t| t.state.0[0]).collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_save_load_preserves_pools_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.pkl");
        let mut replay = PrioritizedReplay::new(8, 0.5);
        for tag in 0..6 {
            replay.push_transition(tag % 2 == 0, transition(tag));
        }
        replay.save(&path).unwrap();
        let restored = PrioritizedReplay::load(&path).unwrap();
        assert_eq!(
            replay.priority_pool().collect::<Vec<_>>(),
            restored.priority_pool().collect::<Vec<_>>()
        );
        assert_eq!(
            replay.regular_pool().collect::<Vec<_>>(),
            restored.regular_pool().collect::<Vec<_>>()
        );
        assert_eq!(restored.priority_fraction(), 0.5);
    }

    #[test]
    fn test_load_rejects_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.pkl");
        std::fs::write(&path, b"\x01\x02").unwrap();
        assert!(PrioritizedReplay::load(&path).is_err());
    }
}
