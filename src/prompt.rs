//! Prompt construction and per-environment interaction history.

// =============================================================================
// History arena
// =============================================================================

/// Fixed-capacity ring buffers, one per environment slot, backed by a single
/// allocation. Pushing into a full slot silently drops its oldest entry.
#[derive(Debug, Clone)]
pub struct HistoryArena<T> {
    items: Vec<Option<T>>,
    heads: Vec<usize>,
    lens: Vec<usize>,
    capacity: usize,
}

impl<T> HistoryArena<T> {
    pub fn new(slots: usize, capacity: usize) -> Self {
        let mut items = Vec::with_capacity(slots * capacity);
        items.resize_with(slots * capacity, || None);
        Self {
            items,
            heads: vec![0; slots],
            lens: vec![0; slots],
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slots(&self) -> usize {
        self.lens.len()
    }

    pub fn len(&self, slot: usize) -> usize {
        self.lens[slot]
    }

    pub fn is_empty(&self, slot: usize) -> bool {
        self.lens[slot] == 0
    }

    pub fn push(&mut self, slot: usize, item: T) {
        if self.capacity == 0 {
            return;
        }
        let base = slot * self.capacity;
        let len = self.lens[slot];
        let head = self.heads[slot];
        if len < self.capacity {
            self.items[base + (head + len) % self.capacity] = Some(item);
            self.lens[slot] += 1;
        } else {
            self.items[base + head] = Some(item);
            self.heads[slot] = (head + 1) % self.capacity;
        }
    }

    pub fn clear(&mut self, slot: usize) {
        let base = slot * self.capacity;
        for cell in &mut self.items[base..base + self.capacity] {
            *cell = None;
        }
        self.heads[slot] = 0;
        self.lens[slot] = 0;
    }

    /// Entries of `slot`, oldest first.
    pub fn iter(&self, slot: usize) -> impl Iterator<Item = &T> + '_ {
        let base = slot * self.capacity;
        let head = self.heads[slot];
        let capacity = self.capacity.max(1);
        (0..self.lens[slot]).filter_map(move |i| self.items[base + (head + i) % capacity].as_ref())
    }
}

// =============================================================================
// Prompt
// =============================================================================

/// Renders the textual state shown to the policy:
///
/// ```text
/// Possible action of the agent: go forward, turn left
///  Goal of the agent: go to the red ball
///  Observation 0: A wall 2 steps left,
///  Action 0: go forward
///  Observation 1: ...
/// ```
pub fn generate_prompt<'a, O, A>(goal: &str, subgoals: &[String], observations: O, actions: A) -> String
where
    O: IntoIterator<Item = &'a Vec<String>>,
    A: IntoIterator<Item = &'a String>,
{
    let mut prompt = String::from("Possible action of the agent:");
    let joined = subgoals
        .iter()
        .map(|sg| format!(" {sg}"))
        .collect::<Vec<_>>()
        .join(",");
    prompt.push_str(&joined);
    prompt.push_str(&format!(" \n Goal of the agent: {goal}"));

    let mut actions = actions.into_iter();
    for (i, descriptions) in observations.into_iter().enumerate() {
        prompt.push_str(&format!(" \n Observation {i}: "));
        for d in descriptions {
            prompt.push_str(d);
            prompt.push_str(", ");
        }
        prompt.push_str(&format!("\n Action {i}: "));
        if let Some(action) = actions.next() {
            prompt.push_str(action);
        }
    }
    prompt
}

/// Word substitutions applied to a rendered prompt (e.g. for evaluating a
/// policy under paraphrased or translated instructions). Pairs are applied
/// in insertion order, each on the output of the previous one.
#[derive(Debug, Clone, Default)]
pub struct PromptModifier {
    replacements: Vec<(String, String)>,
}

impl PromptModifier {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            replacements: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    pub fn apply(&self, prompt: &str) -> String {
        self.replacements
            .iter()
            .fold(prompt.to_string(), |acc, (from, to)| acc.replace(from.as_str(), to))
    }
}

const GREEN_BALL_START: &str = " \n Goal of the agent: go to the green ball \n Observation 0: A wall 2 step left, A purple key 1 step left and 2 steps forward, A yellow key 1 step left and 1 step forward, A green ball 3 steps forward, A grey ball 1 step right and 5 steps forward, A green key 1 step right and 2 steps forward, A grey ball 1 step right and 1 step forward, A green key 2 steps right and 4 steps forward, A red box 2 steps right and 2 steps forward, \n Action 0: ";
const GREEN_BALL_TURNED: &str = " \n Goal of the agent: go to the green ball \n Observation 0: A wall 2 step left, A purple key 1 step left and 2 steps forward, A yellow key 1 step left and 1 step forward, A green ball 3 steps forward, A grey ball 1 step right and 5 steps forward, A green key 1 step right and 2 steps forward, A grey ball 1 step right and 1 step forward, A green key 2 steps right and 4 steps forward, A red box 2 steps right and 2 steps forward, \n Action 0: go forward \n Observation 1: A purple key 1 step left and 1 step forward, A yellow key 1 step left, A green ball 2 steps forward, A grey ball 1 step right and 4 steps forward, A green key 1 step right and 1 step forward, A grey ball 1 step right, A green key 2 steps right and 3 steps forward, A red box 2 steps right and 1 step forward, \n Action 1: turn right \n Observation 2: A wall 2 step right, A green key 3 steps left and 2 steps forward, A green ball 2 steps left, A red box 1 step left and 2 steps forward, A green key 1 step left and 1 step forward, A grey ball 1 step forward, \n Action 2: ";
const PURPLE_DOOR_START: &str = " \n Goal of the agent: open the purple door \n Observation 0: You see a wall 3 steps forward, You see a wall 3 steps left, You see a yellow key 1 step right and 1 step forward, You see a locked purple door 2 steps right and 3 steps forward, You see a purple ball 3 steps right and 1 step forward, You see a green box 3 steps right, You see a purple key 2 steps left \n Action 0: ";
const PURPLE_DOOR_KEY_AHEAD: &str = " \n Goal of the agent: open the purple door \n Observation 0: You see a wall 3 steps forward, You see a wall 3 steps left, You see a yellow key 1 step right and 1 step forward, You see a locked purple door 2 steps right and 3 steps forward, You see a purple ball 3 steps right and 1 step forward, You see a green box 3 steps right, You see a purple key 2 steps left \n Action 0: turn left \n Observation 1: You see a wall 3 steps forward, You see a wall 3 steps right, You see a purple key 2 steps forward \n Action 1: go forward \n Observation 2: You see a wall 2 steps forward, You see a wall 3 steps right, You see a purple key 1 step forward \n Action 2: ";
const PURPLE_DOOR_CARRYING_KEY: &str = " \n Goal of the agent: open the purple door \n Observation 0: You carry a purple key, You see a wall 3 steps forward, You see a wall 5 steps left, You see a yellow key 1 step left and 1 step forward, You see a locked purple door 3 steps forward, You see a purple ball 1 step right and 1 step forward, You see a green box 1 step right \n Action 0: go forward \n Observation 1: You carry a purple key, You see a wall 2 steps forward, You see a wall 5 steps left, You see a yellow key 1 step left, You see a locked purple door 2 steps forward, You see a purple ball 1 step right \n Action 1: go forward \n Observation 2: You carry a purple key, You see a wall 1 step forward, You see a wall 5 steps left, You see a locked purple door 1 step forward \n Action 2: ";
const GREEN_BOX_START: &str = " \n Goal of the agent: pick up green box \n Observation 0: You see a wall 2 steps forward, You see a wall 2 steps left, You see a yellow ball 1 step left and 1 step forward, You see a green box 2 steps right \n Action 0: ";
const GREEN_BOX_TURNED: &str = " \n Goal of the agent: pick up green box \n Observation 0: You see a wall 2 steps forward, You see a wall 2 steps left, You see a yellow ball 1 step left and 1 step forward, You see a green box 2 steps right \n Action 0: turn right \n Observation 1: You see a wall 2 steps left, You see a blue key 1 step right, You see a red ball 2 steps right and 1 step forward, You see a green box 2 steps forward \n Action 1: go forward \n Observation 2: You see a wall 2 steps left, You see a red ball 2 steps right, You see a green box 1 step forward \n Action 2: ";
const BLUE_BALL_TO_RED_BOX: &str = " \n Goal of the agent: put blue ball next to red box \n Observation 0: You carry a blue ball, You see a wall 5 steps forward, You see a wall 2 steps left, You see a grey key 1 step right and 2 steps forward, You see a red box 3 steps forward \n Action 0: go forward \n Observation 1: You carry a blue ball, You see a wall 4 steps forward, You see a wall 2 steps left, You see a grey key 1 step right and 1 step forward, You see a red box 2 steps forward \n Action 1: ";
const BLUE_BALL_THEN_RED_BOX: &str = " \n Goal of the agent: pick up the blue ball then go to the red box \n Observation 0: You see a wall 3 steps forward, You see a wall 4 steps right, You see a purple key 2 steps forward, You see a red box 2 steps right, You see a blue ball 2 steps left \n Action 0: ";
const RED_BOX_AFTER_BLUE_BALL: &str = " \n Goal of the agent: go to the red box after you pick up the blue ball \n Observation 0: You see a wall 3 steps forward, You see a wall 4 steps right, You see a purple key 2 steps forward, You see a red box 2 steps right, You see a blue ball 2 steps left \n Action 0: ";
const GREEN_KEY_THEN_RED_BOX: &str = " \n Goal of the agent: pick up the green key then pick up the the red box \n Observation 0: You carry a green key, You see a wall 4 steps forward, You see a wall 4 steps left, You see a red box 1 step left, You see a purple ball 2 steps left and 1 step forward \n Action 0:  ";

/// Full diagnostic set; the first two bodies form the short set.
const DIAGNOSTIC_BODIES: [&str; 11] = [
    GREEN_BALL_START,
    GREEN_BALL_TURNED,
    PURPLE_DOOR_START,
    PURPLE_DOOR_KEY_AHEAD,
    PURPLE_DOOR_CARRYING_KEY,
    GREEN_BOX_START,
    GREEN_BOX_TURNED,
    BLUE_BALL_TO_RED_BOX,
    BLUE_BALL_THEN_RED_BOX,
    RED_BOX_AFTER_BLUE_BALL,
    GREEN_KEY_THEN_RED_BOX,
];

/// Fixed prompts whose action distribution is logged after every update.
/// `template` 1 is the full set of eleven, 2 the first two. Any other value
/// yields no prompts and is rejected by config validation.
pub fn diagnostic_prompts(subgoals: &[String], template: u8) -> Vec<String> {
    let head = format!(
        "Possible action of the agent:{}",
        subgoals
            .iter()
            .map(|sg| format!(" {sg}"))
            .collect::<Vec<_>>()
            .join(",")
    );
    let bodies: &[&str] = match template {
        1 => &DIAGNOSTIC_BODIES,
        2 => &DIAGNOSTIC_BODIES[..2],
        _ => &[],
    };
    bodies.iter().map(|body| format!("{head}{body}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subgoals() -> Vec<String> {
        vec!["go forward".into(), "turn left".into()]
    }

    #[test]
    fn test_arena_drops_oldest() {
        let mut arena = HistoryArena::new(2, 3);
        for i in 0..5 {
            arena.push(0, i);
        }
        arena.push(1, 42);
        assert_eq!(arena.iter(0).copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(arena.iter(1).copied().collect::<Vec<_>>(), vec![42]);
        assert_eq!(arena.len(0), 3);
    }

    #[test]
    fn test_arena_clear_only_touches_slot() {
        let mut arena = HistoryArena::new(2, 2);
        arena.push(0, "a");
        arena.push(1, "b");
        arena.clear(0);
        assert!(arena.is_empty(0));
        assert_eq!(arena.iter(1).copied().collect::<Vec<_>>(), vec!["b"]);
        arena.push(0, "c");
        assert_eq!(arena.iter(0).copied().collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_arena_zero_capacity() {
        let mut arena: HistoryArena<u8> = HistoryArena::new(1, 0);
        arena.push(0, 1);
        assert!(arena.is_empty(0));
        assert_eq!(arena.iter(0).count(), 0);
    }

    #[test]
    fn test_prompt_layout() {
        let obs = vec![
            vec!["A wall 2 steps left".to_string(), "A ball 1 step forward".to_string()],
            vec!["A ball 0 steps forward".to_string()],
        ];
        let acts = vec!["go forward".to_string()];
        let prompt = generate_prompt("go to the ball", &subgoals(), obs.iter(), acts.iter());
        assert_eq!(
            prompt,
            "Possible action of the agent: go forward, turn left \n Goal of the agent: go to the ball \
             \n Observation 0: A wall 2 steps left, A ball 1 step forward, \n Action 0: go forward \
             \n Observation 1: A ball 0 steps forward, \n Action 1: "
        );
    }

    #[test]
    fn test_prompt_without_history() {
        let none: Vec<Vec<String>> = Vec::new();
        let no_acts: Vec<String> = Vec::new();
        let prompt = generate_prompt("open the door", &subgoals(), none.iter(), no_acts.iter());
        assert!(prompt.ends_with("Goal of the agent: open the door"));
    }

    #[test]
    fn test_modifier_replaces_words() {
        let modifier = PromptModifier::new([("Goal", "Objective"), ("agent", "robot")]);
        assert_eq!(
            modifier.apply("Goal of the agent: go"),
            "Objective of the robot: go"
        );
        assert!(PromptModifier::default().is_empty());
    }

    #[test]
    fn test_modifier_applies_pairs_in_given_order() {
        let chained = PromptModifier::new([("red", "blue"), ("blue", "green")]);
        assert_eq!(chained.apply("red ball"), "green ball");
        let reversed = PromptModifier::new([("blue", "green"), ("red", "blue")]);
        assert_eq!(reversed.apply("red ball"), "blue ball");
    }

    #[test]
    fn test_diagnostic_prompts_templates() {
        let long = diagnostic_prompts(&subgoals(), 1);
        let short = diagnostic_prompts(&subgoals(), 2);
        assert_eq!(long.len(), 11);
        assert_eq!(short.len(), 2);
        assert_eq!(short, long[..2].to_vec());
        assert!(short[0].starts_with("Possible action of the agent: go forward, turn left \n"));
        assert!(long[0].contains("A red box 2 steps right and 2 steps forward, \n Action 0: "));
        assert!(long[4].contains("You carry a purple key, You see a wall 1 step forward"));
        assert!(long[10].ends_with(
            "pick up the green key then pick up the the red box \n Observation 0: You carry a green key, You see a wall 4 steps forward, You see a wall 4 steps left, You see a red box 1 step left, You see a purple ball 2 steps left and 1 step forward \n Action 0:  "
        ));
        assert!(diagnostic_prompts(&subgoals(), 0).is_empty());
    }
}
