//! Character-level Markov model trained on resolved subdomain labels,
//! used to guess additional names once enough training material exists.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use rand::Rng;

/// Trainings required before the first generation pass.
const MIN_TRAININGS: u32 = 50;

/// A generation pass runs every this many trainings past the minimum.
const TRAINING_STRIDE: u32 = 10;

/// Candidates produced per generation pass.
pub const CANDIDATES_PER_PASS: usize = 1000;

/// Longest label prefix the generator will produce.
const MAX_GENERATED_LEN: usize = 24;

/// Order of the model: transitions key on the previous two characters.
const NGRAM_LEN: usize = 2;

/// Start/stop sentinel kept outside the DNS alphabet.
const BOUNDARY: char = '\u{2}';

#[derive(Default)]
struct ModelState {
    /// `ngram -> next char -> observations`.
    transitions: HashMap<String, HashMap<char, u32>>,
    trainings: u32,
    apexes: BTreeSet<String>,
}

/// Shared, internally locked model. One instance lives per enumeration.
#[derive(Default)]
pub struct MarkovModel {
    state: Mutex<ModelState>,
}

impl MarkovModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn from one resolved name. `prefix` is the label part left of
    /// the apex; the apex is remembered as an attachment point for
    /// generated candidates.
    pub fn train(&self, prefix: &str, apex: &str) {
        if prefix.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.apexes.insert(apex.to_string());

        let padded: Vec<char> = std::iter::repeat(BOUNDARY)
            .take(NGRAM_LEN)
            .chain(prefix.chars())
            .chain(std::iter::once(BOUNDARY))
            .collect();
        for window in padded.windows(NGRAM_LEN + 1) {
            let key: String = window[..NGRAM_LEN].iter().collect();
            let next = window[NGRAM_LEN];
            *state
                .transitions
                .entry(key)
                .or_default()
                .entry(next)
                .or_default() += 1;
        }
        state.trainings += 1;
    }

    pub fn trainings(&self) -> u32 {
        self.state.lock().unwrap().trainings
    }

    /// True when a generation pass is due: enough material overall, and the
    /// training counter sits on a stride boundary.
    pub fn generation_due(&self) -> bool {
        let trainings = self.trainings();
        trainings >= MIN_TRAININGS && trainings % TRAINING_STRIDE == 0
    }

    /// Produce up to `count` candidate FQDNs across the trained apexes,
    /// deduplicated and excluding empty walks.
    pub fn generate(&self, count: usize) -> Vec<String> {
        let state = self.state.lock().unwrap();
        if state.transitions.is_empty() || state.apexes.is_empty() {
            return Vec::new();
        }

        let mut rng = rand::thread_rng();
        let mut out: BTreeSet<String> = BTreeSet::new();
        let apexes: Vec<&String> = state.apexes.iter().collect();

        // Bounded number of walks; duplicate walks collapse in the set.
        for _ in 0..count * 2 {
            if out.len() >= count {
                break;
            }
            let Some(prefix) = walk(&state.transitions, &mut rng) else {
                continue;
            };
            let apex = apexes[rng.gen_range(0..apexes.len())];
            out.insert(format!("{}.{}", prefix, apex));
        }
        out.into_iter().collect()
    }
}

fn walk(
    transitions: &HashMap<String, HashMap<char, u32>>,
    rng: &mut impl Rng,
) -> Option<String> {
    let mut context: String = std::iter::repeat(BOUNDARY).take(NGRAM_LEN).collect();
    let mut label = String::new();

    while label.len() < MAX_GENERATED_LEN {
        let choices = transitions.get(&context)?;
        let total: u32 = choices.values().sum();
        let mut pick = rng.gen_range(0..total.max(1));
        let mut chosen = BOUNDARY;
        for (ch, weight) in choices {
            if pick < *weight {
                chosen = *ch;
                break;
            }
            pick -= weight;
        }
        if chosen == BOUNDARY {
            break;
        }
        label.push(chosen);
        context = context.chars().skip(1).chain(std::iter::once(chosen)).collect();
    }

    let label = label.trim_matches('-').to_string();
    (!label.is_empty()).then_some(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_waits_for_the_training_threshold() {
        let model = MarkovModel::new();
        for i in 0..MIN_TRAININGS - 1 {
            model.train(&format!("host{}", i), "example.com");
            assert!(!model.generation_due());
        }
        model.train("final", "example.com");
        assert_eq!(model.trainings(), MIN_TRAININGS);
        assert!(model.generation_due());
    }

    #[test]
    fn generated_names_attach_to_trained_apexes() {
        let model = MarkovModel::new();
        for word in ["web", "webapp", "webmail", "website", "weblog"] {
            model.train(word, "example.com");
        }
        let names = model.generate(50);
        assert!(!names.is_empty());
        for name in &names {
            assert!(name.ends_with(".example.com"), "unexpected: {}", name);
            assert!(!name.starts_with('.'));
        }
    }

    #[test]
    fn an_untrained_model_generates_nothing() {
        let model = MarkovModel::new();
        assert!(model.generate(10).is_empty());
    }
}
