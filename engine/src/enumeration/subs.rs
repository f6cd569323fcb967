//! Subdomain bookkeeping: detects proper subdomains among resolved names,
//! counts distinct children per parent, and gates recursive brute-forcing.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::config::Config;
use crate::requests::has_suffix;

/// A parent observation produced while recording one resolved name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentObservation {
    pub name: String,
    /// Distinct children seen under the parent so far, this one included.
    pub times: u32,
}

#[derive(Default)]
struct TrackerState {
    /// parent subdomain → hashes of distinct children observed.
    children: HashMap<String, HashSet<u64>>,
}

/// Per-enumeration tracker of parent subdomains and their child counts.
#[derive(Default)]
pub struct SubdomainTracker {
    state: Mutex<TrackerState>,
}

impl SubdomainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resolved name. Returns the immediate-parent observation
    /// when the name is a proper child of some subdomain (the apex itself
    /// included), or nothing for the apex and out-of-scope shapes.
    pub fn observe(&self, name: &str, apex: &str) -> Option<ParentObservation> {
        let parent = immediate_parent(name, apex)?;

        let mut digest = DefaultHasher::new();
        name.hash(&mut digest);
        let child = digest.finish();

        let mut state = self.state.lock().unwrap();
        let children = state.children.entry(parent.clone()).or_default();
        children.insert(child);
        Some(ParentObservation {
            name: parent,
            times: children.len() as u32,
        })
    }

    /// Current child count for a parent.
    pub fn times(&self, parent: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .children
            .get(parent)
            .map(|children| children.len() as u32)
            .unwrap_or(0)
    }
}

/// The parent one label up from `name`, as long as the result still sits
/// at or under `apex`.
pub fn immediate_parent(name: &str, apex: &str) -> Option<String> {
    if name == apex || !has_suffix(name, apex) {
        return None;
    }
    let (_, parent) = name.split_once('.')?;
    has_suffix(parent, apex).then(|| parent.to_string())
}

/// Whether the depth of `name` below `apex` stays within the configured
/// expansion limit. A zero limit disables the check.
pub fn within_depth(config: &Config, name: &str, apex: &str) -> bool {
    if config.max_depth == 0 {
        return true;
    }
    let extra = name.matches('.').count().saturating_sub(apex.matches('.').count());
    extra <= config.max_depth
}

/// Brute-force candidates for one eligible parent: `word.parent` for every
/// configured word.
pub fn brute_candidates(config: &Config, parent: &str) -> Vec<String> {
    config
        .wordlist
        .iter()
        .map(|word| format!("{}.{}", word, parent))
        .collect()
}

/// Whether a parent has earned recursive brute-forcing.
pub fn recursive_eligible(config: &Config, parent: &str, apex: &str, times: u32) -> bool {
    if !config.brute_forcing || !config.recursive {
        return false;
    }
    if parent == apex {
        return true;
    }
    times >= config.min_for_recursive
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_parents_stop_at_the_apex() {
        assert_eq!(
            immediate_parent("a.b.example.com", "example.com").as_deref(),
            Some("b.example.com")
        );
        assert_eq!(
            immediate_parent("www.example.com", "example.com").as_deref(),
            Some("example.com")
        );
        assert_eq!(immediate_parent("example.com", "example.com"), None);
        assert_eq!(immediate_parent("x.other.org", "example.com"), None);
    }

    #[test]
    fn times_counts_distinct_children_only() {
        let tracker = SubdomainTracker::new();

        let first = tracker.observe("a.dev.example.com", "example.com").unwrap();
        assert_eq!(first.times, 1);

        // The same child again does not move the counter.
        let again = tracker.observe("a.dev.example.com", "example.com").unwrap();
        assert_eq!(again.times, 1);

        let second = tracker.observe("b.dev.example.com", "example.com").unwrap();
        assert_eq!(second.name, "dev.example.com");
        assert_eq!(second.times, 2);
        assert_eq!(tracker.times("dev.example.com"), 2);
    }

    #[test]
    fn recursion_waits_for_the_threshold() {
        let mut config = Config::new(&["example.com"]);
        config.brute_forcing = true;
        config.recursive = true;
        config.min_for_recursive = 3;

        assert!(recursive_eligible(&config, "example.com", "example.com", 0));
        assert!(!recursive_eligible(&config, "dev.example.com", "example.com", 2));
        assert!(recursive_eligible(&config, "dev.example.com", "example.com", 3));

        config.brute_forcing = false;
        assert!(!recursive_eligible(&config, "example.com", "example.com", 9));
    }

    #[test]
    fn depth_limit_counts_labels_below_the_apex() {
        let mut config = Config::new(&["example.com"]);
        config.max_depth = 2;
        assert!(within_depth(&config, "a.b.example.com", "example.com"));
        assert!(!within_depth(&config, "a.b.c.example.com", "example.com"));
        config.max_depth = 0;
        assert!(within_depth(&config, "a.b.c.d.example.com", "example.com"));
    }

    #[test]
    fn brute_candidates_prepend_every_word() {
        let mut config = Config::new(&["example.com"]);
        config.wordlist = vec!["dev".to_string(), "mail".to_string()];
        assert_eq!(
            brute_candidates(&config, "example.com"),
            vec!["dev.example.com".to_string(), "mail.example.com".to_string()]
        );
    }
}
