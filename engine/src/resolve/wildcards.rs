//! Wildcard profiles: per-apex answer sets observed for random labels.
//!
//! The store is passive; probe orchestration lives with the trusted pool,
//! which is the only pool allowed to populate profiles.

use std::collections::{BTreeSet, HashMap};

use hickory_proto::op::Message;
use rand::RngCore;
use tokio::sync::Mutex;

use crate::requests::DnsAnswer;
use crate::resolve::answers;

/// Number of distinct FQDNs attached to one address before the graph is
/// re-examined for a missed wildcard.
pub const FALSE_POSITIVE_THRESHOLD: usize = 100;

/// Probes issued per (apex, type) while populating a profile.
pub(crate) const PROBE_COUNT: usize = 3;

/// A label that will not exist under a legitimate zone: sixteen random hex
/// characters.
pub fn unlikely_label() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The answer sets of a response, keyed by record type. Wildcard
/// comparison is set-equality on the rendered data strings.
pub fn answer_sets(msg: &Message) -> HashMap<u16, BTreeSet<String>> {
    group_answers(&answers::extract_answers(msg))
}

pub fn group_answers(records: &[DnsAnswer]) -> HashMap<u16, BTreeSet<String>> {
    let mut sets: HashMap<u16, BTreeSet<String>> = HashMap::new();
    for answer in records {
        sets.entry(answer.rr_type)
            .or_default()
            .insert(answer.data.clone());
    }
    sets
}

/// Lazily populated per-apex wildcard profiles.
#[derive(Default)]
pub struct WildcardStore {
    profiles: Mutex<HashMap<(String, u16), BTreeSet<String>>>,
}

impl WildcardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded profile answer set for `(apex, rr_type)`, if one was
    /// ever probed.
    pub async fn profile(&self, apex: &str, rr_type: u16) -> Option<BTreeSet<String>> {
        self.profiles
            .lock()
            .await
            .get(&(apex.to_string(), rr_type))
            .cloned()
    }

    pub async fn has_profile(&self, apex: &str, rr_type: u16) -> bool {
        self.profiles
            .lock()
            .await
            .contains_key(&(apex.to_string(), rr_type))
    }

    /// Record the union of probe answers for `(apex, rr_type)`. Recording
    /// twice unions the sets, so racing probes stay harmless.
    pub async fn record(&self, apex: &str, rr_type: u16, answers: BTreeSet<String>) {
        self.profiles
            .lock()
            .await
            .entry((apex.to_string(), rr_type))
            .or_default()
            .extend(answers);
    }

    /// Set-equality check of a candidate answer set against the profile.
    /// An empty profile means the apex does not wildcard that type.
    pub async fn matches(&self, apex: &str, rr_type: u16, candidate: &BTreeSet<String>) -> bool {
        match self.profile(apex, rr_type).await {
            Some(profile) if !profile.is_empty() => profile == *candidate,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlikely_labels_are_random_hex() {
        let a = unlikely_label();
        let b = unlikely_label();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn profile_comparison_is_set_equality() {
        let store = WildcardStore::new();
        store
            .record(
                "w.example",
                1,
                BTreeSet::from(["203.0.113.7".to_string()]),
            )
            .await;

        let same = BTreeSet::from(["203.0.113.7".to_string()]);
        assert!(store.matches("w.example", 1, &same).await);

        let different = BTreeSet::from(["198.51.100.1".to_string()]);
        assert!(!store.matches("w.example", 1, &different).await);

        // No profile for the type means no wildcard claim.
        assert!(!store.matches("w.example", 28, &same).await);
    }

    #[test]
    fn grouping_splits_mixed_answers_by_type() {
        let answers = vec![
            DnsAnswer::new("x.example.com", 1, 60, "192.0.2.1"),
            DnsAnswer::new("x.example.com", 1, 60, "192.0.2.2"),
            DnsAnswer::new("x.example.com", 28, 60, "2001:db8::1"),
        ];
        let sets = group_answers(&answers);
        assert_eq!(sets[&1].len(), 2);
        assert_eq!(sets[&28].len(), 1);
    }
}
