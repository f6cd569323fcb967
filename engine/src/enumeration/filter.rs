//! Trust-aware admission: the single dedup gate every name passes before
//! entering the resolution pipeline.

use std::sync::Mutex;

use bloomfilter::Bloom;

use crate::requests::Tag;

/// Sizing of the admission filter.
const FILTER_CAPACITY: usize = 1_000_000;
const FILTER_FP_RATE: f64 = 0.01;

/// Outcome of the admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting at this trust level; enter the pipeline.
    Accept,
    /// Already processed at an equal or higher trust level. The name may
    /// still be attributed to its graph node, but is not re-queued.
    Duplicate,
}

/// Bloom-backed dedup filter keyed by `name + trust class`.
///
/// The trust rule: once a name was accepted from a trusted tag it is never
/// re-queued; a name first seen from an untrusted tag may be re-queued
/// exactly once more, by a trusted tag arriving later.
pub struct AdmissionFilter {
    bloom: Mutex<Bloom<String>>,
}

impl AdmissionFilter {
    pub fn new() -> Self {
        let bloom = Bloom::new_for_fp_rate(FILTER_CAPACITY, FILTER_FP_RATE)
            .unwrap_or_else(|_| Bloom::new(1 << 21, FILTER_CAPACITY).expect("bloom sizing"));
        Self {
            bloom: Mutex::new(bloom),
        }
    }

    pub fn admit(&self, name: &str, tag: Tag) -> Admission {
        let trusted_key = format!("{}\u{1}trusted", name);
        let untrusted_key = format!("{}\u{1}untrusted", name);

        let mut bloom = self.bloom.lock().unwrap();
        if bloom.check(&trusted_key) {
            return Admission::Duplicate;
        }
        if bloom.check(&untrusted_key) {
            if tag.trusted() {
                bloom.set(&trusted_key);
                return Admission::Accept;
            }
            return Admission::Duplicate;
        }
        if tag.trusted() {
            bloom.set(&trusted_key);
        } else {
            bloom.set(&untrusted_key);
        }
        Admission::Accept
    }
}

impl Default for AdmissionFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_name_passes_at_most_twice_and_only_in_trust_order() {
        let filter = AdmissionFilter::new();

        assert_eq!(filter.admit("a.example.com", Tag::Brute), Admission::Accept);
        assert_eq!(
            filter.admit("a.example.com", Tag::Scrape),
            Admission::Duplicate
        );
        // Escalation to a trusted tag passes once more.
        assert_eq!(filter.admit("a.example.com", Tag::Dns), Admission::Accept);
        assert_eq!(
            filter.admit("a.example.com", Tag::Axfr),
            Admission::Duplicate
        );
        assert_eq!(
            filter.admit("a.example.com", Tag::Brute),
            Admission::Duplicate
        );
    }

    #[test]
    fn a_trusted_first_sighting_blocks_everything_after_it() {
        let filter = AdmissionFilter::new();

        assert_eq!(filter.admit("b.example.com", Tag::Cert), Admission::Accept);
        assert_eq!(
            filter.admit("b.example.com", Tag::Dns),
            Admission::Duplicate
        );
        assert_eq!(
            filter.admit("b.example.com", Tag::Brute),
            Admission::Duplicate
        );
    }

    #[test]
    fn distinct_names_do_not_interfere() {
        let filter = AdmissionFilter::new();
        assert_eq!(filter.admit("a.example.com", Tag::Dns), Admission::Accept);
        assert_eq!(filter.admit("b.example.com", Tag::Dns), Admission::Accept);
    }
}
