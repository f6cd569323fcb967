//! Name alterations: mutations of a discovered FQDN's first label that
//! frequently exist alongside the original.

use std::collections::BTreeSet;

use crate::config::Config;
use crate::requests::is_fqdn;

/// Upper bound on variants produced for one input name, fuzzy searches
/// included. Keeps pathological labels from flooding the queue.
const MAX_VARIANTS: usize = 256;

const LABEL_CHARS: &[char] = &[
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', '-',
];

/// Apply the configured mutators to `name` and return the deduplicated,
/// syntactically valid variants (the input itself excluded).
pub fn alterations(config: &Config, name: &str) -> Vec<String> {
    let Some((label, rest)) = name.split_once('.') else {
        return Vec::new();
    };
    if label.is_empty() {
        return Vec::new();
    }

    let mut variants: BTreeSet<String> = BTreeSet::new();
    if config.flip_numbers {
        flip_numbers(label, &mut variants);
    }
    if config.add_numbers {
        append_numbers(label, &mut variants);
    }
    if config.flip_words {
        flip_words(label, &config.alt_wordlist, &mut variants);
    }
    if config.add_words {
        add_suffix_word(label, &config.alt_wordlist, &mut variants);
        add_prefix_word(label, &config.alt_wordlist, &mut variants);
    }
    for _ in 0..config.edit_distance {
        let seeds: Vec<String> = if variants.is_empty() {
            vec![label.to_string()]
        } else {
            variants.iter().cloned().collect()
        };
        for seed in seeds {
            if variants.len() >= MAX_VARIANTS {
                break;
            }
            fuzzy_label_searches(&seed, &mut variants);
        }
    }

    variants.remove(label);
    variants
        .into_iter()
        .take(MAX_VARIANTS)
        .map(|variant| format!("{}.{}", variant, rest))
        .filter(|candidate| candidate != name && is_fqdn(candidate))
        .collect()
}

/// Substitute every digit position with each other digit.
fn flip_numbers(label: &str, out: &mut BTreeSet<String>) {
    for (idx, ch) in label.char_indices() {
        if !ch.is_ascii_digit() {
            continue;
        }
        for digit in '0'..='9' {
            if digit == ch {
                continue;
            }
            let mut variant = label.to_string();
            variant.replace_range(idx..idx + 1, &digit.to_string());
            out.insert(variant);
        }
    }
}

/// Append the digits 0-9, plain and hyphenated.
fn append_numbers(label: &str, out: &mut BTreeSet<String>) {
    for digit in '0'..='9' {
        out.insert(format!("{}{}", label, digit));
        out.insert(format!("{}-{}", label, digit));
    }
}

/// Swap the leading or trailing hyphenated token for each wordlist word.
fn flip_words(label: &str, words: &[String], out: &mut BTreeSet<String>) {
    if let Some((_, tail)) = label.split_once('-') {
        for word in words {
            out.insert(format!("{}-{}", word, tail));
        }
    }
    if let Some((head, _)) = label.rsplit_once('-') {
        for word in words {
            out.insert(format!("{}-{}", head, word));
        }
    }
}

fn add_suffix_word(label: &str, words: &[String], out: &mut BTreeSet<String>) {
    for word in words {
        out.insert(format!("{}{}", label, word));
        out.insert(format!("{}-{}", label, word));
    }
}

fn add_prefix_word(label: &str, words: &[String], out: &mut BTreeSet<String>) {
    for word in words {
        out.insert(format!("{}{}", word, label));
        out.insert(format!("{}-{}", word, label));
    }
}

/// Single-step edit-distance variants: deletions, substitutions and
/// insertions over the DNS label alphabet.
fn fuzzy_label_searches(label: &str, out: &mut BTreeSet<String>) {
    let chars: Vec<char> = label.chars().collect();

    for idx in 0..chars.len() {
        if out.len() >= MAX_VARIANTS {
            return;
        }
        let mut deleted: String = chars[..idx].iter().collect();
        deleted.extend(&chars[idx + 1..]);
        out.insert(deleted);

        for ch in LABEL_CHARS {
            let mut substituted: String = chars[..idx].iter().collect();
            substituted.push(*ch);
            substituted.extend(&chars[idx + 1..]);
            out.insert(substituted);
        }
    }
    for idx in 0..=chars.len() {
        if out.len() >= MAX_VARIANTS {
            return;
        }
        for ch in LABEL_CHARS {
            let mut inserted: String = chars[..idx].iter().collect();
            inserted.push(*ch);
            inserted.extend(&chars[idx..]);
            out.insert(inserted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(words: &[&str]) -> Config {
        let mut config = Config::new(&["example.com"]);
        config.alt_wordlist = words.iter().map(|w| w.to_string()).collect();
        config.edit_distance = 0;
        config
    }

    #[test]
    fn number_flips_and_appends() {
        let mut config = config_with(&[]);
        config.flip_words = false;
        config.add_words = false;
        let variants = alterations(&config, "web1.example.com");

        assert!(variants.contains(&"web2.example.com".to_string()));
        assert!(variants.contains(&"web9.example.com".to_string()));
        assert!(variants.contains(&"web10.example.com".to_string()));
        assert!(variants.contains(&"web1-1.example.com".to_string()));
        assert!(!variants.contains(&"web1.example.com".to_string()));
    }

    #[test]
    fn word_mutators_use_the_alt_wordlist() {
        let config = config_with(&["dev", "staging"]);
        let variants = alterations(&config, "api-prod.example.com");

        assert!(variants.contains(&"dev-prod.example.com".to_string()));
        assert!(variants.contains(&"api-dev.example.com".to_string()));
        assert!(variants.contains(&"staging-api-prod.example.com".to_string()));
        assert!(variants.contains(&"api-proddev.example.com".to_string()));
    }

    #[test]
    fn fuzzy_variants_stay_valid_names() {
        let mut config = config_with(&[]);
        config.flip_numbers = false;
        config.add_numbers = false;
        config.flip_words = false;
        config.add_words = false;
        config.edit_distance = 1;

        let variants = alterations(&config, "db.example.com");
        assert!(!variants.is_empty());
        assert!(variants.len() <= MAX_VARIANTS);
        for variant in &variants {
            assert!(is_fqdn(variant), "invalid variant {}", variant);
        }
        // A single-character deletion of "db" leaves a one-char label.
        assert!(variants.contains(&"d.example.com".to_string()));
    }

    #[test]
    fn names_without_labels_produce_nothing() {
        let config = config_with(&["dev"]);
        assert!(alterations(&config, "com").is_empty());
    }
}
