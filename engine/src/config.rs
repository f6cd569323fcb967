use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};

use hickory_proto::rr::RecordType;
use ip_network::IpNetwork;
use regex::Regex;
use uuid::Uuid;

use crate::error::Result;
use crate::requests::canonical;

/// Credentials attached to a data-source configuration entry.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub apikey: Option<String>,
    pub secret: Option<String>,
}

/// Per-source configuration keyed by the source name.
#[derive(Debug, Clone, Default)]
pub struct DataSourceConfig {
    pub name: String,
    /// HTTP response-cache lifetime for this source, in minutes.
    pub ttl_minutes: Option<u64>,
    pub credentials: Option<Credentials>,
}

/// SRV prefixes probed under every discovered subdomain. The list is part
/// of the configuration surface but closed at build time.
pub const POPULAR_SRV_LABELS: &[&str] = &[
    "_caldav._tcp",
    "_caldavs._tcp",
    "_carddav._tcp",
    "_carddavs._tcp",
    "_ceph._tcp",
    "_ceph-mon._tcp",
    "_imap._tcp",
    "_imaps._tcp",
    "_jabber._tcp",
    "_kerberos._tcp",
    "_kerberos._udp",
    "_kerberos-adm._tcp",
    "_kpasswd._udp",
    "_ldap._tcp",
    "_ldaps._tcp",
    "_matrix._tcp",
    "_minecraft._tcp",
    "_mysqlsrv._tcp",
    "_pop3._tcp",
    "_pop3s._tcp",
    "_sip._tcp",
    "_sip._udp",
    "_sips._tcp",
    "_smtp._tcp",
    "_smtps._tcp",
    "_stun._tcp",
    "_stun._udp",
    "_submission._tcp",
    "_xmpp-client._tcp",
    "_xmpp-server._tcp",
];

/// Fallback brute-forcing words used when no wordlist file is configured.
const DEFAULT_BRUTE_WORDS: &[&str] = &[
    "admin", "api", "app", "backup", "beta", "blog", "cdn", "chat", "ci", "cloud", "cms", "cpanel",
    "db", "demo", "dev", "docs", "email", "files", "ftp", "git", "help", "imap", "internal",
    "intranet", "lab", "mail", "media", "mobile", "monitor", "mx", "news", "ns1", "ns2", "owa",
    "portal", "proxy", "remote", "secure", "shop", "smtp", "ssh", "stage", "staging", "static",
    "support", "test", "vpn", "web", "webmail", "www",
];

/// Fallback alteration words appended or prefixed to discovered labels.
const DEFAULT_ALT_WORDS: &[&str] = &[
    "api", "app", "beta", "dev", "internal", "new", "old", "prod", "qa", "stage", "staging",
    "test", "uat", "v1", "v2", "web",
];

/// Scope state mutated while an enumeration runs: discovered apexes can be
/// added and wildcard parents appended to the blacklist.
#[derive(Debug, Default)]
struct Scope {
    domains: Vec<String>,
    regexes: HashMap<String, Regex>,
    blacklist: BTreeSet<String>,
}

/// The options recognised by the engine. On-disk parsing lives outside the
/// core; callers fill this struct directly.
#[derive(Debug)]
pub struct Config {
    /// Stable identifier attached to every graph write of this run.
    pub uuid: Uuid,

    scope: RwLock<Scope>,

    // Scope beyond apex domains.
    pub cidrs: Vec<IpNetwork>,
    pub asns: Vec<u32>,
    pub addresses: Vec<IpAddr>,
    pub ports: Vec<u16>,

    // DNS.
    pub resolvers: Vec<String>,
    pub trusted_resolvers: Vec<String>,
    pub max_dns_queries: usize,
    pub resolvers_qps: usize,
    pub trusted_qps: usize,
    pub record_types: Vec<RecordType>,
    pub minimum_ttl: u32,

    // Modes.
    pub active: bool,
    pub passive: bool,

    // Expansion.
    pub brute_forcing: bool,
    pub recursive: bool,
    pub min_for_recursive: u32,
    pub max_depth: usize,
    pub alterations: bool,
    pub flip_words: bool,
    pub flip_numbers: bool,
    pub add_words: bool,
    pub add_numbers: bool,
    pub edit_distance: u8,
    pub wordlist: Vec<String>,
    pub alt_wordlist: Vec<String>,

    pub data_sources: HashMap<String, DataSourceConfig>,
    pub output_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            scope: RwLock::new(Scope::default()),
            cidrs: Vec::new(),
            asns: Vec::new(),
            addresses: Vec::new(),
            ports: vec![80, 443],
            resolvers: Vec::new(),
            trusted_resolvers: Vec::new(),
            max_dns_queries: 7500,
            resolvers_qps: 100,
            trusted_qps: 500,
            record_types: vec![RecordType::CNAME, RecordType::A, RecordType::AAAA],
            minimum_ttl: 1440,
            active: false,
            passive: false,
            brute_forcing: false,
            recursive: true,
            min_for_recursive: 1,
            max_depth: 0,
            alterations: false,
            flip_words: true,
            flip_numbers: true,
            add_words: true,
            add_numbers: true,
            edit_distance: 1,
            wordlist: DEFAULT_BRUTE_WORDS.iter().map(|w| w.to_string()).collect(),
            alt_wordlist: DEFAULT_ALT_WORDS.iter().map(|w| w.to_string()).collect(),
            data_sources: HashMap::new(),
            output_dir: None,
        }
    }
}

impl Config {
    /// Convenience constructor seeding the scope with apex domains.
    pub fn new(domains: &[&str]) -> Self {
        let config = Self::default();
        for domain in domains {
            config.add_domain(domain);
        }
        config
    }

    /// Register an apex domain and compile its subdomain matcher.
    pub fn add_domain(&self, domain: &str) {
        let domain = canonical(domain);
        if domain.is_empty() {
            return;
        }
        let mut scope = self.scope.write().unwrap();
        if scope.domains.iter().any(|d| *d == domain) {
            return;
        }
        if let Some(re) = compile_domain_regex(&domain) {
            scope.regexes.insert(domain.clone(), re);
        }
        scope.domains.push(domain);
    }

    /// Snapshot of the configured apex domains.
    pub fn domains(&self) -> Vec<String> {
        self.scope.read().unwrap().domains.clone()
    }

    /// The longest configured apex that is a suffix of `name`, if any.
    pub fn which_domain(&self, name: &str) -> Option<String> {
        let name = canonical(name);
        let scope = self.scope.read().unwrap();
        scope
            .domains
            .iter()
            .filter(|d| crate::requests::has_suffix(&name, d))
            .max_by_key(|d| d.len())
            .cloned()
    }

    /// A name is in scope when some configured apex is a suffix of it and
    /// none of its labels is blacklisted.
    pub fn is_domain_in_scope(&self, name: &str) -> bool {
        self.which_domain(name).is_some() && !self.blacklisted(name)
    }

    /// Label-wise blacklist check: a name is blacklisted when it equals or
    /// sits under any blacklist entry.
    pub fn blacklisted(&self, name: &str) -> bool {
        let name = canonical(name);
        let scope = self.scope.read().unwrap();
        scope
            .blacklist
            .iter()
            .any(|entry| crate::requests::has_suffix(&name, entry))
    }

    /// Append a subdomain to the blacklist. Used both for user entries and
    /// for wildcard parents discovered by false-positive reversal.
    pub fn blacklist_subdomain(&self, name: &str) {
        let name = canonical(name);
        if name.is_empty() {
            return;
        }
        self.scope.write().unwrap().blacklist.insert(name);
    }

    pub fn blacklist(&self) -> Vec<String> {
        self.scope
            .read()
            .unwrap()
            .blacklist
            .iter()
            .cloned()
            .collect()
    }

    /// The compiled subdomain matcher for one configured apex.
    pub fn domain_regex(&self, domain: &str) -> Option<Regex> {
        self.scope
            .read()
            .unwrap()
            .regexes
            .get(&canonical(domain))
            .cloned()
    }

    /// Release budget for the pipeline source: one slot per trusted
    /// resolver query the pool can absorb.
    pub fn trusted_budget(&self) -> usize {
        let trusted = self.trusted_resolvers.len().max(1);
        (trusted * self.trusted_qps).max(1)
    }
}

/// Matcher for any syntactically plausible FQDN embedded in free text.
pub fn any_subdomain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(([a-zA-Z0-9]|[_a-zA-Z0-9][_a-zA-Z0-9-]{0,61}[a-zA-Z0-9])\.)+[a-zA-Z][a-zA-Z0-9-]{0,61}[a-zA-Z0-9]")
            .unwrap()
    })
}

/// Matcher for IPv4 literals embedded in free text (TXT/SPF mining).
pub fn ipv4_literal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"((25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)").unwrap())
}

fn compile_domain_regex(domain: &str) -> Option<Regex> {
    let pattern = format!(
        r"(?i)^(([a-zA-Z0-9]|[_a-zA-Z0-9][_a-zA-Z0-9-]{{0,61}}[a-zA-Z0-9])\.)*{}$",
        regex::escape(domain)
    );
    Regex::new(&pattern).ok()
}

/// Read a newline-separated wordlist, expanding `~` and environment
/// references in the path. Blank lines and `#` comments are skipped.
pub fn load_wordlist(path: &str) -> Result<Vec<String>> {
    let expanded = shellexpand::full(path)
        .map_err(|e| crate::error::EngineError::validation_error(&e.to_string()))?;
    let content = std::fs::read_to_string(expanded.as_ref())?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_ascii_lowercase())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_domain_prefers_the_longest_apex() {
        let config = Config::new(&["example.com", "dev.example.com"]);
        assert_eq!(
            config.which_domain("a.dev.example.com").as_deref(),
            Some("dev.example.com")
        );
        assert_eq!(
            config.which_domain("www.example.com").as_deref(),
            Some("example.com")
        );
        assert_eq!(config.which_domain("example.org"), None);
    }

    #[test]
    fn blacklist_removes_names_from_scope() {
        let config = Config::new(&["example.com"]);
        assert!(config.is_domain_in_scope("bad.example.com"));

        config.blacklist_subdomain("bad.example.com");
        assert!(!config.is_domain_in_scope("bad.example.com"));
        assert!(!config.is_domain_in_scope("deep.bad.example.com"));
        assert!(config.is_domain_in_scope("good.example.com"));
    }

    #[test]
    fn domain_regex_matches_children_and_apex_only() {
        let config = Config::new(&["example.com"]);
        let re = config.domain_regex("example.com").unwrap();
        assert!(re.is_match("example.com"));
        assert!(re.is_match("Host-1.Example.com"));
        assert!(re.is_match("_sip._tcp.example.com"));
        assert!(!re.is_match("example.org"));
        assert!(!re.is_match("badexample.com"));
    }

    #[test]
    fn free_text_matchers_find_names_and_addresses() {
        let text = "spf1 ip4:192.0.2.44 include:mail.example.com ~all";
        assert_eq!(
            any_subdomain_regex().find(text).map(|m| m.as_str()),
            Some("mail.example.com")
        );
        assert_eq!(
            ipv4_literal_regex().find(text).map(|m| m.as_str()),
            Some("192.0.2.44")
        );
    }
}
