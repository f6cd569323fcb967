use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ip_network::IpNetwork;

/// Provenance class attached to every pipeline request.
///
/// The tag drives trust decisions: names arriving with a trusted tag were
/// produced by an authoritative or first-party mechanism and skip wildcard
/// suppression, while untrusted tags must be re-verified on the trusted
/// resolver pool before their answers are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tag {
    Dns,
    Axfr,
    Cert,
    Crawl,
    Archive,
    Brute,
    Alt,
    Guess,
    Api,
    Scrape,
    External,
    Rir,
    #[default]
    None,
}

impl Tag {
    /// True for tags whose results come from authoritative or first-party
    /// sources. Trusted results are exempt from wildcard suppression and
    /// from trusted-pool re-verification.
    pub fn trusted(self) -> bool {
        matches!(
            self,
            Tag::Dns | Tag::Axfr | Tag::Cert | Tag::Crawl | Tag::Archive
        )
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tag::Dns => "dns",
            Tag::Axfr => "axfr",
            Tag::Cert => "cert",
            Tag::Crawl => "crawl",
            Tag::Archive => "archive",
            Tag::Brute => "brute",
            Tag::Alt => "alt",
            Tag::Guess => "guess",
            Tag::Api => "api",
            Tag::Scrape => "scrape",
            Tag::External => "external",
            Tag::Rir => "rir",
            Tag::None => "none",
        };
        write!(f, "{}", name)
    }
}

/// Lowercase a DNS string and strip leading/trailing label separators.
///
/// Every name and rdata string entering the pipeline goes through this
/// before comparison or storage, so graph lookups never miss on case or a
/// trailing dot.
pub fn canonical(value: &str) -> String {
    value.trim_matches('.').to_ascii_lowercase()
}

/// Syntactic FQDN check: two or more labels, each 1-63 characters drawn
/// from letters, digits, hyphen and underscore, no hyphen at a label edge,
/// at most 253 characters overall.
pub fn is_fqdn(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 || !name.contains('.') {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// True when `domain` is `name` itself or a proper suffix of it on a label
/// boundary.
pub fn has_suffix(name: &str, domain: &str) -> bool {
    name == domain || name.ends_with(&format!(".{}", domain))
}

/// A single converted DNS answer.
///
/// `data` is rendered lowercase and dot-trimmed; for SOA records the
/// canonical rendering is `MNAME RNAME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub rr_type: u16,
    pub ttl: u32,
    pub data: String,
}

impl DnsAnswer {
    pub fn new(name: &str, rr_type: u16, ttl: u32, data: &str) -> Self {
        Self {
            name: canonical(name),
            rr_type,
            ttl,
            data: canonical(data),
        }
    }
}

/// A name to be resolved, or a positively resolved record set when wrapped
/// in [`Request::Resolved`].
#[derive(Debug, Clone, Default)]
pub struct DnsRequest {
    pub name: String,
    pub domain: String,
    pub records: Vec<DnsAnswer>,
    pub tag: Tag,
    pub source: String,
}

impl DnsRequest {
    pub fn new(name: &str, domain: &str, tag: Tag, source: &str) -> Self {
        Self {
            name: canonical(name),
            domain: canonical(domain),
            records: Vec::new(),
            tag,
            source: source.to_string(),
        }
    }

    /// A request is valid when both names are syntactically valid and the
    /// apex is a suffix of the name.
    pub fn valid(&self) -> bool {
        is_fqdn(&self.name) && is_fqdn(&self.domain) && has_suffix(&self.name, &self.domain)
    }
}

/// A proper subdomain observed to own child names.
#[derive(Debug, Clone)]
pub struct SubdomainRequest {
    pub name: String,
    pub domain: String,
    /// Number of distinct child FQDNs observed under this subdomain so far.
    pub times: u32,
    pub tag: Tag,
    pub source: String,
}

impl SubdomainRequest {
    pub fn valid(&self) -> bool {
        is_fqdn(&self.name)
            && is_fqdn(&self.domain)
            && has_suffix(&self.name, &self.domain)
            && self.times >= 1
    }
}

/// An address tied to an apex, flowing toward reverse resolution and ASN
/// lookup.
#[derive(Debug, Clone)]
pub struct AddrRequest {
    pub address: IpAddr,
    pub domain: String,
    pub in_scope: bool,
    pub tag: Tag,
    pub source: String,
}

impl AddrRequest {
    pub fn valid(&self) -> bool {
        is_fqdn(&self.domain)
    }
}

/// A partial or complete autonomous-system record.
///
/// `prefix`, when set, has been re-parsed through the CIDR parser, as has
/// every member of `netblocks`; textual prefixes never reach the cache
/// unchecked.
#[derive(Debug, Clone, Default)]
pub struct AsnRequest {
    pub address: Option<IpAddr>,
    pub asn: u32,
    pub prefix: Option<IpNetwork>,
    pub cc: String,
    pub registry: String,
    pub allocation_date: Option<DateTime<Utc>>,
    pub description: String,
    pub netblocks: Vec<IpNetwork>,
    pub tag: Tag,
    pub source: String,
}

impl AsnRequest {
    /// Valid when it names an address to look up or carries a prefix to
    /// merge; a prefix claiming to contain an address must actually do so.
    pub fn valid(&self) -> bool {
        if self.address.is_none() && self.prefix.is_none() {
            return false;
        }
        match (self.address, self.prefix) {
            (Some(addr), Some(prefix)) => prefix.contains(addr),
            _ => true,
        }
    }
}

/// A zone-transfer attempt against one authoritative server.
#[derive(Debug, Clone)]
pub struct ZoneXfrRequest {
    pub name: String,
    pub domain: String,
    /// Authoritative NS hostname to transfer from.
    pub server: String,
    pub tag: Tag,
    pub source: String,
}

impl ZoneXfrRequest {
    pub fn valid(&self) -> bool {
        is_fqdn(&self.name) && is_fqdn(&self.domain) && is_fqdn(&self.server)
    }
}

/// Registrant-level association discovered through whois-style sources.
#[derive(Debug, Clone, Default)]
pub struct WhoisRequest {
    pub domain: String,
    pub company: Option<String>,
    pub email: Option<String>,
    pub new_domains: Vec<String>,
    pub tag: Tag,
    pub source: String,
}

/// The closed set of pipeline messages.
///
/// Dispatch is an exhaustive match on this enum; a request that does not
/// fit a variant does not enter the pipeline.
#[derive(Debug, Clone)]
pub enum Request {
    Dns(DnsRequest),
    Resolved(DnsRequest),
    Subdomain(SubdomainRequest),
    Addr(AddrRequest),
    Asn(AsnRequest),
    Whois(WhoisRequest),
    ZoneXfr(ZoneXfrRequest),
}

impl Request {
    pub fn variant(&self) -> &'static str {
        match self {
            Request::Dns(_) => "DNS",
            Request::Resolved(_) => "Resolved",
            Request::Subdomain(_) => "Subdomain",
            Request::Addr(_) => "Addr",
            Request::Asn(_) => "ASN",
            Request::Whois(_) => "Whois",
            Request::ZoneXfr(_) => "ZoneXFR",
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            Request::Dns(r) | Request::Resolved(r) => r.tag,
            Request::Subdomain(r) => r.tag,
            Request::Addr(r) => r.tag,
            Request::Asn(r) => r.tag,
            Request::Whois(r) => r.tag,
            Request::ZoneXfr(r) => r.tag,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Request::Dns(r) | Request::Resolved(r) => &r.source,
            Request::Subdomain(r) => &r.source,
            Request::Addr(r) => &r.source,
            Request::Asn(r) => &r.source,
            Request::Whois(r) => &r.source,
            Request::ZoneXfr(r) => &r.source,
        }
    }

    /// The apex domain the request belongs to, when it carries one.
    pub fn domain(&self) -> Option<&str> {
        match self {
            Request::Dns(r) | Request::Resolved(r) => Some(&r.domain),
            Request::Subdomain(r) => Some(&r.domain),
            Request::Addr(r) => Some(&r.domain),
            Request::Asn(_) => None,
            Request::Whois(r) => Some(&r.domain),
            Request::ZoneXfr(r) => Some(&r.domain),
        }
    }

    pub fn valid(&self) -> bool {
        match self {
            Request::Dns(r) | Request::Resolved(r) => r.valid(),
            Request::Subdomain(r) => r.valid(),
            Request::Addr(r) => is_fqdn(&r.domain),
            Request::Asn(r) => r.valid(),
            Request::Whois(r) => is_fqdn(&r.domain),
            Request::ZoneXfr(r) => {
                is_fqdn(&r.name) && is_fqdn(&r.domain) && is_fqdn(&r.server)
            }
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Dns(r) | Request::Resolved(r) => {
                write!(f, "{} request for {} ({})", self.variant(), r.name, r.tag)
            }
            Request::Subdomain(r) => {
                write!(f, "Subdomain request for {} (times {})", r.name, r.times)
            }
            Request::Addr(r) => write!(f, "Addr request for {}", r.address),
            Request::Asn(r) => match (r.address, r.asn) {
                (Some(addr), 0) => write!(f, "ASN request for {}", addr),
                _ => write!(f, "ASN request for AS{}", r.asn),
            },
            Request::Whois(r) => write!(f, "Whois request for {}", r.domain),
            Request::ZoneXfr(r) => {
                write!(f, "ZoneXFR request for {} against {}", r.name, r.server)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_tags_are_the_closed_first_party_set() {
        for tag in [Tag::Dns, Tag::Axfr, Tag::Cert, Tag::Crawl, Tag::Archive] {
            assert!(tag.trusted(), "{} should be trusted", tag);
        }
        for tag in [
            Tag::Brute,
            Tag::Alt,
            Tag::Guess,
            Tag::Api,
            Tag::Scrape,
            Tag::External,
            Tag::Rir,
            Tag::None,
        ] {
            assert!(!tag.trusted(), "{} should be untrusted", tag);
        }
    }

    #[test]
    fn canonical_lowercases_and_trims_dots() {
        assert_eq!(canonical("WWW.Example.COM."), "www.example.com");
        assert_eq!(canonical(".app.example.com"), "app.example.com");
    }

    #[test]
    fn dns_request_requires_domain_suffix() {
        let good = DnsRequest::new("www.example.com", "example.com", Tag::Dns, "seed");
        assert!(good.valid());

        let apex_only = DnsRequest::new("example.com", "example.com", Tag::Dns, "seed");
        assert!(apex_only.valid());

        let mismatch = DnsRequest::new("www.example.org", "example.com", Tag::Dns, "seed");
        assert!(!mismatch.valid());

        // "badexample.com" must not count as a suffix match for "example.com".
        let not_on_boundary = DnsRequest::new("badexample.com", "example.com", Tag::Dns, "seed");
        assert!(!not_on_boundary.valid());
    }

    #[test]
    fn fqdn_check_rejects_degenerate_names() {
        assert!(is_fqdn("example.com"));
        assert!(is_fqdn("_sip._tcp.example.com"));
        assert!(!is_fqdn("com"));
        assert!(!is_fqdn(""));
        assert!(!is_fqdn("-bad.example.com"));
        assert!(!is_fqdn(&format!("{}.example.com", "a".repeat(64))));
    }

    #[test]
    fn asn_request_prefix_must_contain_address() {
        let req = AsnRequest {
            address: Some("72.237.4.113".parse().unwrap()),
            asn: 26808,
            prefix: Some("72.237.4.0/24".parse().unwrap()),
            ..Default::default()
        };
        assert!(req.valid());

        let wrong = AsnRequest {
            address: Some("8.8.8.8".parse().unwrap()),
            asn: 26808,
            prefix: Some("72.237.4.0/24".parse().unwrap()),
            ..Default::default()
        };
        assert!(!wrong.valid());

        assert!(!AsnRequest::default().valid());
    }
}
