//! HTTP plumbing: a reconnaissance-tuned client, page pulls, and a
//! bounded breadth-first crawler that mines every page for names.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use url::Url;

use crate::config::any_subdomain_regex;
use crate::error::Result;
use crate::net::{CRAWL_TIMEOUT, HTTP_TIMEOUT};
use crate::requests::canonical;

/// Maximum BFS depth for one crawl.
pub const MAX_CRAWL_DEPTH: usize = 50;

/// Pages fetched per crawl before the frontier is abandoned.
const MAX_CRAWL_PAGES: usize = 250;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Client used for reconnaissance requests: invalid certificates are
/// expected in scope, and the peer certificate is kept for SAN mining.
pub fn client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .tls_info(true)
        .build()?)
}

/// Fetch one page and return its body for successful (non-5xx, non-4xx)
/// responses.
pub async fn pull_page(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() && !status.is_redirection() {
        return Err(crate::error::EngineError::validation_error(&format!(
            "{} answered {}",
            url, status
        )));
    }
    Ok(response.text().await?)
}

/// Everything a crawl discovered.
#[derive(Debug, Default)]
pub struct CrawlFindings {
    pub names: BTreeSet<String>,
}

/// Bounded breadth-first crawl from `seed`.
///
/// Each fetched page contributes: the hostname of every followed URL,
/// FQDNs embedded in the body, DNS SANs of the TLS peer certificate, and
/// FQDNs named by Content-Security-Policy headers. Only links whose host
/// passes `in_scope` are followed.
pub async fn crawl(
    client: &reqwest::Client,
    seed: &str,
    in_scope: impl Fn(&str) -> bool,
) -> CrawlFindings {
    let mut findings = CrawlFindings::default();
    let Ok(seed_url) = Url::parse(seed) else {
        return findings;
    };

    let deadline = Instant::now() + CRAWL_TIMEOUT;
    let mut frontier: VecDeque<(Url, usize)> = VecDeque::from([(seed_url, 0)]);
    let mut visited: HashSet<String> = HashSet::new();
    let mut fetched = 0usize;

    while let Some((url, depth)) = frontier.pop_front() {
        if Instant::now() >= deadline || fetched >= MAX_CRAWL_PAGES {
            break;
        }
        if depth > MAX_CRAWL_DEPTH || !visited.insert(url.to_string()) {
            continue;
        }

        if let Some(host) = url.host_str() {
            findings.names.insert(canonical(host));
        }

        let response = match client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(err) => {
                log::debug!("crawl fetch of {} failed: {}", url, err);
                continue;
            }
        };
        fetched += 1;

        for value in response.headers().get_all("content-security-policy") {
            if let Ok(text) = value.to_str() {
                collect_names(text, &mut findings.names);
            }
        }
        if let Some(tls) = response.extensions().get::<reqwest::tls::TlsInfo>() {
            if let Some(der) = tls.peer_certificate() {
                for name in crate::net::tls::names_from_der(der) {
                    findings.names.insert(name);
                }
            }
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(_) => continue,
        };
        collect_names(&body, &mut findings.names);

        for link in links_in(&body) {
            let Ok(next) = url.join(&link) else { continue };
            let Some(host) = next.host_str() else { continue };
            if in_scope(host) {
                frontier.push_back((next, depth + 1));
            }
        }
    }
    findings
}

/// FQDNs in free text, canonicalised, leading wildcard labels stripped.
pub fn collect_names(text: &str, out: &mut BTreeSet<String>) {
    for found in any_subdomain_regex().find_iter(text) {
        let name = canonical(found.as_str().trim_start_matches("*."));
        if !name.is_empty() {
            out.insert(name);
        }
    }
}

/// href/src link targets in an HTML body.
fn links_in(body: &str) -> Vec<String> {
    static LINK_RE: OnceLock<Regex> = OnceLock::new();
    let re = LINK_RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:href|src|action)\s*=\s*["']([^"'#\s]+)["']"#).unwrap()
    });
    re.captures_iter(body)
        .filter_map(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|target| !target.starts_with("javascript:") && !target.starts_with("mailto:"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_extraction_finds_html_references() {
        let body = r#"
            <a href="https://app.example.com/login">x</a>
            <script src='/static/main.js'></script>
            <a href="mailto:admin@example.com">mail</a>
            <form action="https://forms.example.com/post">
        "#;
        let links = links_in(body);
        assert!(links.contains(&"https://app.example.com/login".to_string()));
        assert!(links.contains(&"/static/main.js".to_string()));
        assert!(links.contains(&"https://forms.example.com/post".to_string()));
        assert!(!links.iter().any(|l| l.starts_with("mailto:")));
    }

    #[test]
    fn body_names_are_collected_and_dewildcarded() {
        let mut names = BTreeSet::new();
        collect_names(
            "certificate covers *.internal.example.com and api.example.com",
            &mut names,
        );
        assert!(names.contains("internal.example.com"));
        assert!(names.contains("api.example.com"));
    }

    #[test]
    fn csp_directives_yield_hostnames() {
        let mut names = BTreeSet::new();
        collect_names(
            "default-src 'self'; img-src cdn.example.com data:; connect-src wss://live.example.com",
            &mut names,
        );
        assert!(names.contains("cdn.example.com"));
        assert!(names.contains("live.example.com"));
    }
}
