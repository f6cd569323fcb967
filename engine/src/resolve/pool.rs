//! Concrete resolver pool over hickory, with the retry policy the
//! pipeline depends on: truncated exponential backoff for transient
//! failures, a short fuse for persistent server-side rcodes, and no
//! retry at all once a name is settled.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RecordType;
use hickory_proto::xfer::Protocol;
use hickory_proto::ProtoErrorKind;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveErrorKind, Resolver, TokioResolver};
use tokio_util::sync::CancellationToken;

use crate::limits::RateLimiter;
use crate::resolve::wildcards::{self, WildcardStore, PROBE_COUNT};
use crate::resolve::{answers, ResolveError, ResolverPool};

/// Retry ceiling for one query.
const MAX_ATTEMPTS: usize = 50;

/// Server-side failure rcodes abort the retry loop after this many hits.
const MAX_RCODE_SERVER_FAILS: usize = 3;

const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(4);

/// Per-attempt transport timeout handed to hickory.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// A pool of recursive resolvers queried round-robin by hickory, fronted
/// by a QPS limiter sized to the pool.
pub struct NameserverPool {
    label: String,
    resolver: TokioResolver,
    size: usize,
    limiter: RateLimiter,
    wildcards: WildcardStore,
    probing: tokio::sync::Mutex<()>,
}

impl NameserverPool {
    /// Build a pool from `host` or `host:port` resolver specifications.
    /// Unparseable entries are skipped; an empty specification list
    /// produces an empty pool the orchestrator refuses to assemble with.
    pub fn new(label: &str, specs: &[String], qps_per_resolver: usize) -> Self {
        let addrs: Vec<SocketAddr> = specs.iter().filter_map(|spec| parse_spec(spec)).collect();

        let mut config = ResolverConfig::new();
        for addr in &addrs {
            config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
        }

        let mut opts = ResolverOpts::default();
        // The pipeline owns retries and caching; hickory performs exactly
        // one attempt per call.
        opts.attempts = 1;
        opts.cache_size = 0;
        opts.timeout = ATTEMPT_TIMEOUT;

        let mut builder =
            Resolver::builder_with_config(config, TokioConnectionProvider::default());
        *builder.options_mut() = opts;

        Self {
            label: label.to_string(),
            resolver: builder.build(),
            size: addrs.len(),
            limiter: RateLimiter::per_second(qps_per_resolver * addrs.len().max(1)),
            wildcards: WildcardStore::new(),
            probing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    async fn lookup_with_retries(
        &self,
        ctx: &CancellationToken,
        name: &str,
        rr_type: RecordType,
    ) -> std::result::Result<Vec<hickory_proto::rr::Record>, ResolveError> {
        let mut backoff = BACKOFF_INITIAL;
        let mut rcode_fails = 0usize;
        let mut last_failure = String::new();

        for _ in 0..MAX_ATTEMPTS {
            if ctx.is_cancelled() {
                return Err(ResolveError::ContextExpired);
            }

            let lookup = tokio::select! {
                _ = ctx.cancelled() => return Err(ResolveError::ContextExpired),
                lookup = self.resolver.lookup(name, rr_type) => lookup,
            };

            match lookup {
                Ok(found) => return Ok(found.records().to_vec()),
                Err(err) => match classify(name, rr_type, &err) {
                    Failure::Settled(settled) => return Err(settled),
                    Failure::ServerRcode(msg) => {
                        rcode_fails += 1;
                        last_failure = msg;
                        if rcode_fails >= MAX_RCODE_SERVER_FAILS {
                            return Err(ResolveError::ServerFailure {
                                name: name.to_string(),
                                msg: last_failure,
                            });
                        }
                    }
                    Failure::Transient(msg) => last_failure = msg,
                },
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(ResolveError::ContextExpired),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }

        Err(ResolveError::ServerFailure {
            name: name.to_string(),
            msg: last_failure,
        })
    }

    /// Populate the wildcard profile for `(apex, rr_type)` unless some
    /// earlier probe already settled it.
    async fn ensure_profile(&self, ctx: &CancellationToken, apex: &str, rr_type: u16) {
        if self.wildcards.has_profile(apex, rr_type).await {
            return;
        }
        let _serial = self.probing.lock().await;
        if self.wildcards.has_profile(apex, rr_type).await {
            return;
        }

        let mut union: BTreeSet<String> = BTreeSet::new();
        for _ in 0..PROBE_COUNT {
            let probe_name = format!("{}.{}", wildcards::unlikely_label(), apex);
            let Some(query) = answers::build_query(&probe_name, RecordType::from(rr_type)) else {
                continue;
            };
            match self.query_blocking(ctx, query).await {
                Ok(response) => {
                    if let Some(set) = wildcards::answer_sets(&response).remove(&rr_type) {
                        union.extend(set);
                    }
                }
                Err(err) if err == ResolveError::ContextExpired => return,
                Err(_) => {}
            }
        }
        // An empty union is recorded too: the apex does not wildcard this
        // type, and the probe is not repeated.
        self.wildcards.record(apex, rr_type, union).await;
    }
}

#[async_trait]
impl ResolverPool for NameserverPool {
    fn len(&self) -> usize {
        self.size
    }

    async fn query(
        &self,
        ctx: &CancellationToken,
        msg: Message,
    ) -> std::result::Result<Message, ResolveError> {
        let Some(question) = msg.queries().first().cloned() else {
            return Err(ResolveError::Malformed {
                msg: "query message carries no question".to_string(),
            });
        };
        let name = crate::requests::canonical(&question.name().to_string());
        let records = self
            .lookup_with_retries(ctx, &name, question.query_type())
            .await?;

        let mut response = msg.clone();
        response.set_message_type(MessageType::Response);
        response.set_response_code(ResponseCode::NoError);
        response.insert_answers(records);

        if response.answers().is_empty() {
            return Err(ResolveError::NoRecordOfThisType {
                name,
                rr_type: u16::from(question.query_type()),
            });
        }
        Ok(response)
    }

    async fn query_blocking(
        &self,
        ctx: &CancellationToken,
        msg: Message,
    ) -> std::result::Result<Message, ResolveError> {
        tokio::select! {
            _ = ctx.cancelled() => return Err(ResolveError::ContextExpired),
            _ = self.limiter.wait() => {}
        }
        self.query(ctx, msg).await
    }

    async fn wildcard_detected(&self, ctx: &CancellationToken, msg: &Message, apex: &str) -> bool {
        let candidate = wildcards::answer_sets(msg);
        if candidate.is_empty() {
            return false;
        }
        for (rr_type, set) in candidate {
            self.ensure_profile(ctx, apex, rr_type).await;
            if self.wildcards.matches(apex, rr_type, &set).await {
                log::debug!(
                    "{}: wildcard match under {} for record type {}",
                    self.label,
                    apex,
                    rr_type
                );
                return true;
            }
        }
        false
    }

    async fn nsec_traversal(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> std::result::Result<Vec<String>, ResolveError> {
        const MAX_WALK: usize = 1024;

        let apex = crate::requests::canonical(name);
        let mut discovered = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut current = apex.clone();

        for _ in 0..MAX_WALK {
            let Some(query) = answers::build_query(&current, RecordType::NSEC) else {
                break;
            };
            let response = match self.query_blocking(ctx, query).await {
                Ok(response) => response,
                Err(ResolveError::ContextExpired) => return Err(ResolveError::ContextExpired),
                Err(_) => break,
            };

            let Some(next) = next_nsec_name(&response) else {
                break;
            };
            if next == apex || !seen.insert(next.clone()) {
                break;
            }
            discovered.push(next.clone());
            current = next;
        }

        Ok(discovered)
    }
}

fn next_nsec_name(msg: &Message) -> Option<String> {
    use hickory_proto::dnssec::rdata::DNSSECRData;
    use hickory_proto::rr::RData;

    msg.answers().iter().find_map(|record| match record.data() {
        RData::DNSSEC(DNSSECRData::NSEC(nsec)) => Some(crate::requests::canonical(
            &nsec.next_domain_name().to_string(),
        )),
        _ => None,
    })
}

fn parse_spec(spec: &str) -> Option<SocketAddr> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Some(addr);
    }
    spec.parse::<std::net::IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, 53))
}

enum Failure {
    /// The name is settled; retrying cannot change the outcome.
    Settled(ResolveError),
    /// One of FormErr, ServFail, NotImp, Refused.
    ServerRcode(String),
    Transient(String),
}

fn classify(name: &str, rr_type: RecordType, err: &hickory_resolver::ResolveError) -> Failure {
    if let ResolveErrorKind::Proto(proto) = err.kind() {
        if let ProtoErrorKind::NoRecordsFound { response_code, .. } = proto.kind() {
            return classify_rcode(name, rr_type, *response_code);
        }
    }
    Failure::Transient(err.to_string())
}

fn classify_rcode(name: &str, rr_type: RecordType, code: ResponseCode) -> Failure {
    match code {
        ResponseCode::NXDomain => Failure::Settled(ResolveError::NameDoesNotExist {
            name: name.to_string(),
        }),
        ResponseCode::NoError => Failure::Settled(ResolveError::NoRecordOfThisType {
            name: name.to_string(),
            rr_type: u16::from(rr_type),
        }),
        ResponseCode::FormErr
        | ResponseCode::ServFail
        | ResponseCode::NotImp
        | ResponseCode::Refused => Failure::ServerRcode(format!("{} answered {}", name, code)),
        other => Failure::Transient(format!("{} answered {}", name, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rcode_classification_matches_the_retry_policy() {
        let settled = classify_rcode("x.example.com", RecordType::A, ResponseCode::NXDomain);
        assert!(matches!(
            settled,
            Failure::Settled(ResolveError::NameDoesNotExist { .. })
        ));

        let empty = classify_rcode("x.example.com", RecordType::A, ResponseCode::NoError);
        assert!(matches!(
            empty,
            Failure::Settled(ResolveError::NoRecordOfThisType { .. })
        ));

        for code in [
            ResponseCode::FormErr,
            ResponseCode::ServFail,
            ResponseCode::NotImp,
            ResponseCode::Refused,
        ] {
            assert!(matches!(
                classify_rcode("x.example.com", RecordType::A, code),
                Failure::ServerRcode(_)
            ));
        }

        assert!(matches!(
            classify_rcode("x.example.com", RecordType::A, ResponseCode::BADMODE),
            Failure::Transient(_)
        ));
    }

    #[test]
    fn resolver_specs_accept_bare_hosts_and_ports() {
        assert_eq!(
            parse_spec("8.8.8.8").unwrap(),
            "8.8.8.8:53".parse().unwrap()
        );
        assert_eq!(
            parse_spec("1.1.1.1:5353").unwrap(),
            "1.1.1.1:5353".parse().unwrap()
        );
        assert!(parse_spec("not an address").is_none());
    }

    #[tokio::test]
    async fn pool_size_counts_parsed_resolvers() {
        let pool = NameserverPool::new(
            "untrusted",
            &["8.8.8.8".to_string(), "bogus".to_string(), "9.9.9.9".to_string()],
            10,
        );
        assert_eq!(pool.len(), 2);
    }
}
