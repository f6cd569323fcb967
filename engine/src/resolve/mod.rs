//! The resolver abstraction the pipeline queries through.
//!
//! Two pool instances exist per enumeration: an untrusted pool sized to the
//! user's QPS budget across many public resolvers, and a smaller trusted
//! pool of authoritative or vetted recursives. The trusted pool is the only
//! one the wildcard detector probes, so profile answers cannot be spoofed
//! by the fast pool.

pub mod answers;
pub mod pool;
pub mod wildcards;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio_util::sync::CancellationToken;

/// Classification of resolution failures the pipeline reasons about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// `NXDOMAIN`: the definitive non-existence answer. Never retried.
    NameDoesNotExist { name: String },
    /// `NOERROR` with an empty answer section for the queried type.
    NoRecordOfThisType { name: String, rr_type: u16 },
    /// The enumeration context was cancelled mid-query.
    ContextExpired,
    /// The per-query retry budget was exhausted by server failures.
    ServerFailure { name: String, msg: String },
    /// The query message was not something the pool can send.
    Malformed { msg: String },
}

impl ResolveError {
    /// True for outcomes that terminate the request cleanly: the name is
    /// settled and no retry or downstream work should follow.
    pub fn permanent(&self) -> bool {
        matches!(
            self,
            ResolveError::NameDoesNotExist { .. } | ResolveError::NoRecordOfThisType { .. }
        )
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::NameDoesNotExist { name } => {
                write!(f, "name {} does not exist", name)
            }
            ResolveError::NoRecordOfThisType { name, rr_type } => {
                write!(f, "no record of type {} for {}", rr_type, name)
            }
            ResolveError::ContextExpired => write!(f, "context expired"),
            ResolveError::ServerFailure { name, msg } => {
                write!(f, "resolving {} failed: {}", name, msg)
            }
            ResolveError::Malformed { msg } => write!(f, "malformed query: {}", msg),
        }
    }
}

impl std::error::Error for ResolveError {}

/// The port the pipeline depends on for DNS resolution.
///
/// Implementations own retry policy, rate limiting and transport; callers
/// only see settled messages or a classified [`ResolveError`].
#[async_trait]
pub trait ResolverPool: Send + Sync {
    /// Number of resolvers backing the pool.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve one query message without waiting on the pool's QPS
    /// limiter. Retries transient failures internally.
    async fn query(
        &self,
        ctx: &CancellationToken,
        msg: Message,
    ) -> std::result::Result<Message, ResolveError>;

    /// Resolve one query message, first blocking for QPS capacity.
    async fn query_blocking(
        &self,
        ctx: &CancellationToken,
        msg: Message,
    ) -> std::result::Result<Message, ResolveError>;

    /// True when `msg` looks like the product of a DNS wildcard under
    /// `apex`. Probes are issued through this pool; only call this on the
    /// trusted pool.
    async fn wildcard_detected(&self, ctx: &CancellationToken, msg: &Message, apex: &str) -> bool;

    /// Walk the zone through NSEC next-name pointers, returning the names
    /// discovered along the chain.
    async fn nsec_traversal(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> std::result::Result<Vec<String>, ResolveError>;
}
