//! The persistence port the data manager writes through.
//!
//! Concrete database backends live outside the engine; the port contract
//! is that every upsert is idempotent and commutative, so concurrent
//! writers need no coordination beyond the backend's own locking. The
//! in-memory reference backend in [`memory`] is the one the test-suite
//! and single-run enumerations use.

pub mod memory;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// The kinds of vertices the engine stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Fqdn,
    Address,
    Netblock,
    Asn,
}

/// A vertex reference: kind plus the canonical label (FQDN, address text,
/// CIDR text, or `AS<number>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub kind: NodeKind,
    pub label: String,
}

impl Node {
    pub fn fqdn(name: &str) -> Self {
        Self {
            kind: NodeKind::Fqdn,
            label: crate::requests::canonical(name),
        }
    }

    pub fn address(addr: &str) -> Self {
        Self {
            kind: NodeKind::Address,
            label: addr.to_string(),
        }
    }
}

/// Relationship kinds between vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Cname,
    A,
    Aaaa,
    Ptr,
    Srv,
    Ns,
    Mx,
    /// ASN → netblock and netblock → address containment.
    Contains,
}

/// A stored relationship, as returned by edge reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub kind: EdgeKind,
    pub from: Node,
    pub to: Node,
    /// SRV service label, present on `Srv` edges only.
    pub service: Option<String>,
}

/// The graph port.
///
/// All upserts attribute the write to a `source` (data-source name) and an
/// `event` (enumeration id), so several runs can coexist in one backend.
#[async_trait]
pub trait Graph: Send + Sync {
    /// Insert or refresh an FQDN vertex.
    async fn upsert_fqdn(
        &self,
        ctx: &CancellationToken,
        name: &str,
        source: &str,
        event: Uuid,
    ) -> Result<Node>;

    /// Insert or refresh a typed relationship between two vertices,
    /// creating the endpoints as needed.
    async fn upsert_edge(
        &self,
        ctx: &CancellationToken,
        kind: EdgeKind,
        origin: &str,
        target: &str,
        service: Option<&str>,
        source: &str,
        event: Uuid,
    ) -> Result<()>;

    /// Record the infrastructure chain for an address: ASN vertex, its
    /// netblock, and containment down to the address.
    #[allow(clippy::too_many_arguments)]
    async fn upsert_infrastructure(
        &self,
        ctx: &CancellationToken,
        asn: u32,
        description: &str,
        address: &str,
        prefix: &str,
        source: &str,
        event: Uuid,
    ) -> Result<()>;

    async fn read_node(&self, ctx: &CancellationToken, node: &Node) -> Result<Option<Node>>;

    async fn count_in_edges(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        kinds: &[EdgeKind],
    ) -> Result<usize>;

    async fn read_in_edges(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        kinds: &[EdgeKind],
    ) -> Result<Vec<Edge>>;

    /// Remove a vertex and every edge touching it.
    async fn delete_node(&self, ctx: &CancellationToken, node: &Node) -> Result<()>;

    /// Stable identifier of a vertex within the backend.
    fn node_to_id(&self, node: &Node) -> String;

    /// The data sources that contributed a vertex during one event.
    async fn node_sources(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        event: Uuid,
    ) -> Result<Vec<String>>;

    /// Enumeration events that touched any name under the given domains.
    async fn events_in_scope(
        &self,
        ctx: &CancellationToken,
        domains: &[String],
    ) -> Result<Vec<Uuid>>;

    /// All FQDNs recorded during one event.
    async fn event_fqdns(&self, ctx: &CancellationToken, event: Uuid) -> Result<Vec<String>>;

    // Named upserts kept as thin wrappers so call sites read like the
    // record types they store.

    async fn upsert_cname(
        &self,
        ctx: &CancellationToken,
        origin: &str,
        target: &str,
        source: &str,
        event: Uuid,
    ) -> Result<()> {
        self.upsert_edge(ctx, EdgeKind::Cname, origin, target, None, source, event)
            .await
    }

    async fn upsert_a(
        &self,
        ctx: &CancellationToken,
        origin: &str,
        target: &str,
        source: &str,
        event: Uuid,
    ) -> Result<()> {
        self.upsert_edge(ctx, EdgeKind::A, origin, target, None, source, event)
            .await
    }

    async fn upsert_aaaa(
        &self,
        ctx: &CancellationToken,
        origin: &str,
        target: &str,
        source: &str,
        event: Uuid,
    ) -> Result<()> {
        self.upsert_edge(ctx, EdgeKind::Aaaa, origin, target, None, source, event)
            .await
    }

    async fn upsert_ptr(
        &self,
        ctx: &CancellationToken,
        origin: &str,
        target: &str,
        source: &str,
        event: Uuid,
    ) -> Result<()> {
        self.upsert_edge(ctx, EdgeKind::Ptr, origin, target, None, source, event)
            .await
    }

    async fn upsert_srv(
        &self,
        ctx: &CancellationToken,
        origin: &str,
        target: &str,
        service: &str,
        source: &str,
        event: Uuid,
    ) -> Result<()> {
        self.upsert_edge(
            ctx,
            EdgeKind::Srv,
            origin,
            target,
            Some(service),
            source,
            event,
        )
        .await
    }

    async fn upsert_ns(
        &self,
        ctx: &CancellationToken,
        origin: &str,
        target: &str,
        source: &str,
        event: Uuid,
    ) -> Result<()> {
        self.upsert_edge(ctx, EdgeKind::Ns, origin, target, None, source, event)
            .await
    }

    async fn upsert_mx(
        &self,
        ctx: &CancellationToken,
        origin: &str,
        target: &str,
        source: &str,
        event: Uuid,
    ) -> Result<()> {
        self.upsert_edge(ctx, EdgeKind::Mx, origin, target, None, source, event)
            .await
    }
}
