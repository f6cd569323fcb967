//! In-memory reference backend: adjacency sets under one lock, with the
//! idempotent-upsert contract enforced by set semantics.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::graph::{Edge, EdgeKind, Graph, Node, NodeKind};
use crate::requests::{canonical, has_suffix};

type NodeKey = (NodeKind, String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoredEdge {
    kind: EdgeKind,
    from: NodeKey,
    to: NodeKey,
    service: Option<String>,
}

#[derive(Default)]
struct Inner {
    /// node → event → contributing sources.
    nodes: HashMap<NodeKey, HashMap<Uuid, BTreeSet<String>>>,
    edges: HashSet<StoredEdge>,
}

/// The reference graph backend.
#[derive(Default)]
pub struct MemoryGraph {
    inner: RwLock<Inner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(inner: &mut Inner, key: NodeKey, source: &str, event: Uuid) {
        inner
            .nodes
            .entry(key)
            .or_default()
            .entry(event)
            .or_default()
            .insert(source.to_string());
    }

    fn key(node: &Node) -> NodeKey {
        (node.kind, node.label.clone())
    }
}

#[async_trait]
impl Graph for MemoryGraph {
    async fn upsert_fqdn(
        &self,
        _ctx: &CancellationToken,
        name: &str,
        source: &str,
        event: Uuid,
    ) -> Result<Node> {
        let node = Node::fqdn(name);
        let mut inner = self.inner.write().unwrap();
        Self::touch(&mut inner, Self::key(&node), source, event);
        Ok(node)
    }

    async fn upsert_edge(
        &self,
        _ctx: &CancellationToken,
        kind: EdgeKind,
        origin: &str,
        target: &str,
        service: Option<&str>,
        source: &str,
        event: Uuid,
    ) -> Result<()> {
        let from = (NodeKind::Fqdn, canonical(origin));
        let target_is_addr = matches!(kind, EdgeKind::A | EdgeKind::Aaaa)
            || target.parse::<std::net::IpAddr>().is_ok();
        let to = if target_is_addr {
            (NodeKind::Address, target.to_string())
        } else {
            (NodeKind::Fqdn, canonical(target))
        };

        let mut inner = self.inner.write().unwrap();
        Self::touch(&mut inner, from.clone(), source, event);
        Self::touch(&mut inner, to.clone(), source, event);
        inner.edges.insert(StoredEdge {
            kind,
            from,
            to,
            service: service.map(|s| s.to_string()),
        });
        Ok(())
    }

    async fn upsert_infrastructure(
        &self,
        _ctx: &CancellationToken,
        asn: u32,
        description: &str,
        address: &str,
        prefix: &str,
        source: &str,
        event: Uuid,
    ) -> Result<()> {
        let asn_key = (NodeKind::Asn, format!("AS{} {}", asn, description));
        let block_key = (NodeKind::Netblock, prefix.to_string());
        let addr_key = (NodeKind::Address, address.to_string());

        let mut inner = self.inner.write().unwrap();
        Self::touch(&mut inner, asn_key.clone(), source, event);
        Self::touch(&mut inner, block_key.clone(), source, event);
        Self::touch(&mut inner, addr_key.clone(), source, event);
        inner.edges.insert(StoredEdge {
            kind: EdgeKind::Contains,
            from: asn_key,
            to: block_key.clone(),
            service: None,
        });
        inner.edges.insert(StoredEdge {
            kind: EdgeKind::Contains,
            from: block_key,
            to: addr_key,
            service: None,
        });
        Ok(())
    }

    async fn read_node(&self, _ctx: &CancellationToken, node: &Node) -> Result<Option<Node>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.nodes.contains_key(&Self::key(node)).then(|| node.clone()))
    }

    async fn count_in_edges(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        kinds: &[EdgeKind],
    ) -> Result<usize> {
        Ok(self.read_in_edges(ctx, node, kinds).await?.len())
    }

    async fn read_in_edges(
        &self,
        _ctx: &CancellationToken,
        node: &Node,
        kinds: &[EdgeKind],
    ) -> Result<Vec<Edge>> {
        let key = Self::key(node);
        let inner = self.inner.read().unwrap();
        Ok(inner
            .edges
            .iter()
            .filter(|edge| edge.to == key && (kinds.is_empty() || kinds.contains(&edge.kind)))
            .map(|edge| Edge {
                kind: edge.kind,
                from: Node {
                    kind: edge.from.0,
                    label: edge.from.1.clone(),
                },
                to: node.clone(),
                service: edge.service.clone(),
            })
            .collect())
    }

    async fn delete_node(&self, _ctx: &CancellationToken, node: &Node) -> Result<()> {
        let key = Self::key(node);
        let mut inner = self.inner.write().unwrap();
        inner.nodes.remove(&key);
        inner.edges.retain(|edge| edge.from != key && edge.to != key);
        Ok(())
    }

    fn node_to_id(&self, node: &Node) -> String {
        format!("{:?}:{}", node.kind, node.label)
    }

    async fn node_sources(
        &self,
        _ctx: &CancellationToken,
        node: &Node,
        event: Uuid,
    ) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .nodes
            .get(&Self::key(node))
            .and_then(|events| events.get(&event))
            .map(|sources| sources.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn events_in_scope(
        &self,
        _ctx: &CancellationToken,
        domains: &[String],
    ) -> Result<Vec<Uuid>> {
        let inner = self.inner.read().unwrap();
        let mut events: BTreeSet<Uuid> = BTreeSet::new();
        for ((kind, label), node_events) in &inner.nodes {
            if *kind == NodeKind::Fqdn && domains.iter().any(|d| has_suffix(label, d)) {
                events.extend(node_events.keys().copied());
            }
        }
        Ok(events.into_iter().collect())
    }

    async fn event_fqdns(&self, _ctx: &CancellationToken, event: Uuid) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();
        let mut names: Vec<String> = inner
            .nodes
            .iter()
            .filter(|((kind, _), events)| *kind == NodeKind::Fqdn && events.contains_key(&event))
            .map(|((_, label), _)| label.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let graph = MemoryGraph::new();
        let event = Uuid::new_v4();

        for _ in 0..3 {
            graph
                .upsert_a(&ctx(), "app.example.com", "192.0.2.1", "DNS", event)
                .await
                .unwrap();
        }

        let addr = Node::address("192.0.2.1");
        assert_eq!(
            graph
                .count_in_edges(&ctx(), &addr, &[EdgeKind::A])
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            graph.node_sources(&ctx(), &addr, event).await.unwrap(),
            vec!["DNS".to_string()]
        );
    }

    #[tokio::test]
    async fn repeated_upserts_only_append_sources() {
        let graph = MemoryGraph::new();
        let event = Uuid::new_v4();

        graph
            .upsert_fqdn(&ctx(), "www.example.com", "DNS", event)
            .await
            .unwrap();
        graph
            .upsert_fqdn(&ctx(), "www.example.com", "cert", event)
            .await
            .unwrap();

        let sources = graph
            .node_sources(&ctx(), &Node::fqdn("www.example.com"), event)
            .await
            .unwrap();
        assert_eq!(sources, vec!["DNS".to_string(), "cert".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_incident_edges() {
        let graph = MemoryGraph::new();
        let event = Uuid::new_v4();

        graph
            .upsert_a(&ctx(), "gone.example.com", "10.0.0.1", "brute", event)
            .await
            .unwrap();
        graph
            .delete_node(&ctx(), &Node::fqdn("gone.example.com"))
            .await
            .unwrap();

        let addr = Node::address("10.0.0.1");
        assert_eq!(
            graph.count_in_edges(&ctx(), &addr, &[]).await.unwrap(),
            0
        );
        assert!(graph
            .read_node(&ctx(), &Node::fqdn("gone.example.com"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn events_are_scoped_by_domain_suffix() {
        let graph = MemoryGraph::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        graph
            .upsert_fqdn(&ctx(), "a.example.com", "DNS", first)
            .await
            .unwrap();
        graph
            .upsert_fqdn(&ctx(), "b.example.org", "DNS", second)
            .await
            .unwrap();

        let events = graph
            .events_in_scope(&ctx(), &["example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(events, vec![first]);

        assert_eq!(
            graph.event_fqdns(&ctx(), first).await.unwrap(),
            vec!["a.example.com".to_string()]
        );
    }
}
