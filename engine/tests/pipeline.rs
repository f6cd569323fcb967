//! Scenario tests driving the full pipeline against a scripted resolver
//! pool and the in-memory graph backend.

use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::RecordType;
use tokio_util::sync::CancellationToken;

use sprawl_engine::config::Config;
use sprawl_engine::enumeration::Enumeration;
use sprawl_engine::graph::memory::MemoryGraph;
use sprawl_engine::graph::{EdgeKind, Graph, Node, NodeKind};
use sprawl_engine::requests::{AddrRequest, DnsRequest, Request, Tag};
use sprawl_engine::resolve::ResolverPool;
use sprawl_engine::service::Service;
use sprawl_engine::testing::{ReplaySource, StubPool};

fn small_config(domains: &[&str]) -> Arc<Config> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Config::new(domains);
    config.max_dns_queries = 4;
    config.trusted_qps = 8;
    Arc::new(config)
}

fn enumeration_over(
    config: &Arc<Config>,
    graph: &Arc<MemoryGraph>,
    pool: &Arc<StubPool>,
    seeds: Vec<Request>,
) -> Enumeration {
    let source = Arc::new(ReplaySource::new("stub-source", seeds));
    Enumeration::new(
        Arc::clone(config),
        Arc::clone(graph) as Arc<dyn Graph>,
        Arc::clone(pool) as Arc<dyn ResolverPool>,
        Arc::clone(pool) as Arc<dyn ResolverPool>,
        vec![source as Arc<dyn Service>],
    )
}

#[tokio::test(start_paused = true)]
async fn cname_chain_resolves_into_the_graph() {
    let config = small_config(&["example.com"]);
    let graph = Arc::new(MemoryGraph::new());
    let pool = Arc::new(StubPool::new());
    pool.answer("www.example.com", RecordType::CNAME, &["app.example.com"]);
    pool.answer("app.example.com", RecordType::A, &["192.0.2.1"]);

    let seeds = vec![Request::Dns(DnsRequest::new(
        "www.example.com",
        "example.com",
        Tag::Api,
        "stub-source",
    ))];
    let enumeration = enumeration_over(&config, &graph, &pool, seeds);

    let ctx = CancellationToken::new();
    enumeration.start(&ctx).await.unwrap();

    let app = Node::fqdn("app.example.com");
    assert_eq!(
        graph
            .count_in_edges(&ctx, &app, &[EdgeKind::Cname])
            .await
            .unwrap(),
        1,
        "www should alias to app"
    );

    let addr = Node::address("192.0.2.1");
    assert_eq!(
        graph
            .count_in_edges(&ctx, &addr, &[EdgeKind::A])
            .await
            .unwrap(),
        1,
        "app should own the A record"
    );

    // 192.0.2.1 sits in reserved space: the infrastructure chain is the
    // synthetic AS0 entry over the documentation netblock.
    let netblock = Node {
        kind: NodeKind::Netblock,
        label: "192.0.2.0/24".to_string(),
    };
    assert!(graph.read_node(&ctx, &netblock).await.unwrap().is_some());
    assert_eq!(
        graph
            .count_in_edges(&ctx, &addr, &[EdgeKind::Contains])
            .await
            .unwrap(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn wildcard_answers_never_reach_the_graph() {
    let config = small_config(&["w.example"]);
    let graph = Arc::new(MemoryGraph::new());
    let pool = Arc::new(StubPool::new());
    pool.wildcard("w.example", RecordType::A, &["203.0.113.7"]);

    let seeds = vec![Request::Dns(DnsRequest::new(
        "brute1.w.example",
        "w.example",
        Tag::Brute,
        "stub-source",
    ))];
    let enumeration = enumeration_over(&config, &graph, &pool, seeds);

    let ctx = CancellationToken::new();
    enumeration.start(&ctx).await.unwrap();

    let addr = Node::address("203.0.113.7");
    assert_eq!(
        graph.count_in_edges(&ctx, &addr, &[]).await.unwrap(),
        0,
        "wildcard answer must be suppressed"
    );
    assert!(graph
        .read_node(&ctx, &Node::fqdn("brute1.w.example"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn in_scope_addresses_reverse_resolve() {
    let config = small_config(&["example.com"]);
    let graph = Arc::new(MemoryGraph::new());
    let pool = Arc::new(StubPool::new());
    pool.answer(
        "113.4.237.72.in-addr.arpa",
        RecordType::PTR,
        &["host.example.com"],
    );
    pool.answer("host.example.com", RecordType::A, &["72.237.4.113"]);

    let seeds = vec![Request::Addr(AddrRequest {
        address: "72.237.4.113".parse().unwrap(),
        domain: "example.com".to_string(),
        in_scope: true,
        tag: Tag::Api,
        source: "stub-source".to_string(),
    })];
    let enumeration = enumeration_over(&config, &graph, &pool, seeds);

    let ctx = CancellationToken::new();
    enumeration.start(&ctx).await.unwrap();

    let addr = Node::address("72.237.4.113");
    assert_eq!(
        graph
            .count_in_edges(&ctx, &addr, &[EdgeKind::Ptr])
            .await
            .unwrap(),
        1,
        "the PTR-derived name should be recorded"
    );
    assert_eq!(
        graph
            .count_in_edges(&ctx, &addr, &[EdgeKind::A])
            .await
            .unwrap(),
        1,
        "the derived name should forward-resolve"
    );

    // No authoritative ASN data exists, so the fallback /24 is recorded.
    let netblock = Node {
        kind: NodeKind::Netblock,
        label: "72.237.4.0/24".to_string(),
    };
    assert!(graph.read_node(&ctx, &netblock).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_run_quickly() {
    let config = small_config(&["example.com"]);
    let graph = Arc::new(MemoryGraph::new());
    let pool = Arc::new(StubPool::new());
    pool.answer("www.example.com", RecordType::A, &["198.51.100.3"]);

    let seeds = vec![Request::Dns(DnsRequest::new(
        "www.example.com",
        "example.com",
        Tag::Api,
        "stub-source",
    ))];
    let enumeration = enumeration_over(&config, &graph, &pool, seeds);

    let ctx = CancellationToken::new();
    let cancel = ctx.clone();
    let run = tokio::spawn(async move { enumeration.start(&ctx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let finished = tokio::time::timeout(Duration::from_secs(10), run).await;
    assert!(finished.is_ok(), "start must return soon after cancellation");
}
