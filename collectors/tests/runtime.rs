//! End-to-end: a Lua data source feeding the full enumeration pipeline.

use std::sync::Arc;

use hickory_proto::rr::RecordType;
use tokio_util::sync::CancellationToken;

use sprawl_collectors::cache::ResponseCache;
use sprawl_collectors::{ScriptHost, ScriptService};
use sprawl_engine::config::Config;
use sprawl_engine::enumeration::Enumeration;
use sprawl_engine::graph::memory::MemoryGraph;
use sprawl_engine::graph::{EdgeKind, Graph, Node};
use sprawl_engine::resolve::ResolverPool;
use sprawl_engine::service::Service;
use sprawl_engine::testing::StubPool;

const SOURCE_SCRIPT: &str = r#"
    name = "IntegrationSource"
    type = "api"

    function vertical(ctx, domain)
        new_name(ctx, "found." .. domain)
    end
"#;

// Runs in real time: quiescence takes the full idle window on top of the
// actual work.
#[tokio::test(flavor = "multi_thread")]
async fn script_discoveries_flow_into_the_graph() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Config::new(&["example.com"]);
    config.max_dns_queries = 4;
    config.trusted_qps = 8;
    let config = Arc::new(config);

    let pool = Arc::new(StubPool::new());
    pool.answer("found.example.com", RecordType::A, &["198.51.100.9"]);

    let host = ScriptHost {
        config: Arc::clone(&config),
        untrusted: Arc::clone(&pool) as Arc<dyn ResolverPool>,
        trusted: Arc::clone(&pool) as Arc<dyn ResolverPool>,
        cache: Arc::new(ResponseCache::new()),
    };
    let service =
        Arc::new(ScriptService::from_source(SOURCE_SCRIPT, host).unwrap()) as Arc<dyn Service>;

    let graph = Arc::new(MemoryGraph::new());
    let enumeration = Enumeration::new(
        Arc::clone(&config),
        Arc::clone(&graph) as Arc<dyn Graph>,
        Arc::clone(&pool) as Arc<dyn ResolverPool>,
        Arc::clone(&pool) as Arc<dyn ResolverPool>,
        vec![service],
    );

    let ctx = CancellationToken::new();
    enumeration.start(&ctx).await.unwrap();

    let addr = Node::address("198.51.100.9");
    assert_eq!(
        graph
            .count_in_edges(&ctx, &addr, &[EdgeKind::A])
            .await
            .unwrap(),
        1,
        "the script-discovered name should resolve and land in the graph"
    );
    let sources = graph
        .node_sources(&ctx, &Node::fqdn("found.example.com"), config.uuid)
        .await
        .unwrap();
    assert!(
        sources.contains(&"IntegrationSource".to_string()),
        "the discovery should be attributed to the script, got {:?}",
        sources
    );
}
