//! Data manager: canonicalised records become graph edges, and every
//! stored record is mined for follow-up work, which loops back into the
//! pipeline source.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::RecordType;
use ip_network::IpNetwork;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::enumeration::{alts, markov, subs, ActiveWork, Paced, Shared, StoreWork};
use crate::graph::{EdgeKind, Node};
use crate::requests::{
    AddrRequest, AsnRequest, DnsRequest, Request, SubdomainRequest, Tag, ZoneXfrRequest,
};
use crate::resolve::wildcards::FALSE_POSITIVE_THRESHOLD;

/// SPF carried its own record type before it was folded back into TXT.
const SPF_RR_TYPE: u16 = 99;

/// How long an address waits for a data source to answer an ASN lookup
/// before the fallback prefix is synthesised.
const ASN_WAIT: Duration = Duration::from_secs(120);
const ASN_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) async fn run_worker(
    shared: Arc<Shared>,
    ctx: CancellationToken,
    rx: flume::Receiver<Paced<StoreWork>>,
    active_tx: flume::Sender<ActiveWork>,
) {
    loop {
        let paced = tokio::select! {
            _ = ctx.cancelled() => break,
            received = rx.recv_async() => match received {
                Ok(paced) => paced,
                Err(_) => break,
            },
        };
        shared.activity.bump();

        match paced.work {
            StoreWork::Resolved(req) => {
                process_resolved(&shared, &ctx, req, &active_tx).await;
            }
            StoreWork::Addr(req) => {
                process_addr(&shared, &ctx, req, &active_tx).await;
            }
        }
        shared.activity.bump();
        // Dropping the paced permit here returns the release token.
    }
}

/// Store one resolved record set and derive its expansion items.
async fn process_resolved(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: DnsRequest,
    active_tx: &flume::Sender<ActiveWork>,
) {
    let event = shared.config.uuid;
    if let Err(err) = shared
        .graph
        .upsert_fqdn(ctx, &req.name, &req.source, event)
        .await
    {
        log::error!("graph write for {} failed: {}", req.name, err);
    }

    // A CNAME dominates the record set: store only the alias edge and
    // re-inject the target so chains resolve link by link.
    if let Some(cname) = req
        .records
        .iter()
        .find(|r| r.rr_type == u16::from(RecordType::CNAME))
    {
        if let Err(err) = shared
            .graph
            .upsert_cname(ctx, &req.name, &cname.data, &req.source, event)
            .await
        {
            log::error!("CNAME write for {} failed: {}", req.name, err);
        }
        if let Some(apex) = shared.config.which_domain(&cname.data) {
            shared
                .feedback(Request::Dns(DnsRequest::new(
                    &cname.data,
                    &apex,
                    Tag::Dns,
                    &req.source,
                )))
                .await;
        }
        expansion_hooks(shared, ctx, &req, active_tx).await;
        return;
    }

    for record in &req.records {
        if ctx.is_cancelled() {
            return;
        }
        match RecordType::from(record.rr_type) {
            RecordType::A => {
                store_address_record(shared, ctx, &req, &record.name, &record.data, EdgeKind::A)
                    .await;
            }
            RecordType::AAAA => {
                store_address_record(shared, ctx, &req, &record.name, &record.data, EdgeKind::Aaaa)
                    .await;
            }
            RecordType::PTR => {
                store_ptr_record(shared, ctx, &req, &record.name, &record.data).await;
            }
            RecordType::SRV => {
                let target = last_token(&record.data);
                write_edge(shared, ctx, EdgeKind::Srv, &record.name, &target, &req).await;
                emit_target(shared, &req, &target).await;
            }
            RecordType::NS => {
                write_edge(shared, ctx, EdgeKind::Ns, &record.name, &record.data, &req).await;
                emit_target(shared, &req, &record.data).await;
                if shared.config.active {
                    let _ = active_tx
                        .send_async(ActiveWork::Transfer(ZoneXfrRequest {
                            name: req.name.clone(),
                            domain: req.domain.clone(),
                            server: record.data.clone(),
                            tag: Tag::Axfr,
                            source: req.source.clone(),
                        }))
                        .await;
                }
            }
            RecordType::MX => {
                let target = last_token(&record.data);
                write_edge(shared, ctx, EdgeKind::Mx, &record.name, &target, &req).await;
                emit_target(shared, &req, &target).await;
            }
            RecordType::TXT | RecordType::SOA => {
                mine_text(shared, &req, &record.data).await;
            }
            other if u16::from(other) == SPF_RR_TYPE => {
                mine_text(shared, &req, &record.data).await;
            }
            _ => {}
        }
    }

    expansion_hooks(shared, ctx, &req, active_tx).await;
}

async fn store_address_record(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: &DnsRequest,
    owner: &str,
    addr_text: &str,
    kind: EdgeKind,
) {
    let Ok(addr) = addr_text.parse::<IpAddr>() else {
        return;
    };
    write_edge(shared, ctx, kind, owner, addr_text, req).await;
    check_for_missed_wildcards(shared, ctx, addr).await;

    shared
        .feedback(Request::Addr(AddrRequest {
            address: addr,
            domain: req.domain.clone(),
            in_scope: shared.config.is_domain_in_scope(&req.name),
            tag: req.tag,
            source: req.source.clone(),
        }))
        .await;
}

async fn store_ptr_record(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: &DnsRequest,
    owner: &str,
    target: &str,
) {
    write_edge(shared, ctx, EdgeKind::Ptr, owner, target, req).await;
    // A PTR target that is an in-scope name earns forward resolution; the
    // synthetic reverse-path records point at addresses instead and end
    // here.
    if target.parse::<IpAddr>().is_ok() {
        return;
    }
    if let Some(apex) = shared.config.which_domain(target) {
        shared
            .feedback(Request::Dns(DnsRequest::new(
                target,
                &apex,
                Tag::Dns,
                &req.source,
            )))
            .await;
    }
}

async fn write_edge(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    kind: EdgeKind,
    origin: &str,
    target: &str,
    req: &DnsRequest,
) {
    let service = match kind {
        EdgeKind::Srv => Some(origin),
        _ => None,
    };
    if let Err(err) = shared
        .graph
        .upsert_edge(
            ctx,
            kind,
            origin,
            target,
            service,
            &req.source,
            shared.config.uuid,
        )
        .await
    {
        log::error!("graph write for {} failed: {}", origin, err);
    }
}

/// Queue the target of an SRV/NS/MX record for resolution, keyed to its
/// own apex, unless the target is that apex itself.
async fn emit_target(shared: &Arc<Shared>, req: &DnsRequest, target: &str) {
    let Some(apex) = shared.config.which_domain(target) else {
        return;
    };
    if target == apex {
        return;
    }
    shared
        .feedback(Request::Dns(DnsRequest::new(
            target,
            &apex,
            Tag::Dns,
            &req.source,
        )))
        .await;
}

/// Scan free-text rdata (TXT, SPF, rendered SOA) for embedded IPv4
/// literals and in-scope FQDNs.
async fn mine_text(shared: &Arc<Shared>, req: &DnsRequest, data: &str) {
    for found in config::ipv4_literal_regex().find_iter(data) {
        if let Ok(addr) = found.as_str().parse::<IpAddr>() {
            shared
                .feedback(Request::Addr(AddrRequest {
                    address: addr,
                    domain: req.domain.clone(),
                    in_scope: true,
                    tag: req.tag,
                    source: req.source.clone(),
                }))
                .await;
        }
    }
    for found in config::any_subdomain_regex().find_iter(data) {
        let name = crate::requests::canonical(found.as_str());
        if let Some(apex) = shared.config.which_domain(&name) {
            shared
                .feedback(Request::Dns(DnsRequest::new(
                    &name,
                    &apex,
                    Tag::Dns,
                    &req.source,
                )))
                .await;
        }
    }
}

/// Expansion run after each stored name: subdomain accounting, the zone
/// sweep trigger, brute-force and alteration seeding, Markov training.
async fn expansion_hooks(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: &DnsRequest,
    active_tx: &flume::Sender<ActiveWork>,
) {
    let config = &shared.config;
    let apex = &req.domain;

    // Sources with a resolved callback hear about every stored name.
    shared
        .send_to_sources(ctx, Request::Resolved(req.clone()))
        .await;

    if let Some(observation) = shared.subs.observe(&req.name, apex) {
        if observation.times == 1 && observation.name != *apex {
            let subdomain = SubdomainRequest {
                name: observation.name.clone(),
                domain: apex.clone(),
                times: observation.times,
                tag: req.tag,
                source: req.source.clone(),
            };
            shared
                .send_to_sources(ctx, Request::Subdomain(subdomain.clone()))
                .await;
            shared
                .feedback(Request::Subdomain(subdomain))
                .await;
            if config.active {
                let _ = active_tx
                    .send_async(ActiveWork::Crawl {
                        name: observation.name.clone(),
                        domain: apex.clone(),
                    })
                    .await;
                let _ = active_tx
                    .send_async(ActiveWork::Walk {
                        name: observation.name.clone(),
                        domain: apex.clone(),
                    })
                    .await;
            }
        }

        let threshold = config.min_for_recursive.max(1);
        if observation.times == threshold
            && subs::recursive_eligible(config, &observation.name, apex, observation.times)
            && observation.name != *apex
        {
            for candidate in subs::brute_candidates(config, &observation.name) {
                shared
                    .feedback(Request::Dns(DnsRequest::new(
                        &candidate,
                        apex,
                        Tag::Brute,
                        "Brute Forcing",
                    )))
                    .await;
            }
        }
    }

    if config.alterations {
        for variant in alts::alterations(config, &req.name) {
            shared
                .feedback(Request::Dns(DnsRequest::new(
                    &variant,
                    apex,
                    Tag::Alt,
                    "Alterations",
                )))
                .await;
        }
    }

    if let Some(prefix) = req.name.strip_suffix(&format!(".{}", apex)) {
        shared.markov.train(prefix, apex);
        if shared.markov.generation_due() {
            for candidate in shared.markov.generate(markov::CANDIDATES_PER_PASS) {
                if shared.config.is_domain_in_scope(&candidate) {
                    shared
                        .feedback(Request::Dns(DnsRequest::new(
                            &candidate,
                            apex,
                            Tag::Guess,
                            "Markov Model",
                        )))
                        .await;
                }
            }
        }
    }
}

/// Reverse a missed wildcard: when enough FQDNs collapse onto a single
/// address, their shared parent is blacklisted and the names are removed
/// from the graph.
pub(crate) async fn check_for_missed_wildcards(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    addr: IpAddr,
) {
    let node = Node::address(&addr.to_string());
    let kinds = [EdgeKind::A, EdgeKind::Aaaa];
    let count = match shared.graph.count_in_edges(ctx, &node, &kinds).await {
        Ok(count) => count,
        Err(_) => return,
    };
    if count < FALSE_POSITIVE_THRESHOLD {
        return;
    }
    let edges = match shared.graph.read_in_edges(ctx, &node, &kinds).await {
        Ok(edges) => edges,
        Err(_) => return,
    };

    let mut groups: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    for edge in edges {
        let name = edge.from.label;
        let Some(apex) = shared.config.which_domain(&name) else {
            continue;
        };
        if let Some(parent) = subs::immediate_parent(&name, &apex) {
            groups.entry(parent).or_default().push(name);
        }
    }

    for (parent, names) in groups {
        if names.len() < FALSE_POSITIVE_THRESHOLD {
            continue;
        }
        log::warn!(
            "{} names collapsed onto {}; blacklisting {}",
            names.len(),
            addr,
            parent
        );
        shared.config.blacklist_subdomain(&parent);
        for name in names {
            let _ = shared.graph.delete_node(ctx, &Node::fqdn(&name)).await;
        }
        let _ = shared.graph.delete_node(ctx, &Node::fqdn(&parent)).await;
    }
}

/// ASN resolution for one in-scope address: cache first, then the data
/// sources, then the synthesised fallback prefix.
async fn process_addr(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: AddrRequest,
    active_tx: &flume::Sender<ActiveWork>,
) {
    if !req.in_scope {
        return;
    }

    if shared.config.active {
        let _ = active_tx.send_async(ActiveWork::Cert(req.clone())).await;
    }

    if let Some(entry) = shared.cache.ip_search(req.address) {
        write_infrastructure(shared, ctx, &req, &entry).await;
        return;
    }

    // One outstanding source lookup per address neighbourhood; everyone
    // else just polls the cache.
    let key = neighbourhood_key(req.address);
    let owner = shared.asn_pending.lock().unwrap().insert(key.clone());
    if owner {
        shared
            .send_to_sources(
                ctx,
                Request::Asn(AsnRequest {
                    address: Some(req.address),
                    tag: Tag::Rir,
                    source: req.source.clone(),
                    ..Default::default()
                }),
            )
            .await;
    }

    let mut waited = Duration::ZERO;
    let entry = loop {
        if waited >= ASN_WAIT || ctx.is_cancelled() {
            break None;
        }
        tokio::select! {
            _ = ctx.cancelled() => break None,
            _ = tokio::time::sleep(ASN_POLL_INTERVAL) => {}
        }
        waited += ASN_POLL_INTERVAL;
        if let Some(entry) = shared.cache.ip_search(req.address) {
            break Some(entry);
        }
    };
    if owner {
        shared.asn_pending.lock().unwrap().remove(&key);
    }

    let entry = match entry {
        Some(entry) => entry,
        None => {
            if ctx.is_cancelled() {
                return;
            }
            let Some(fake) = fake_prefix(req.address) else {
                return;
            };
            log::debug!("no ASN discovered for {}; using {}", req.address, fake);
            let fallback = AsnRequest {
                address: Some(req.address),
                asn: 0,
                prefix: Some(fake),
                description: "Unknown".to_string(),
                netblocks: vec![fake],
                tag: Tag::Rir,
                source: "RIR".to_string(),
                ..Default::default()
            };
            shared.cache.update(&fallback);
            fallback
        }
    };
    write_infrastructure(shared, ctx, &req, &entry).await;
}

async fn write_infrastructure(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: &AddrRequest,
    entry: &AsnRequest,
) {
    let Some(prefix) = entry.prefix else {
        return;
    };
    let description = if entry.description.is_empty() {
        "Unknown"
    } else {
        &entry.description
    };
    if let Err(err) = shared
        .graph
        .upsert_infrastructure(
            ctx,
            entry.asn,
            description,
            &req.address.to_string(),
            &prefix.to_string(),
            &entry.source,
            shared.config.uuid,
        )
        .await
    {
        log::error!("infrastructure write for {} failed: {}", req.address, err);
    }
}

/// Addresses sharing their first two octets (or v6 groups) share one
/// outstanding source lookup.
fn neighbourhood_key(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("{}.{}", octets[0], octets[1])
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!("{:x}:{:x}", segments[0], segments[1])
        }
    }
}

fn fake_prefix(addr: IpAddr) -> Option<IpNetwork> {
    match addr {
        IpAddr::V4(_) => IpNetwork::new_truncate(addr, 24).ok(),
        IpAddr::V6(_) => IpNetwork::new_truncate(addr, 48).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[tokio::test]
    async fn collapsed_names_blacklist_their_parent() {
        let shared = crate::enumeration::test_shared(crate::config::Config::new(&["example.com"]));
        let ctx = CancellationToken::new();
        let event = shared.config.uuid;

        for i in 0..105 {
            shared
                .graph
                .upsert_a(
                    &ctx,
                    &format!("h{}.bad.example.com", i),
                    "10.0.0.1",
                    "brute",
                    event,
                )
                .await
                .unwrap();
        }

        check_for_missed_wildcards(&shared, &ctx, "10.0.0.1".parse().unwrap()).await;

        assert!(shared.config.blacklisted("bad.example.com"));
        assert!(!shared.config.is_domain_in_scope("h1.bad.example.com"));
        assert!(shared
            .graph
            .read_node(&ctx, &Node::fqdn("h1.bad.example.com"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            shared
                .graph
                .count_in_edges(&ctx, &Node::address("10.0.0.1"), &[EdgeKind::A])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn sparse_addresses_are_left_alone() {
        let shared = crate::enumeration::test_shared(crate::config::Config::new(&["example.com"]));
        let ctx = CancellationToken::new();
        let event = shared.config.uuid;

        for i in 0..5 {
            shared
                .graph
                .upsert_a(&ctx, &format!("h{}.ok.example.com", i), "10.0.0.2", "dns", event)
                .await
                .unwrap();
        }

        check_for_missed_wildcards(&shared, &ctx, "10.0.0.2".parse().unwrap()).await;
        assert!(!shared.config.blacklisted("ok.example.com"));
        assert_eq!(
            shared
                .graph
                .count_in_edges(&ctx, &Node::address("10.0.0.2"), &[EdgeKind::A])
                .await
                .unwrap(),
            5
        );
    }

    #[test]
    fn neighbourhoods_group_by_leading_octets() {
        assert_eq!(neighbourhood_key("72.237.4.113".parse().unwrap()), "72.237");
        assert_eq!(neighbourhood_key("72.237.9.1".parse().unwrap()), "72.237");
        assert_ne!(
            neighbourhood_key("72.238.4.113".parse().unwrap()),
            neighbourhood_key("72.237.4.113".parse().unwrap())
        );
        assert_eq!(
            neighbourhood_key("2001:db8::1".parse().unwrap()),
            "2001:db8"
        );
    }

    #[test]
    fn fake_prefixes_cover_their_address() {
        let v4 = fake_prefix("203.0.113.77".parse().unwrap()).unwrap();
        assert_eq!(v4.to_string(), "203.0.113.0/24");
        let v6 = fake_prefix("2001:db8:1:2::3".parse().unwrap()).unwrap();
        assert_eq!(v6.netmask(), 48);
        assert!(v6.contains("2001:db8:1:2::3".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn token_extraction_takes_the_final_field() {
        assert_eq!(last_token("10 mail.example.com"), "mail.example.com");
        assert_eq!(last_token("0 5 5060 sip.example.com"), "sip.example.com");
        assert_eq!(last_token("plain"), "plain");
    }
}

fn last_token(data: &str) -> String {
    data.rsplit(' ').next().unwrap_or(data).to_string()
}
