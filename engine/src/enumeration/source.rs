//! Pipeline input stage: the single admission point for names and
//! addresses, whichever producer they came from.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::enumeration::filter::Admission;
use crate::enumeration::{subs, ActiveWork, DnsWork, Paced, Shared, StoreWork};
use crate::requests::{AddrRequest, DnsRequest, Request, Tag};

/// Number of neighbouring v4 addresses swept around an in-scope address
/// that falls inside configured CIDR scope.
const SWEEP_RADIUS: u8 = 100;

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    shared: Arc<Shared>,
    ctx: CancellationToken,
    input_rx: flume::Receiver<Request>,
    dns_tx: flume::Sender<Paced<DnsWork>>,
    store_tx: flume::Sender<Paced<StoreWork>>,
    active_tx: flume::Sender<ActiveWork>,
    dup_tx: flume::Sender<DnsRequest>,
    pacing: Arc<Semaphore>,
) {
    loop {
        let req = tokio::select! {
            _ = ctx.cancelled() => break,
            received = input_rx.recv_async() => match received {
                Ok(req) => req,
                Err(_) => break,
            },
        };
        shared.activity.bump();

        match req {
            Request::Dns(r) => {
                route_name(&shared, &ctx, r, false, &dns_tx, &store_tx, &dup_tx, &pacing).await;
            }
            Request::Resolved(r) => {
                route_name(&shared, &ctx, r, true, &dns_tx, &store_tx, &dup_tx, &pacing).await;
            }
            Request::Addr(a) => {
                route_addr(&shared, &ctx, a, &dns_tx, &store_tx, &pacing).await;
            }
            Request::Subdomain(s) => {
                if !s.valid() || !shared.config.is_domain_in_scope(&s.name) {
                    continue;
                }
                let Some(permit) = acquire(&ctx, &pacing).await else { break };
                send_paced(&dns_tx, Paced::new(DnsWork::Zone(s), Some(permit))).await;
            }
            Request::Asn(a) => {
                shared.cache.update(&a);
            }
            Request::ZoneXfr(z) => {
                if shared.config.active && z.valid() {
                    let _ = active_tx.send_async(ActiveWork::Transfer(z)).await;
                }
            }
            Request::Whois(w) => {
                // Horizontal expansion stays informational: associations
                // are surfaced, scope is never widened implicitly.
                if !w.new_domains.is_empty() {
                    log::info!(
                        "whois association for {}: {}",
                        w.domain,
                        w.new_domains.join(", ")
                    );
                } else {
                    shared.send_to_sources(&ctx, Request::Whois(w)).await;
                }
            }
        }
    }
}

/// Admission and routing for a name, resolved or not.
#[allow(clippy::too_many_arguments)]
async fn route_name(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: DnsRequest,
    resolved: bool,
    dns_tx: &flume::Sender<Paced<DnsWork>>,
    store_tx: &flume::Sender<Paced<StoreWork>>,
    dup_tx: &flume::Sender<DnsRequest>,
    pacing: &Arc<Semaphore>,
) {
    if !req.valid() || !shared.config.is_domain_in_scope(&req.name) {
        return;
    }
    let Some(re) = shared.config.domain_regex(&req.domain) else {
        return;
    };
    if !re.is_match(&req.name) || !subs::within_depth(&shared.config, &req.name, &req.domain) {
        return;
    }

    match shared.filter.admit(&req.name, req.tag) {
        Admission::Accept => {
            // Apex-level names also go out to the data sources, firing
            // their vertical callbacks.
            if req.name == req.domain {
                shared
                    .send_to_sources(ctx, Request::Dns(req.clone()))
                    .await;
            }
            let Some(permit) = acquire(ctx, pacing).await else {
                return;
            };
            if resolved && req.tag.trusted() {
                // Positively resolved by a first-party mechanism: straight
                // to storage.
                send_paced(store_tx, Paced::new(StoreWork::Resolved(req), Some(permit))).await;
            } else {
                // Unresolved, or resolved claims from an untrusted source:
                // both earn a pass through the resolvers.
                send_paced(dns_tx, Paced::new(DnsWork::Forward(req), Some(permit))).await;
            }
        }
        Admission::Duplicate => {
            // Attribution only; never re-enters the pipeline.
            let _ = dup_tx.try_send(req);
        }
    }
}

async fn route_addr(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: AddrRequest,
    dns_tx: &flume::Sender<Paced<DnsWork>>,
    store_tx: &flume::Sender<Paced<StoreWork>>,
    pacing: &Arc<Semaphore>,
) {
    if !req.valid() || !req.in_scope {
        return;
    }
    if shared.filter.admit(&req.address.to_string(), req.tag) != Admission::Accept {
        return;
    }

    // Sources with an address callback hear about every new address.
    shared
        .send_to_sources(ctx, Request::Addr(req.clone()))
        .await;

    // Reverse-resolution path.
    if let Some(permit) = acquire(ctx, pacing).await {
        send_paced(
            dns_tx,
            Paced::new(DnsWork::Reverse(req.clone()), Some(permit)),
        )
        .await;
    }

    // Infrastructure path.
    if let Some(permit) = acquire(ctx, pacing).await {
        send_paced(
            store_tx,
            Paced::new(StoreWork::Addr(req.clone()), Some(permit)),
        )
        .await;
    }

    // Sweep the neighbourhood when the address sits in CIDR scope.
    for neighbour in sweep_neighbours(shared, req.address) {
        shared
            .feedback(Request::Addr(AddrRequest {
                address: neighbour,
                domain: req.domain.clone(),
                in_scope: true,
                tag: Tag::Dns,
                source: "Reverse DNS".to_string(),
            }))
            .await;
    }
}

/// Neighbouring addresses of `addr` inside the configured CIDR scope.
fn sweep_neighbours(shared: &Arc<Shared>, addr: IpAddr) -> Vec<IpAddr> {
    let IpAddr::V4(v4) = addr else {
        return Vec::new();
    };
    if !shared.config.cidrs.iter().any(|cidr| cidr.contains(addr)) {
        return Vec::new();
    }

    let base = u32::from(v4);
    let low = base.saturating_sub(SWEEP_RADIUS as u32);
    let high = base.saturating_add(SWEEP_RADIUS as u32);
    (low..=high)
        .filter(|candidate| *candidate != base)
        .map(|candidate| IpAddr::V4(candidate.into()))
        .filter(|candidate| shared.config.cidrs.iter().any(|cidr| cidr.contains(*candidate)))
        .collect()
}

async fn acquire(
    ctx: &CancellationToken,
    pacing: &Arc<Semaphore>,
) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        _ = ctx.cancelled() => None,
        permit = Arc::clone(pacing).acquire_owned() => permit.ok(),
    }
}

async fn send_paced<T>(tx: &flume::Sender<Paced<T>>, item: Paced<T>) {
    if tx.send_async(item).await.is_err() {
        log::debug!("stage queue closed during send");
    }
}

/// Consumer of the duplicate queue: credits the additional source on the
/// existing node without re-queueing the name.
pub(crate) async fn run_dup_queue(
    shared: Arc<Shared>,
    ctx: CancellationToken,
    dup_rx: flume::Receiver<DnsRequest>,
) {
    loop {
        let req = tokio::select! {
            _ = ctx.cancelled() => break,
            received = dup_rx.recv_async() => match received {
                Ok(req) => req,
                Err(_) => break,
            },
        };
        if !shared.config.is_domain_in_scope(&req.name) {
            continue;
        }
        if let Err(err) = shared
            .graph
            .upsert_fqdn(&ctx, &req.name, &req.source, shared.config.uuid)
            .await
        {
            log::error!("duplicate attribution for {} failed: {}", req.name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ip_network::IpNetwork;

    #[test]
    fn sweeps_stay_inside_cidr_scope() {
        let mut config = crate::config::Config::new(&["example.com"]);
        config.cidrs = vec!["72.237.4.0/24".parse::<IpNetwork>().unwrap()];

        let shared = test_shared(config);
        let neighbours = sweep_neighbours(&shared, "72.237.4.5".parse().unwrap());
        assert!(!neighbours.is_empty());
        assert!(neighbours
            .iter()
            .all(|n| shared.config.cidrs[0].contains(*n)));
        assert!(!neighbours.contains(&"72.237.4.5".parse().unwrap()));

        // Out-of-scope addresses sweep nothing.
        assert!(sweep_neighbours(&shared, "8.8.8.8".parse().unwrap()).is_empty());
    }

    fn test_shared(config: crate::config::Config) -> Arc<Shared> {
        crate::enumeration::test_shared(config)
    }
}
