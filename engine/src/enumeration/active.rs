//! Active stage: operations that touch the targets directly. Runs only
//! when active mode is enabled, with the worker pool bounding concurrency.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::rr::RecordType;
use tokio_util::sync::CancellationToken;

use crate::enumeration::{ActiveWork, Shared};
use crate::net::{http, tls, xfer};
use crate::requests::{AddrRequest, DnsRequest, Request, Tag, ZoneXfrRequest};
use crate::resolve::answers;

pub(crate) async fn run_worker(
    shared: Arc<Shared>,
    ctx: CancellationToken,
    rx: flume::Receiver<ActiveWork>,
) {
    let client = match http::client() {
        Ok(client) => client,
        Err(err) => {
            log::error!("active stage disabled, no HTTP client: {}", err);
            return;
        }
    };

    loop {
        let work = tokio::select! {
            _ = ctx.cancelled() => break,
            received = rx.recv_async() => match received {
                Ok(work) => work,
                Err(_) => break,
            },
        };
        shared.activity.bump();

        match work {
            ActiveWork::Crawl { name, domain } => {
                crawl_name(&shared, &ctx, &client, &name, &domain).await;
            }
            ActiveWork::Cert(req) => {
                pull_certificates(&shared, &ctx, &req).await;
            }
            ActiveWork::Transfer(req) => {
                transfer_zone(&shared, &ctx, req).await;
            }
            ActiveWork::Walk { name, domain } => {
                walk_zone(&shared, &ctx, &name, &domain).await;
            }
        }
        shared.activity.bump();
    }
}

/// Crawl the web ports of a discovered name. Ports ending in 443 speak
/// TLS; everything else is tried as plain HTTP.
async fn crawl_name(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    client: &reqwest::Client,
    name: &str,
    _domain: &str,
) {
    for port in shared.config.ports.clone() {
        if ctx.is_cancelled() {
            return;
        }
        let scheme = if port.to_string().ends_with("443") {
            "https"
        } else {
            "http"
        };
        let seed = format!("{}://{}:{}/", scheme, name, port);
        let config = Arc::clone(&shared.config);
        let findings = http::crawl(client, &seed, move |host| config.is_domain_in_scope(host)).await;

        for found in findings.names {
            if let Some(apex) = shared.config.which_domain(&found) {
                shared
                    .feedback(Request::Dns(DnsRequest::new(
                        &found,
                        &apex,
                        Tag::Crawl,
                        "Crawl",
                    )))
                    .await;
            }
        }
    }
}

/// Pull TLS certificates from an in-scope address on the configured ports
/// and surface their DNS names.
async fn pull_certificates(shared: &Arc<Shared>, ctx: &CancellationToken, req: &AddrRequest) {
    for port in shared.config.ports.clone() {
        if ctx.is_cancelled() {
            return;
        }
        if !port.to_string().ends_with("443") {
            continue;
        }
        let names = match tls::cert_names(req.address, port).await {
            Ok(names) => names,
            Err(err) => {
                log::debug!("cert pull from {}:{} failed: {}", req.address, port, err);
                continue;
            }
        };
        for name in names {
            if let Some(apex) = shared.config.which_domain(&name) {
                shared
                    .feedback(Request::Dns(DnsRequest::new(
                        &name,
                        &apex,
                        Tag::Cert,
                        "Active Cert",
                    )))
                    .await;
            }
        }
    }
}

/// Attempt AXFR against one authoritative server and replay every record
/// through the pipeline.
async fn transfer_zone(shared: &Arc<Shared>, ctx: &CancellationToken, req: ZoneXfrRequest) {
    let Some(server_ip) = resolve_server(shared, ctx, &req.server).await else {
        return;
    };
    let records = match xfer::zone_transfer(&req.domain, server_ip).await {
        Ok(records) => records,
        Err(err) => {
            log::debug!("AXFR of {} from {} failed: {}", req.domain, req.server, err);
            return;
        }
    };
    log::info!(
        "zone transfer of {} from {} returned {} records",
        req.domain,
        req.server,
        records.len()
    );

    // Group records by owner so each name re-enters as one resolved set.
    let mut by_owner: std::collections::BTreeMap<String, Vec<crate::requests::DnsAnswer>> =
        std::collections::BTreeMap::new();
    for record in records {
        by_owner.entry(record.name.clone()).or_default().push(record);
    }
    for (owner, group) in by_owner {
        let Some(apex) = shared.config.which_domain(&owner) else {
            continue;
        };
        let mut resolved = DnsRequest::new(&owner, &apex, Tag::Axfr, &req.source);
        resolved.records = group;
        shared.feedback(Request::Resolved(resolved)).await;
    }
}

/// NSEC walk of a zone via the trusted pool.
async fn walk_zone(shared: &Arc<Shared>, ctx: &CancellationToken, name: &str, domain: &str) {
    match shared.trusted.nsec_traversal(ctx, name).await {
        Ok(found) => {
            for discovered in found {
                if shared.config.is_domain_in_scope(&discovered) {
                    shared
                        .feedback(Request::Dns(DnsRequest::new(
                            &discovered,
                            domain,
                            Tag::Axfr,
                            "NSEC Walk",
                        )))
                        .await;
                }
            }
        }
        Err(err) => log::debug!("NSEC walk of {} failed: {}", name, err),
    }
}

/// Resolve an authoritative server hostname to an address through the
/// trusted pool.
async fn resolve_server(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    server: &str,
) -> Option<IpAddr> {
    if let Ok(addr) = server.parse::<IpAddr>() {
        return Some(addr);
    }
    let query = answers::build_query(server, RecordType::A)?;
    let response = shared.trusted.query_blocking(ctx, query).await.ok()?;
    answers::extract_answers(&response)
        .iter()
        .find(|answer| answer.rr_type == u16::from(RecordType::A))
        .and_then(|answer| answer.data.parse::<IpAddr>().ok())
}
