//! DNS stage: forward chains, reverse lookups, and the per-subdomain
//! zone sweep. Untrusted discoveries are re-verified on the trusted pool
//! and checked against the wildcard profiles before they may proceed.

use std::sync::Arc;

use hickory_proto::rr::RecordType;
use tokio_util::sync::CancellationToken;

use crate::config::POPULAR_SRV_LABELS;
use crate::enumeration::{DnsWork, Paced, Shared, StoreWork};
use crate::requests::{AddrRequest, DnsAnswer, DnsRequest, Request, SubdomainRequest, Tag};
use crate::resolve::{answers, ResolveError};

/// Terminal classification of one outstanding query, bounding what may
/// flow downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    New,
    InFlight,
    NameError,
    TypeExhausted,
    Resolved,
    HasRecords,
    Dropped,
}

pub(crate) async fn run_worker(
    shared: Arc<Shared>,
    ctx: CancellationToken,
    rx: flume::Receiver<Paced<DnsWork>>,
    store_tx: flume::Sender<Paced<StoreWork>>,
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

        let permit = paced.permit;
        match paced.work {
            DnsWork::Forward(req) => {
                forward(&shared, &ctx, req, permit, &store_tx).await;
            }
            DnsWork::Reverse(req) => {
                reverse(&shared, &ctx, req).await;
            }
            DnsWork::Zone(req) => {
                zone_sweep(&shared, &ctx, req, &store_tx).await;
            }
        }
        shared.activity.bump();
    }
}

/// The forward path: CNAME, then A, then AAAA on the untrusted pool, with
/// trusted-pool confirmation for untrusted tags. A successful CNAME ends
/// the chain; the target re-enters the pipeline via the data manager.
async fn forward(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    mut req: DnsRequest,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
    store_tx: &flume::Sender<Paced<StoreWork>>,
) {
    let mut state = QueryState::New;

    for rr_type in shared.config.record_types.clone() {
        state = QueryState::InFlight;

        let Some(query) = answers::build_query(&req.name, rr_type) else {
            state = QueryState::Dropped;
            break;
        };
        let response = shared.untrusted.query_blocking(ctx, query).await;

        match response {
            Ok(resp) => {
                let confirmed = if req.tag.trusted() {
                    Some(answers::extract_answers(&resp))
                } else {
                    confirm_untrusted(shared, ctx, &req, rr_type).await
                };
                match confirmed {
                    Some(records) if !records.is_empty() => {
                        let chained = records
                            .iter()
                            .any(|r| r.rr_type == u16::from(RecordType::CNAME));
                        req.records.extend(records);
                        if chained {
                            state = QueryState::Resolved;
                            break;
                        }
                        state = QueryState::HasRecords;
                    }
                    Some(_) => {
                        if !req.records.is_empty() {
                            state = QueryState::HasRecords;
                        } else {
                            state = QueryState::TypeExhausted;
                        }
                    }
                    None => {
                        state = QueryState::Dropped;
                        break;
                    }
                }
            }
            Err(ResolveError::NameDoesNotExist { .. }) => {
                state = QueryState::NameError;
                break;
            }
            Err(ResolveError::ContextExpired) => {
                state = QueryState::Dropped;
                break;
            }
            Err(_) => {
                if !req.records.is_empty() {
                    state = QueryState::HasRecords;
                } else {
                    state = QueryState::TypeExhausted;
                }
            }
        }
    }

    match state {
        QueryState::Resolved | QueryState::HasRecords if !req.records.is_empty() => {
            let _ = store_tx
                .send_async(Paced::new(StoreWork::Resolved(req), permit))
                .await;
        }
        // NameError, TypeExhausted and Dropped all release the token with
        // no downstream work.
        _ => {}
    }
}

/// Re-ask the trusted pool and consult the wildcard detector. `None`
/// drops the whole request; an empty vector skips just this record type.
async fn confirm_untrusted(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: &DnsRequest,
    rr_type: RecordType,
) -> Option<Vec<DnsAnswer>> {
    let query = answers::build_query(&req.name, rr_type)?;
    match shared.trusted.query_blocking(ctx, query).await {
        Ok(resp) => {
            if shared
                .trusted
                .wildcard_detected(ctx, &resp, &req.domain)
                .await
            {
                log::debug!("{} suppressed as wildcard under {}", req.name, req.domain);
                return None;
            }
            Some(answers::extract_answers(&resp))
        }
        Err(ResolveError::ContextExpired) => None,
        Err(err) if err.permanent() => Some(Vec::new()),
        Err(_) => Some(Vec::new()),
    }
}

/// The reverse path: PTR lookup for an in-scope address, accepted only
/// when the pointed-to name is in scope and matches its apex matcher.
async fn reverse(shared: &Arc<Shared>, ctx: &CancellationToken, req: AddrRequest) {
    let ptr_name = answers::reverse_name(req.address);
    let Some(query) = answers::build_query(&ptr_name, RecordType::PTR) else {
        return;
    };

    let response = match shared.untrusted.query_blocking(ctx, query.clone()).await {
        Ok(resp) => resp,
        Err(ResolveError::ContextExpired) => return,
        Err(_) => match shared.trusted.query_blocking(ctx, query).await {
            Ok(resp) => resp,
            Err(_) => return,
        },
    };

    for answer in answers::extract_answers(&response) {
        if answer.rr_type != u16::from(RecordType::PTR) {
            continue;
        }
        let target = &answer.data;
        let Some(apex) = shared.config.which_domain(target) else {
            continue;
        };
        let matches_apex = shared
            .config
            .domain_regex(&apex)
            .map(|re| re.is_match(target))
            .unwrap_or(false);
        if !matches_apex || shared.config.blacklisted(target) {
            continue;
        }

        let mut derived = DnsRequest::new(target, &apex, Tag::Dns, "Reverse DNS");
        derived.records.push(DnsAnswer::new(
            target,
            u16::from(RecordType::PTR),
            answer.ttl,
            &req.address.to_string(),
        ));
        shared.feedback(Request::Dns(derived)).await;
    }
}

/// Zone sweep for a newly observed subdomain: NS, MX, SOA and TXT, plus
/// an SRV probe per popular service label. Every query goes to the
/// trusted pool, and all of them are in flight at once.
async fn zone_sweep(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: SubdomainRequest,
    store_tx: &flume::Sender<Paced<StoreWork>>,
) {
    if ctx.is_cancelled() {
        return;
    }

    let mut probes: Vec<(String, RecordType)> = vec![
        (req.name.clone(), RecordType::NS),
        (req.name.clone(), RecordType::MX),
        (req.name.clone(), RecordType::SOA),
        (req.name.clone(), RecordType::TXT),
    ];
    for label in POPULAR_SRV_LABELS {
        probes.push((format!("{}.{}", label, req.name), RecordType::SRV));
    }

    futures::future::join_all(probes.iter().map(|(name, rr_type)| {
        emit_sweep_answers(shared, ctx, &req, name, *rr_type, store_tx)
    }))
    .await;
}

async fn emit_sweep_answers(
    shared: &Arc<Shared>,
    ctx: &CancellationToken,
    req: &SubdomainRequest,
    name: &str,
    rr_type: RecordType,
    store_tx: &flume::Sender<Paced<StoreWork>>,
) {
    let Some(query) = answers::build_query(name, rr_type) else {
        return;
    };
    let resp = match shared.trusted.query_blocking(ctx, query).await {
        Ok(resp) => resp,
        Err(_) => return,
    };
    if !req.tag.trusted()
        && shared
            .trusted
            .wildcard_detected(ctx, &resp, &req.domain)
            .await
    {
        return;
    }

    let records = answers::extract_answers(&resp);
    if records.is_empty() {
        return;
    }
    let mut resolved = DnsRequest::new(name, &req.domain, req.tag, &req.source);
    resolved.records = records;
    let _ = store_tx
        .send_async(Paced::new(StoreWork::Resolved(resolved), None))
        .await;
}
