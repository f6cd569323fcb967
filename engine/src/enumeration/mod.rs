//! The enumeration pipeline: a fixpoint expansion over names and
//! addresses. Stages consume from bounded queues and feed discoveries
//! back into the source until the whole system goes quiet.

pub mod active;
pub mod alts;
pub mod dns_task;
pub mod filter;
pub mod markov;
pub mod source;
pub mod store;
pub mod subs;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::asn::AsnCache;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::graph::Graph;
use crate::requests::{AddrRequest, DnsRequest, Request, SubdomainRequest, Tag, ZoneXfrRequest};
use crate::resolve::ResolverPool;
use crate::service::Service;

use self::filter::AdmissionFilter;
use self::markov::MarkovModel;
use self::subs::SubdomainTracker;

/// Stage worker-pool ceilings.
pub(crate) const MAX_DNS_PIPELINE_TASKS: usize = 7500;
pub(crate) const MAX_STORE_PIPELINE_TASKS: usize = 25;
pub(crate) const MAX_ACTIVE_PIPELINE_TASKS: usize = 25;

/// Depth of the inter-stage work queues.
const STAGE_QUEUE_DEPTH: usize = 10_000;

/// Idle time after which a drained pipeline declares completion.
const WAIT_FOR_DURATION: Duration = Duration::from_secs(10);

/// In-flight fraction of the release budget below which the source asks
/// the data sources for more input.
const REFILL_WATERMARK: f64 = 0.75;

/// How often a paused source drain re-checks the watermark.
const REFILL_POLL: Duration = Duration::from_millis(100);

/// Low-watermark check: true while the in-flight queue depth sits below
/// 75% of the release budget, i.e. the pipeline has room and upstream
/// sources should be drained for more work.
pub(crate) fn refill_needed(pacing: &Semaphore, budget: usize) -> bool {
    let in_flight = budget.saturating_sub(pacing.available_permits());
    (in_flight as f64) < REFILL_WATERMARK * budget as f64
}

/// Work items handed to the DNS stage.
pub(crate) enum DnsWork {
    /// Forward-resolve a name through the CNAME → A → AAAA chain.
    Forward(DnsRequest),
    /// Reverse-resolve an in-scope address.
    Reverse(AddrRequest),
    /// Zone sweep: NS/MX/SOA/TXT plus the popular SRV labels.
    Zone(SubdomainRequest),
}

/// Work items handed to the data manager.
pub(crate) enum StoreWork {
    Resolved(DnsRequest),
    Addr(AddrRequest),
}

/// Work items handed to the active stage.
pub(crate) enum ActiveWork {
    Crawl { name: String, domain: String },
    Cert(AddrRequest),
    Transfer(ZoneXfrRequest),
    Walk { name: String, domain: String },
}

/// A work item carrying its release token. Dropping the permit returns the
/// pacing budget to the source.
pub(crate) struct Paced<T> {
    pub work: T,
    pub permit: Option<OwnedSemaphorePermit>,
}

impl<T> Paced<T> {
    pub fn new(work: T, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self { work, permit }
    }
}

/// Last-activity clock driving quiescence detection.
pub(crate) struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn bump(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().unwrap().elapsed()
    }
}

/// State shared by every stage of one enumeration run.
pub(crate) struct Shared {
    pub config: Arc<Config>,
    pub graph: Arc<dyn Graph>,
    pub untrusted: Arc<dyn ResolverPool>,
    pub trusted: Arc<dyn ResolverPool>,
    pub cache: Arc<AsnCache>,
    pub sources: Vec<Arc<dyn Service>>,
    pub filter: AdmissionFilter,
    pub markov: MarkovModel,
    pub subs: SubdomainTracker,
    pub activity: Activity,
    /// Feedback sink into the source stage.
    input_tx: flume::Sender<Request>,
    /// ASN lookups in flight, keyed by address neighbourhood.
    pub asn_pending: Mutex<HashSet<String>>,
}

impl Shared {
    /// Feed a derived request back into the pipeline source.
    pub async fn feedback(&self, req: Request) {
        self.activity.bump();
        if self.input_tx.send_async(req).await.is_err() {
            log::debug!("feedback after source shutdown dropped");
        }
    }

    /// Dispatch a request to every data source that handles its variant.
    pub async fn send_to_sources(&self, ctx: &CancellationToken, req: Request) {
        for service in &self.sources {
            if service.handles_request(&req) {
                if let Err(err) = service.submit(ctx, req.clone()).await {
                    if err.is_context_expired() {
                        return;
                    }
                    log::debug!("{}: submission failed: {}", service.description(), err);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_shared(config: Config) -> Arc<Shared> {
    let (input_tx, _input_rx) = flume::unbounded();
    Arc::new(Shared {
        config: Arc::new(config),
        graph: Arc::new(crate::graph::memory::MemoryGraph::new()),
        untrusted: Arc::new(crate::testing::StubPool::empty()),
        trusted: Arc::new(crate::testing::StubPool::empty()),
        cache: Arc::new(AsnCache::new()),
        sources: Vec::new(),
        filter: AdmissionFilter::new(),
        markov: MarkovModel::new(),
        subs: SubdomainTracker::new(),
        activity: Activity::new(),
        input_tx,
        asn_pending: Mutex::new(HashSet::new()),
    })
}

/// One full enumeration over the configured scope.
///
/// Assembles the stages of the data-flow graph, runs them to quiescence or
/// cancellation, then drains in reverse order.
pub struct Enumeration {
    config: Arc<Config>,
    graph: Arc<dyn Graph>,
    untrusted: Arc<dyn ResolverPool>,
    trusted: Arc<dyn ResolverPool>,
    sources: Vec<Arc<dyn Service>>,
}

impl Enumeration {
    pub fn new(
        config: Arc<Config>,
        graph: Arc<dyn Graph>,
        untrusted: Arc<dyn ResolverPool>,
        trusted: Arc<dyn ResolverPool>,
        sources: Vec<Arc<dyn Service>>,
    ) -> Self {
        Self {
            config,
            graph,
            untrusted,
            trusted,
            sources,
        }
    }

    /// Run the enumeration until quiescence or cancellation of `ctx`.
    ///
    /// Only pipeline-assembly failures surface as errors; per-item
    /// failures are logged and absorbed by the stages.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        if self.config.domains().is_empty() {
            return Err(EngineError::pipeline_error(
                "source",
                "no apex domains configured".to_string(),
            ));
        }
        if self.untrusted.is_empty() || self.trusted.is_empty() {
            return Err(EngineError::pipeline_error(
                "dns",
                "both resolver pools must hold at least one resolver".to_string(),
            ));
        }

        let (input_tx, input_rx) = flume::unbounded::<Request>();
        let (dns_tx, dns_rx) = flume::bounded::<Paced<DnsWork>>(STAGE_QUEUE_DEPTH);
        let (store_tx, store_rx) = flume::bounded::<Paced<StoreWork>>(STAGE_QUEUE_DEPTH);
        let (active_tx, active_rx) = flume::bounded::<ActiveWork>(STAGE_QUEUE_DEPTH);
        let (dup_tx, dup_rx) = flume::bounded::<DnsRequest>(STAGE_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            config: Arc::clone(&self.config),
            graph: Arc::clone(&self.graph),
            untrusted: Arc::clone(&self.untrusted),
            trusted: Arc::clone(&self.trusted),
            cache: Arc::new(AsnCache::new()),
            sources: self.sources.clone(),
            filter: AdmissionFilter::new(),
            markov: MarkovModel::new(),
            subs: SubdomainTracker::new(),
            activity: Activity::new(),
            input_tx: input_tx.clone(),
            asn_pending: Mutex::new(HashSet::new()),
        });

        let budget = self.config.trusted_budget();
        let pacing = Arc::new(Semaphore::new(budget));
        let stages = ctx.child_token();
        let mut workers = JoinSet::new();

        // Source stage: admission, routing, pacing.
        workers.spawn(source::run(
            Arc::clone(&shared),
            stages.clone(),
            input_rx.clone(),
            dns_tx.clone(),
            store_tx.clone(),
            active_tx.clone(),
            dup_tx.clone(),
            Arc::clone(&pacing),
        ));

        // Duplicate attribution: names rejected by the dedup filter still
        // credit their source on the existing graph node.
        workers.spawn(source::run_dup_queue(
            Arc::clone(&shared),
            stages.clone(),
            dup_rx.clone(),
        ));

        let dns_workers = self
            .config
            .max_dns_queries
            .clamp(1, MAX_DNS_PIPELINE_TASKS);
        for _ in 0..dns_workers {
            workers.spawn(dns_task::run_worker(
                Arc::clone(&shared),
                stages.clone(),
                dns_rx.clone(),
                store_tx.clone(),
            ));
        }

        for _ in 0..MAX_STORE_PIPELINE_TASKS {
            workers.spawn(store::run_worker(
                Arc::clone(&shared),
                stages.clone(),
                store_rx.clone(),
                active_tx.clone(),
            ));
        }

        if self.config.active {
            for _ in 0..MAX_ACTIVE_PIPELINE_TASKS {
                workers.spawn(active::run_worker(
                    Arc::clone(&shared),
                    stages.clone(),
                    active_rx.clone(),
                ));
            }
        }

        // Data sources: start them, then fan their outputs into the
        // source. The drain is demand-gated: a source is only pulled from
        // while the in-flight depth sits below the refill watermark, so
        // the bounded output queues hold sources back until the pipeline
        // asks for more.
        for service in &self.sources {
            if let Err(err) = service.start().await {
                log::warn!("{}: failed to start: {}", service.description(), err);
                continue;
            }
            let output = service.output();
            let fan_shared = Arc::clone(&shared);
            let fan_ctx = stages.clone();
            let fan_pacing = Arc::clone(&pacing);
            let label = service.description();
            workers.spawn(async move {
                let mut paused = false;
                loop {
                    while !refill_needed(&fan_pacing, budget) {
                        if !paused {
                            log::debug!("{}: pipeline saturated, drain paused", label);
                            paused = true;
                        }
                        tokio::select! {
                            _ = fan_ctx.cancelled() => return,
                            _ = tokio::time::sleep(REFILL_POLL) => {}
                        }
                    }
                    if paused {
                        log::debug!("{}: refill requested", label);
                        paused = false;
                    }
                    tokio::select! {
                        _ = fan_ctx.cancelled() => break,
                        received = output.recv_async() => match received {
                            Ok(req) => fan_shared.feedback(req).await,
                            Err(_) => break,
                        },
                    }
                }
            });
        }

        self.seed(&shared).await;

        // Quiescence watch: all queues empty, full budget back, and a
        // sustained idle period.
        let mut poll = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = poll.tick() => {
                    let quiet = input_rx.is_empty()
                        && dns_rx.is_empty()
                        && store_rx.is_empty()
                        && active_rx.is_empty()
                        && dup_rx.is_empty()
                        && pacing.available_permits() == budget;
                    if quiet && shared.activity.idle_for() >= WAIT_FOR_DURATION {
                        log::info!("enumeration reached quiescence");
                        break;
                    }
                }
            }
        }

        // Reverse-order drain: stop intake first, then the stages.
        stages.cancel();
        for service in &self.sources {
            if let Err(err) = service.stop().await {
                log::debug!("{}: stop failed: {}", service.description(), err);
            }
        }
        let drain_deadline = Instant::now() + Duration::from_secs(5);
        while let Ok(Some(_)) =
            tokio::time::timeout_at(drain_deadline, workers.join_next()).await
        {}
        workers.abort_all();

        Ok(())
    }

    /// Push the initial work: configured apexes, addresses, and names
    /// remembered by the graph from earlier events over the same scope.
    async fn seed(&self, shared: &Arc<Shared>) {
        let ctx = CancellationToken::new();
        for domain in self.config.domains() {
            shared
                .feedback(Request::Dns(DnsRequest::new(
                    &domain,
                    &domain,
                    Tag::Dns,
                    "DNS",
                )))
                .await;
            shared
                .feedback(Request::Subdomain(SubdomainRequest {
                    name: domain.clone(),
                    domain: domain.clone(),
                    times: 1,
                    tag: Tag::Dns,
                    source: "DNS".to_string(),
                }))
                .await;

            if self.config.brute_forcing {
                for candidate in subs::brute_candidates(&self.config, &domain) {
                    shared
                        .feedback(Request::Dns(DnsRequest::new(
                            &candidate,
                            &domain,
                            Tag::Brute,
                            "Brute Forcing",
                        )))
                        .await;
                }
            }
        }

        for addr in &self.config.addresses {
            if let Some(domain) = self.config.domains().first() {
                shared
                    .feedback(Request::Addr(AddrRequest {
                        address: *addr,
                        domain: domain.clone(),
                        in_scope: true,
                        tag: Tag::Dns,
                        source: "DNS".to_string(),
                    }))
                    .await;
            }
        }

        // ASN scope entries go to the data sources, whose answers flow
        // back as netblocks for the cache.
        for asn in &self.config.asns {
            shared
                .send_to_sources(
                    &ctx,
                    Request::Asn(crate::requests::AsnRequest {
                        asn: *asn,
                        tag: Tag::Rir,
                        source: "RIR".to_string(),
                        ..Default::default()
                    }),
                )
                .await;
        }

        let domains = self.config.domains();
        match self.graph.events_in_scope(&ctx, &domains).await {
            Ok(events) => {
                for event in events {
                    if event == self.config.uuid {
                        continue;
                    }
                    if let Ok(names) = self.graph.event_fqdns(&ctx, event).await {
                        for name in names {
                            if let Some(domain) = self.config.which_domain(&name) {
                                shared
                                    .feedback(Request::Dns(DnsRequest::new(
                                        &name,
                                        &domain,
                                        Tag::Dns,
                                        "Previous Enumeration",
                                    )))
                                    .await;
                            }
                        }
                    }
                }
            }
            Err(err) => log::debug!("graph replay skipped: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refill_follows_the_in_flight_watermark() {
        let budget = 8;
        let pacing = Arc::new(Semaphore::new(budget));

        // Nothing in flight: the sources should be drained.
        assert!(refill_needed(&pacing, budget));

        // At 75% of the budget in flight the demand stops.
        let mut held: Vec<_> = (0..6)
            .map(|_| Arc::clone(&pacing).try_acquire_owned().unwrap())
            .collect();
        assert!(!refill_needed(&pacing, budget));

        // One release drops the depth back under the watermark and the
        // refill request resumes.
        held.pop();
        assert!(refill_needed(&pacing, budget));
    }
}
