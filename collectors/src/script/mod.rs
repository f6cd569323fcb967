//! Script services: one Lua interpreter per data source, owned by a
//! dedicated worker thread. Callbacks are invoked strictly one at a time,
//! behind the per-source rate limiter, and everything a script may do to
//! the outside world goes through the capabilities registered here.

pub mod api;
pub mod dnscap;
pub mod http;
pub mod socket;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mlua::{Function, Lua, Table};
use tokio_util::sync::CancellationToken;

use sprawl_engine::config::{Config, DataSourceConfig};
use sprawl_engine::error::Result as EngineResult;
use sprawl_engine::limits::RateLimiter;
use sprawl_engine::requests::{Request, Tag};
use sprawl_engine::resolve::ResolverPool;
use sprawl_engine::service::{Service, ServiceBase};

use crate::cache::ResponseCache;
use crate::error::{CollectorError, Result};

/// Poll interval the worker uses to notice shutdown between inputs.
const INPUT_POLL: Duration = Duration::from_millis(250);

/// The engine-side handles a script runtime needs.
#[derive(Clone)]
pub struct ScriptHost {
    pub config: Arc<Config>,
    pub untrusted: Arc<dyn ResolverPool>,
    pub trusted: Arc<dyn ResolverPool>,
    pub cache: Arc<ResponseCache>,
}

/// Callback names a script may declare.
const CALLBACKS: &[&str] = &[
    "start",
    "stop",
    "check",
    "vertical",
    "horizontal",
    "address",
    "asn",
    "resolved",
    "subdomain",
];

#[derive(Debug, Clone, Default)]
struct DeclaredCallbacks {
    vertical: bool,
    horizontal: bool,
    address: bool,
    asn: bool,
    resolved: bool,
    subdomain: bool,
}

/// Everything the capability closures need, shared by `Arc`.
pub(crate) struct ScriptEnv {
    pub script_name: String,
    pub tag: Tag,
    pub config: Arc<Config>,
    pub untrusted: Arc<dyn ResolverPool>,
    pub trusted: Arc<dyn ResolverPool>,
    pub cache: Arc<ResponseCache>,
    pub output: flume::Sender<Request>,
    pub limiter: Arc<RateLimiter>,
    pub handle: tokio::runtime::Handle,
    pub ctx: CancellationToken,
    pub http: reqwest::Client,
}

impl ScriptEnv {
    /// Run a future to completion from the script thread. The worker is a
    /// plain OS thread, so blocking on the shared runtime handle is safe.
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    /// Push a request toward the engine through the per-source queue.
    pub fn emit(&self, req: Request) {
        if self.output.send(req).is_err() {
            log::debug!("{}: output closed, emission dropped", self.script_name);
        }
    }

    pub fn source_config(&self) -> Option<DataSourceConfig> {
        self.config.data_sources.get(&self.script_name).cloned()
    }

    pub fn cache_ttl_minutes(&self) -> Option<u64> {
        self.source_config().and_then(|entry| entry.ttl_minutes)
    }
}

/// A data source defined by a Lua script.
pub struct ScriptService {
    base: ServiceBase,
    source_text: String,
    source_type: String,
    tag: Tag,
    declared: DeclaredCallbacks,
    host: ScriptHost,
    limiter: Arc<RateLimiter>,
    service_ctx: CancellationToken,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ScriptService {
    /// Load a script from source text. The script is executed once here
    /// to read its `name`/`type` globals and the callbacks it declares.
    pub fn from_source(source_text: &str, host: ScriptHost) -> Result<Self> {
        let probe = Lua::new();
        probe
            .load(source_text)
            .exec()
            .map_err(|err| CollectorError::script_error("<load>", err.to_string()))?;

        let globals = probe.globals();
        let name: String = globals
            .get("name")
            .map_err(|_| CollectorError::script_error("<load>", "missing `name` global".into()))?;
        let source_type: String = globals.get("type").unwrap_or_else(|_| "api".to_string());

        let mut declared = DeclaredCallbacks::default();
        for callback in CALLBACKS {
            let defined = globals.get::<Function>(*callback).is_ok();
            match *callback {
                "vertical" => declared.vertical = defined,
                "horizontal" => declared.horizontal = defined,
                "address" => declared.address = defined,
                "asn" => declared.asn = defined,
                "resolved" => declared.resolved = defined,
                "subdomain" => declared.subdomain = defined,
                _ => {}
            }
        }

        Ok(Self {
            base: ServiceBase::new(&name),
            source_text: source_text.to_string(),
            tag: tag_for(&source_type),
            source_type,
            declared,
            host,
            limiter: Arc::new(RateLimiter::new(Duration::ZERO)),
            service_ctx: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    /// Load a script from a file.
    pub fn from_file(path: &std::path::Path, host: ScriptHost) -> Result<Self> {
        let source_text = std::fs::read_to_string(path)?;
        Self::from_source(&source_text, host)
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }
}

fn tag_for(source_type: &str) -> Tag {
    match source_type {
        "dns" => Tag::Dns,
        "axfr" => Tag::Axfr,
        "cert" => Tag::Cert,
        "crawl" => Tag::Crawl,
        "archive" => Tag::Archive,
        "brute" => Tag::Brute,
        "alt" => Tag::Alt,
        "guess" => Tag::Guess,
        "api" => Tag::Api,
        "scrape" => Tag::Scrape,
        "ext" | "external" => Tag::External,
        "rir" => Tag::Rir,
        _ => Tag::None,
    }
}

#[async_trait]
impl Service for ScriptService {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn description(&self) -> String {
        format!("{} ({})", self.base.name(), self.source_type)
    }

    fn handles_request(&self, req: &Request) -> bool {
        match req {
            Request::Dns(_) => self.declared.vertical,
            Request::Whois(_) => self.declared.horizontal,
            Request::Addr(_) => self.declared.address,
            Request::Asn(_) => self.declared.asn,
            Request::Resolved(_) => self.declared.resolved,
            Request::Subdomain(_) => self.declared.subdomain,
            Request::ZoneXfr(_) => false,
        }
    }

    async fn submit(&self, ctx: &CancellationToken, req: Request) -> EngineResult<()> {
        self.base.submit(ctx, req).await
    }

    fn output(&self) -> flume::Receiver<Request> {
        self.base.output()
    }

    fn done(&self) -> CancellationToken {
        self.base.done()
    }

    async fn start(&self) -> EngineResult<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }

        let env = Arc::new(ScriptEnv {
            script_name: self.base.name().to_string(),
            tag: self.tag,
            config: Arc::clone(&self.host.config),
            untrusted: Arc::clone(&self.host.untrusted),
            trusted: Arc::clone(&self.host.trusted),
            cache: Arc::clone(&self.host.cache),
            output: self.base.output_sender(),
            limiter: Arc::clone(&self.limiter),
            handle: tokio::runtime::Handle::current(),
            ctx: self.service_ctx.clone(),
            http: sprawl_engine::net::http::client()?,
        });

        let source_text = self.source_text.clone();
        let input = self.base.input();
        let done = self.base.done();
        let stop_signal = self.service_ctx.clone();
        let thread_name = format!("datasrc-{}", self.base.name());

        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                worker_loop(&source_text, env, input, stop_signal);
                done.cancel();
            })
            .map_err(|err| {
                sprawl_engine::error::EngineError::validation_error(&err.to_string())
            })?;
        *worker = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.service_ctx.cancel();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            // The worker notices the cancel within one poll interval; the
            // join is moved off the async thread.
            let _ = tokio::task::spawn_blocking(move || handle.join());
        }
        self.base.mark_done();
        Ok(())
    }
}

/// The per-script actor: owns the interpreter, serialises callbacks, and
/// shuts down on cancellation.
fn worker_loop(
    source_text: &str,
    env: Arc<ScriptEnv>,
    input: flume::Receiver<Request>,
    stop_signal: CancellationToken,
) {
    let script = env.script_name.clone();
    let lua = Lua::new();

    if let Err(err) = register_all(&lua, &env) {
        log::error!("{}: capability registration failed: {}", script, err);
        return;
    }
    if let Err(err) = lua.load(source_text).exec() {
        log::error!("{}: script failed to load: {}", script, err);
        return;
    }

    call_lifecycle(&lua, &env, "start");
    if let Some(check) = get_callback(&lua, "check") {
        if let Err(err) = check.call::<()>(new_ctx(&lua)) {
            log::warn!("{}: check callback rejected the configuration: {}", script, err);
            call_lifecycle(&lua, &env, "stop");
            return;
        }
    }

    loop {
        if stop_signal.is_cancelled() {
            break;
        }
        let req = match input.recv_timeout(INPUT_POLL) {
            Ok(req) => req,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };

        // One callback at a time, paced by the source's rate limiter.
        env.block_on(env.limiter.wait());
        if stop_signal.is_cancelled() {
            break;
        }
        dispatch(&lua, &env, req);
    }

    call_lifecycle(&lua, &env, "stop");
    log::debug!("{}: worker stopped", script);
}

fn register_all(lua: &Lua, env: &Arc<ScriptEnv>) -> mlua::Result<()> {
    api::register(lua, env)?;
    http::register(lua, env)?;
    dnscap::register(lua, env)?;
    socket::register(lua, env)?;
    Ok(())
}

fn get_callback(lua: &Lua, name: &str) -> Option<Function> {
    lua.globals().get::<Function>(name).ok()
}

/// Fresh per-invocation context handle handed to the script.
fn new_ctx(lua: &Lua) -> Table {
    lua.create_table().unwrap_or_else(|_| lua.globals())
}

fn call_lifecycle(lua: &Lua, env: &Arc<ScriptEnv>, name: &str) {
    if let Some(callback) = get_callback(lua, name) {
        if let Err(err) = callback.call::<()>(new_ctx(lua)) {
            log::warn!("{}: {} callback failed: {}", env.script_name, name, err);
        }
    }
}

/// Exhaustive dispatch from request variant to declared callback.
fn dispatch(lua: &Lua, env: &Arc<ScriptEnv>, req: Request) {
    let outcome = match &req {
        Request::Dns(r) => call1(lua, "vertical", (new_ctx(lua), r.domain.clone())),
        Request::Whois(r) => call1(lua, "horizontal", (new_ctx(lua), r.domain.clone())),
        Request::Addr(r) => call1(lua, "address", (new_ctx(lua), r.address.to_string())),
        Request::Asn(r) => {
            let addr = r.address.map(|a| a.to_string());
            call1(lua, "asn", (new_ctx(lua), addr, r.asn))
        }
        Request::Resolved(r) => {
            let records = lua.create_table().and_then(|table| {
                for (idx, record) in r.records.iter().enumerate() {
                    let row = lua.create_table()?;
                    row.set("rrname", record.name.clone())?;
                    row.set("rrtype", record.rr_type)?;
                    row.set("rrdata", record.data.clone())?;
                    table.set(idx + 1, row)?;
                }
                Ok(table)
            });
            match records {
                Ok(records) => call1(
                    lua,
                    "resolved",
                    (new_ctx(lua), r.name.clone(), r.domain.clone(), records),
                ),
                Err(err) => Err(err),
            }
        }
        Request::Subdomain(r) => call1(
            lua,
            "subdomain",
            (new_ctx(lua), r.name.clone(), r.domain.clone(), r.times),
        ),
        Request::ZoneXfr(_) => Ok(()),
    };

    if let Err(err) = outcome {
        log::warn!(
            "{}: callback for {} failed: {}",
            env.script_name,
            req.variant(),
            err
        );
    }
}

fn call1<A: mlua::IntoLuaMulti>(lua: &Lua, name: &str, args: A) -> mlua::Result<()> {
    match get_callback(lua, name) {
        Some(callback) => callback.call::<()>(args),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprawl_engine::requests::DnsRequest;
    use sprawl_engine::testing::StubPool;

    fn host_with(config: Config) -> ScriptHost {
        ScriptHost {
            config: Arc::new(config),
            untrusted: Arc::new(StubPool::new()),
            trusted: Arc::new(StubPool::new()),
            cache: Arc::new(ResponseCache::new()),
        }
    }

    const VERTICAL_SCRIPT: &str = r#"
        name = "VerticalSource"
        type = "api"

        function vertical(ctx, domain)
            new_name(ctx, "found." .. domain)
            new_name(ctx, "not a name")
        end
    "#;

    #[tokio::test(flavor = "multi_thread")]
    async fn vertical_callbacks_emit_validated_names() {
        let service =
            ScriptService::from_source(VERTICAL_SCRIPT, host_with(Config::new(&["example.com"])))
                .unwrap();
        assert_eq!(service.name(), "VerticalSource");
        assert!(service.handles_request(&Request::Dns(DnsRequest::new(
            "example.com",
            "example.com",
            Tag::None,
            "t"
        ))));

        service.start().await.unwrap();
        let ctx = CancellationToken::new();
        service
            .submit(
                &ctx,
                Request::Dns(DnsRequest::new("example.com", "example.com", Tag::Dns, "t")),
            )
            .await
            .unwrap();

        let emitted = tokio::time::timeout(Duration::from_secs(5), service.output().recv_async())
            .await
            .expect("script should emit within the window")
            .unwrap();
        match emitted {
            Request::Dns(r) => {
                assert_eq!(r.name, "found.example.com");
                assert_eq!(r.tag, Tag::Api);
                assert_eq!(r.source, "VerticalSource");
            }
            other => panic!("unexpected request {:?}", other),
        }

        // The second new_name call carried junk and must not surface.
        assert!(service.output().try_recv().is_err());
        service.stop().await.unwrap();
    }

    const ASN_SCRIPT: &str = r#"
        name = "AsnSource"
        type = "rir"

        function asn(ctx, addr, asn)
            new_asn(ctx, {addr="not.a.valid.addr", asn=15169, prefix="172.217.0.0/19", desc="GOOGLE"})
            new_asn(ctx, {addr="52.8.0.1", asn=16509, prefix="52.8.0.0/invalid", desc="AMAZON"})
            new_asn(ctx, {addr="52.8.0.1", asn=16509, prefix="52.8.0.0/13", desc="AMAZON-02"})
        end
    "#;

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_asn_submissions_are_rejected_silently() {
        let service =
            ScriptService::from_source(ASN_SCRIPT, host_with(Config::new(&["example.com"])))
                .unwrap();
        service.start().await.unwrap();

        let ctx = CancellationToken::new();
        service
            .submit(
                &ctx,
                Request::Asn(sprawl_engine::requests::AsnRequest {
                    address: Some("52.8.0.1".parse().unwrap()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        // Only the third, fully valid record makes it out.
        let emitted = tokio::time::timeout(Duration::from_secs(5), service.output().recv_async())
            .await
            .expect("valid ASN record should surface")
            .unwrap();
        match emitted {
            Request::Asn(r) => {
                assert_eq!(r.asn, 16509);
                assert_eq!(r.prefix.unwrap().to_string(), "52.8.0.0/13");
                assert_eq!(r.description, "AMAZON-02");
            }
            other => panic!("unexpected request {:?}", other),
        }
        assert!(service.output().try_recv().is_err());
        service.stop().await.unwrap();
    }

    const STATEFUL_SCRIPT: &str = r#"
        name = "Stateful"
        type = "scrape"
        started = false

        function start(ctx)
            started = true
        end

        function vertical(ctx, domain)
            if started then
                send_names(ctx, "a.example.com b.example.com a.example.com")
            end
        end
    "#;

    #[tokio::test(flavor = "multi_thread")]
    async fn send_names_extracts_and_dedups() {
        let service =
            ScriptService::from_source(STATEFUL_SCRIPT, host_with(Config::new(&["example.com"])))
                .unwrap();
        service.start().await.unwrap();

        let ctx = CancellationToken::new();
        service
            .submit(
                &ctx,
                Request::Dns(DnsRequest::new("example.com", "example.com", Tag::Dns, "t")),
            )
            .await
            .unwrap();

        let mut names = Vec::new();
        for _ in 0..2 {
            let emitted =
                tokio::time::timeout(Duration::from_secs(5), service.output().recv_async())
                    .await
                    .expect("names should surface")
                    .unwrap();
            if let Request::Dns(r) = emitted {
                names.push(r.name);
            }
        }
        names.sort();
        assert_eq!(names, vec!["a.example.com", "b.example.com"]);
        assert!(service.output().try_recv().is_err());
        service.stop().await.unwrap();
    }

    #[test]
    fn scripts_without_a_name_are_rejected() {
        let result = ScriptService::from_source(
            "type = 'api'",
            host_with(Config::new(&["example.com"])),
        );
        assert!(result.is_err());
    }
}
