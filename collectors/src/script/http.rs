//! HTTP capabilities: `request`, `scrape` and `crawl`, all sharing the
//! response cache and the source's credentials.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::Engine as _;
use mlua::{Lua, Table, Value};

use sprawl_engine::config::any_subdomain_regex;
use sprawl_engine::net::http as engine_http;
use sprawl_engine::requests::canonical;

use crate::script::{api, ScriptEnv};

pub(crate) fn register(lua: &Lua, env: &Arc<ScriptEnv>) -> mlua::Result<()> {
    let globals = lua.globals();

    let e = Arc::clone(env);
    globals.set(
        "request",
        lua.create_function(move |_, (_ctx, opts): (Value, Table)| {
            Ok(perform_request(&e, &opts))
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "scrape",
        lua.create_function(move |_, (_ctx, opts): (Value, Table)| {
            let (body, _err) = perform_request(&e, &opts);
            let Some(body) = body else {
                return Ok(false);
            };
            let mut seen: BTreeSet<String> = BTreeSet::new();
            for found in any_subdomain_regex().find_iter(&body) {
                let name = canonical(found.as_str());
                if seen.insert(name.clone()) {
                    api::emit_name(&e, &name);
                }
            }
            Ok(!seen.is_empty())
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "crawl",
        lua.create_function(move |_, (_ctx, url, _max_depth): (Value, String, Option<usize>)| {
            let config = Arc::clone(&e.config);
            let findings = e.block_on(engine_http::crawl(&e.http, &url, move |host| {
                config.is_domain_in_scope(host)
            }));
            for name in findings.names {
                api::emit_name(&e, &name);
            }
            Ok(())
        })?,
    )?;

    Ok(())
}

/// One cached HTTP exchange. Returns `(body, nil)` on success and
/// `(nil, error)` otherwise, the way scripts expect.
fn perform_request(env: &Arc<ScriptEnv>, opts: &Table) -> (Option<String>, Option<String>) {
    let Ok(url) = opts.get::<String>("url") else {
        return (None, Some("request requires a url".to_string()));
    };
    let method: String = opts.get("method").unwrap_or_else(|_| "GET".to_string());
    let body: String = opts.get("body").unwrap_or_default();

    if let Some(cached) = env.cache.get(&url, &body) {
        return (Some(cached), None);
    }

    let outcome = env.block_on(send(env, &url, &method, &body, opts));
    match outcome {
        Ok(text) => {
            env.cache
                .put(&url, &body, text.clone(), env.cache_ttl_minutes());
            (Some(text), None)
        }
        Err(err) => (None, Some(err)),
    }
}

async fn send(
    env: &Arc<ScriptEnv>,
    url: &str,
    method: &str,
    body: &str,
    opts: &Table,
) -> std::result::Result<String, String> {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|err| err.to_string())?;
    let mut request = env.http.request(method, url);

    if !body.is_empty() {
        request = request.body(body.to_string());
    }
    if let Ok(headers) = opts.get::<Table>("headers") {
        for pair in headers.pairs::<String, String>().flatten() {
            request = request.header(pair.0, pair.1);
        }
    }
    if let Some(entry) = env.source_config() {
        if let Some(credentials) = entry.credentials {
            match (credentials.username, credentials.password) {
                (Some(username), Some(password)) => {
                    let token = base64::prelude::BASE64_STANDARD
                        .encode(format!("{}:{}", username, password));
                    request = request.header("Authorization", format!("Basic {}", token));
                }
                _ => {}
            }
        }
    }

    let response = request.send().await.map_err(|err| err.to_string())?;
    let status = response.status();
    if !status.is_success() && !status.is_redirection() {
        return Err(format!("{} answered {}", url, status));
    }
    response.text().await.map_err(|err| err.to_string())
}
