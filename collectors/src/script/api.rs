//! Core capabilities: scope queries, emission of names/addresses/ASNs,
//! configuration access, regex helpers, rate limiting.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ip_network::IpNetwork;
use mlua::{Lua, Table, Value};
use regex::Regex;

use sprawl_engine::config::any_subdomain_regex;
use sprawl_engine::requests::{
    canonical, is_fqdn, AddrRequest, AsnRequest, DnsAnswer, DnsRequest, Request, WhoisRequest,
};

use crate::script::ScriptEnv;

pub(crate) fn register(lua: &Lua, env: &Arc<ScriptEnv>) -> mlua::Result<()> {
    let globals = lua.globals();

    let e = Arc::clone(env);
    globals.set(
        "log",
        lua.create_function(move |_, (_ctx, msg): (Value, String)| {
            log::info!("{}: {}", e.script_name, msg);
            Ok(())
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "new_name",
        lua.create_function(move |_, (_ctx, name): (Value, String)| {
            emit_name(&e, &name);
            Ok(())
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "send_names",
        lua.create_function(move |_, (_ctx, text): (Value, String)| {
            let mut seen: BTreeSet<String> = BTreeSet::new();
            for found in any_subdomain_regex().find_iter(&text) {
                let name = canonical(found.as_str());
                if seen.insert(name.clone()) {
                    emit_name(&e, &name);
                }
            }
            Ok(())
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "send_dns_records",
        lua.create_function(move |_, (_ctx, name, records): (Value, String, Table)| {
            let name = canonical(&name);
            let Some(domain) = e.config.which_domain(&name) else {
                return Ok(());
            };
            let mut request = DnsRequest::new(&name, &domain, e.tag, &e.script_name);
            for row in records.sequence_values::<Table>().flatten() {
                let rr_type: u16 = row.get("rrtype").unwrap_or(0);
                let rr_data: String = row.get("rrdata").unwrap_or_default();
                if rr_type == 0 || rr_data.is_empty() {
                    continue;
                }
                let rr_name: String = row.get("rrname").unwrap_or_else(|_| name.clone());
                request.records.push(DnsAnswer::new(&rr_name, rr_type, 0, &rr_data));
            }
            if !request.records.is_empty() {
                e.emit(Request::Resolved(request));
            }
            Ok(())
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "new_addr",
        lua.create_function(
            move |_, (_ctx, addr, name): (Value, String, Option<String>)| {
                let Ok(address) = addr.parse::<std::net::IpAddr>() else {
                    return Ok(());
                };
                let owner = name.map(|n| canonical(&n)).unwrap_or_default();
                let Some(domain) = e.config.which_domain(&owner) else {
                    return Ok(());
                };
                e.emit(Request::Addr(AddrRequest {
                    address,
                    domain,
                    in_scope: e.config.is_domain_in_scope(&owner),
                    tag: e.tag,
                    source: e.script_name.clone(),
                }));
                Ok(())
            },
        )?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "new_asn",
        lua.create_function(move |_, (_ctx, data): (Value, Table)| {
            if let Some(request) = asn_from_table(&e, &data) {
                e.emit(Request::Asn(request));
            }
            Ok(())
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "associated",
        lua.create_function(move |_, (_ctx, domain, assoc): (Value, String, String)| {
            let domain = canonical(&domain);
            let assoc = canonical(&assoc);
            // Associations are registrable domains; anything deeper is
            // reduced to its apex before it surfaces.
            let Some(registrable) = psl::domain_str(&assoc) else {
                return Ok(());
            };
            if is_fqdn(&domain) && is_fqdn(registrable) {
                e.emit(Request::Whois(WhoisRequest {
                    domain,
                    new_domains: vec![registrable.to_string()],
                    tag: e.tag,
                    source: e.script_name.clone(),
                    ..Default::default()
                }));
            }
            Ok(())
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "in_scope",
        lua.create_function(move |_, (_ctx, name): (Value, String)| {
            Ok(e.config.is_domain_in_scope(&canonical(&name)))
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "config",
        lua.create_function(move |lua, _ctx: Value| {
            let table = lua.create_table()?;
            let mode = if e.config.active {
                "active"
            } else if e.config.passive {
                "passive"
            } else {
                "normal"
            };
            table.set("mode", mode)?;
            table.set("event_id", e.config.uuid.to_string())?;
            table.set("max_depth", e.config.max_depth)?;
            table.set("brute_forcing", e.config.brute_forcing)?;
            table.set("alterations", e.config.alterations)?;
            let domains = lua.create_table()?;
            for (idx, domain) in e.config.domains().into_iter().enumerate() {
                domains.set(idx + 1, domain)?;
            }
            table.set("domains", domains)?;
            Ok(table)
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "datasrc_config",
        lua.create_function(move |lua, _ctx: Value| {
            let table = lua.create_table()?;
            table.set("name", e.script_name.clone())?;
            if let Some(entry) = e.source_config() {
                if let Some(ttl) = entry.ttl_minutes {
                    table.set("ttl", ttl)?;
                }
                if let Some(credentials) = entry.credentials {
                    if let Some(username) = credentials.username {
                        table.set("username", username)?;
                    }
                    if let Some(password) = credentials.password {
                        table.set("password", password)?;
                    }
                    if let Some(apikey) = credentials.apikey {
                        table.set("apikey", apikey)?;
                    }
                    if let Some(secret) = credentials.secret {
                        table.set("secret", secret)?;
                    }
                }
            }
            Ok(table)
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "brute_wordlist",
        lua.create_function(move |lua, _ctx: Value| {
            wordlist_table(lua, &e.config.wordlist)
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "alt_wordlist",
        lua.create_function(move |lua, _ctx: Value| {
            wordlist_table(lua, &e.config.alt_wordlist)
        })?,
    )?;

    globals.set(
        "find",
        lua.create_function(
            |lua, (_ctx, text, pattern): (Value, String, String)| match Regex::new(&pattern) {
                Ok(re) => {
                    let matches = lua.create_table()?;
                    for (idx, found) in re.find_iter(&text).enumerate() {
                        matches.set(idx + 1, found.as_str())?;
                    }
                    Ok((Some(matches), None::<String>))
                }
                Err(err) => Ok((None, Some(err.to_string()))),
            },
        )?,
    )?;

    globals.set(
        "submatch",
        lua.create_function(
            |lua, (_ctx, text, pattern): (Value, String, String)| match Regex::new(&pattern) {
                Ok(re) => match re.captures(&text) {
                    Some(captures) => {
                        let groups = lua.create_table()?;
                        for (idx, group) in captures.iter().enumerate() {
                            if let Some(group) = group {
                                groups.set(idx + 1, group.as_str())?;
                            }
                        }
                        Ok((Some(groups), None::<String>))
                    }
                    None => Ok((None, None)),
                },
                Err(err) => Ok((None, Some(err.to_string()))),
            },
        )?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "output_dir",
        lua.create_function(move |_, _ctx: Value| {
            Ok(e.config
                .output_dir
                .as_ref()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| ".".to_string()))
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "mtime",
        lua.create_function(move |_, (_ctx, path): (Value, String)| {
            // Only paths under the configured output directory are
            // visible to scripts.
            if path.contains("..") || std::path::Path::new(&path).is_absolute() {
                return Ok(None::<u64>);
            }
            let base = e
                .config
                .output_dir
                .clone()
                .unwrap_or_else(|| std::path::PathBuf::from("."));
            let target = base.join(&path);
            let modified = std::fs::metadata(&target)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|since| since.as_secs());
            Ok(modified)
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "set_rate_limit",
        lua.create_function(move |_, (_ctx, seconds): (Value, f64)| {
            if seconds.is_finite() && seconds >= 0.0 {
                e.limiter.set_interval(Duration::from_secs_f64(seconds));
            }
            Ok(())
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "check_rate_limit",
        lua.create_function(move |_, _ctx: Value| {
            e.block_on(e.limiter.wait());
            Ok(())
        })?,
    )?;

    Ok(())
}

fn wordlist_table(lua: &Lua, words: &[String]) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for (idx, word) in words.iter().enumerate() {
        table.set(idx + 1, word.clone())?;
    }
    Ok(table)
}

/// Validate and emit a discovered name; anything out of scope or
/// syntactically wrong is dropped without an error.
pub(crate) fn emit_name(env: &Arc<ScriptEnv>, name: &str) {
    let name = canonical(name);
    if !is_fqdn(&name) {
        return;
    }
    let Some(domain) = env.config.which_domain(&name) else {
        return;
    };
    if env.config.blacklisted(&name) {
        return;
    }
    env.emit(Request::Dns(DnsRequest::new(
        &name,
        &domain,
        env.tag,
        &env.script_name,
    )));
}

/// Build a validated ASN record from a script table. Every CIDR string is
/// re-parsed; a single bad field rejects the whole record.
fn asn_from_table(env: &Arc<ScriptEnv>, data: &Table) -> Option<AsnRequest> {
    let addr: Option<String> = data.get("addr").ok();
    let address = match addr {
        Some(text) => Some(text.parse::<std::net::IpAddr>().ok()?),
        None => None,
    };

    let prefix: Option<String> = data.get("prefix").ok();
    let prefix = match prefix {
        Some(text) => Some(text.parse::<IpNetwork>().ok()?),
        None => None,
    };

    let mut netblocks: Vec<IpNetwork> = Vec::new();
    if let Ok(listed) = data.get::<Table>("netblocks") {
        for block in listed.sequence_values::<String>() {
            let parsed = block.ok()?.parse::<IpNetwork>().ok()?;
            if !netblocks.contains(&parsed) {
                netblocks.push(parsed);
            }
        }
    }
    if let Some(prefix) = prefix {
        if !netblocks.contains(&prefix) {
            netblocks.push(prefix);
        }
    }

    let request = AsnRequest {
        address,
        asn: data.get("asn").unwrap_or(0),
        prefix,
        cc: data.get("cc").unwrap_or_default(),
        registry: data.get("registry").unwrap_or_default(),
        allocation_date: data
            .get::<String>("alloc_date")
            .ok()
            .and_then(|text| chrono::DateTime::parse_from_rfc3339(&text).ok())
            .map(|parsed| parsed.with_timezone(&chrono::Utc)),
        description: data.get("desc").unwrap_or_default(),
        netblocks,
        tag: env.tag,
        source: env.script_name.clone(),
    };
    request.valid().then_some(request)
}
