//! DNS capabilities: `resolve`, `reverse_sweep`, `zone_walk` and
//! `zone_transfer`, all routed through the engine's resolver pools.

use std::net::IpAddr;
use std::sync::Arc;

use mlua::{Lua, Table, Value};

use sprawl_engine::net::xfer;
use sprawl_engine::requests::{canonical, DnsRequest, Request, Tag};
use sprawl_engine::resolve::answers;

use crate::script::{api, ScriptEnv};

/// Addresses probed on each side of the target during a reverse sweep.
const SWEEP_SPAN: u8 = 25;

pub(crate) fn register(lua: &Lua, env: &Arc<ScriptEnv>) -> mlua::Result<()> {
    let globals = lua.globals();

    let e = Arc::clone(env);
    globals.set(
        "resolve",
        lua.create_function(
            move |lua,
                  (_ctx, name, rr_type, detect): (
                Value,
                String,
                Option<String>,
                Option<bool>,
            )| {
                let rr_type = parse_type(rr_type.as_deref().unwrap_or("A"));
                let Some(rr_type) = rr_type else {
                    return Ok((None, Some("unsupported record type".to_string())));
                };
                let Some(query) = answers::build_query(&canonical(&name), rr_type) else {
                    return Ok((None, Some("invalid name".to_string())));
                };

                let response =
                    match e.block_on(e.untrusted.query_blocking(&e.ctx, query)) {
                        Ok(response) => response,
                        Err(err) => return Ok((None, Some(err.to_string()))),
                    };
                if detect.unwrap_or(false)
                    && e.block_on(async {
                        let apex = e.config.which_domain(&name).unwrap_or_default();
                        e.trusted.wildcard_detected(&e.ctx, &response, &apex).await
                    })
                {
                    return Ok((None, Some("wildcard response".to_string())));
                }

                let rows = lua.create_table()?;
                for (idx, answer) in answers::extract_answers(&response).iter().enumerate() {
                    let row = lua.create_table()?;
                    row.set("rrname", answer.name.clone())?;
                    row.set("rrtype", answer.rr_type)?;
                    row.set("rrdata", answer.data.clone())?;
                    rows.set(idx + 1, row)?;
                }
                Ok((Some(rows), None::<String>))
            },
        )?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "reverse_sweep",
        lua.create_function(move |_, (_ctx, addr): (Value, String)| {
            let Ok(center) = addr.parse::<IpAddr>() else {
                return Ok(());
            };
            for probe in sweep_range(center) {
                let ptr_name = answers::reverse_name(probe);
                let Some(query) =
                    answers::build_query(&ptr_name, hickory_ptr_type())
                else {
                    continue;
                };
                let Ok(response) = e.block_on(e.untrusted.query_blocking(&e.ctx, query)) else {
                    continue;
                };
                for answer in answers::extract_answers(&response) {
                    api::emit_name(&e, &answer.data);
                }
            }
            Ok(())
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "zone_walk",
        lua.create_function(move |lua, (_ctx, name): (Value, String)| {
            let walked = e.block_on(e.trusted.nsec_traversal(&e.ctx, &canonical(&name)));
            match walked {
                Ok(names) => {
                    let rows = lua.create_table()?;
                    for (idx, found) in names.iter().enumerate() {
                        api::emit_name(&e, found);
                        rows.set(idx + 1, found.clone())?;
                    }
                    Ok((Some(rows), None::<String>))
                }
                Err(err) => Ok((None, Some(err.to_string()))),
            }
        })?,
    )?;

    let e = Arc::clone(env);
    globals.set(
        "zone_transfer",
        lua.create_function(
            move |lua, (_ctx, _name, domain, server): (Value, String, String, String)| {
                let domain = canonical(&domain);
                let server = canonical(&server);
                let Some(server_ip) = resolve_server(&e, &server) else {
                    return Ok((None, Some(format!("failed to resolve {}", server))));
                };

                let records = match e.block_on(xfer::zone_transfer(&domain, server_ip)) {
                    Ok(records) => records,
                    Err(err) => return Ok((None, Some(err.to_string()))),
                };

                let mut by_owner: std::collections::BTreeMap<String, Vec<_>> =
                    std::collections::BTreeMap::new();
                for record in records {
                    by_owner.entry(record.name.clone()).or_default().push(record);
                }

                let rows = lua.create_table()?;
                let mut idx = 0;
                for (owner, group) in by_owner {
                    if e.config.which_domain(&owner).is_none() {
                        continue;
                    }
                    idx += 1;
                    rows.set(idx, owner.clone())?;
                    let mut resolved =
                        DnsRequest::new(&owner, &domain, Tag::Axfr, &e.script_name);
                    resolved.records = group;
                    e.emit(Request::Resolved(resolved));
                }
                Ok((Some(rows), None::<String>))
            },
        )?,
    )?;

    Ok(())
}

fn hickory_ptr_type() -> hickory_proto::rr::RecordType {
    hickory_proto::rr::RecordType::PTR
}

fn parse_type(text: &str) -> Option<hickory_proto::rr::RecordType> {
    use hickory_proto::rr::RecordType;
    match text.to_ascii_uppercase().as_str() {
        "A" => Some(RecordType::A),
        "AAAA" => Some(RecordType::AAAA),
        "CNAME" => Some(RecordType::CNAME),
        "PTR" => Some(RecordType::PTR),
        "NS" => Some(RecordType::NS),
        "MX" => Some(RecordType::MX),
        "TXT" => Some(RecordType::TXT),
        "SOA" => Some(RecordType::SOA),
        "SRV" => Some(RecordType::SRV),
        _ => None,
    }
}

fn sweep_range(center: IpAddr) -> Vec<IpAddr> {
    let IpAddr::V4(v4) = center else {
        return vec![center];
    };
    let base = u32::from(v4);
    let low = base.saturating_sub(SWEEP_SPAN as u32);
    let high = base.saturating_add(SWEEP_SPAN as u32);
    (low..=high).map(|value| IpAddr::V4(value.into())).collect()
}

fn resolve_server(env: &Arc<ScriptEnv>, server: &str) -> Option<IpAddr> {
    if let Ok(addr) = server.parse::<IpAddr>() {
        return Some(addr);
    }
    let query = answers::build_query(server, hickory_proto::rr::RecordType::A)?;
    let response = env
        .block_on(env.trusted.query_blocking(&env.ctx, query))
        .ok()?;
    answers::extract_answers(&response)
        .iter()
        .find(|answer| answer.rr_type == u16::from(hickory_proto::rr::RecordType::A))
        .and_then(|answer| answer.data.parse().ok())
}
