//! Test support: a scriptable resolver pool and a channel-backed data
//! source, used by the unit and scenario tests.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{rdata, Name, RData, Record, RecordType};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::requests::{canonical, has_suffix, DnsAnswer, Request};
use crate::resolve::wildcards;
use crate::resolve::{answers, ResolveError, ResolverPool};
use crate::service::{Service, ServiceBase};

/// A resolver pool answering from a programmed table, with optional
/// wildcard zones that answer for any label.
#[derive(Default)]
pub struct StubPool {
    size: usize,
    answers: Mutex<HashMap<(String, u16), Vec<DnsAnswer>>>,
    wildcards: Mutex<HashMap<String, HashMap<u16, Vec<String>>>>,
    walks: Mutex<HashMap<String, Vec<String>>>,
}

impl StubPool {
    pub fn new() -> Self {
        Self {
            size: 1,
            ..Default::default()
        }
    }

    /// A pool with no resolvers behind it; assembly-level tests use this.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Program a fixed answer set for `(name, rr_type)`.
    pub fn answer(&self, name: &str, rr_type: RecordType, data: &[&str]) {
        let name = canonical(name);
        let records = data
            .iter()
            .map(|d| DnsAnswer::new(&name, u16::from(rr_type), 60, d))
            .collect();
        self.answers
            .lock()
            .unwrap()
            .insert((name, u16::from(rr_type)), records);
    }

    /// Program a wildcard: any non-apex label under `apex` answers with
    /// `data` for `rr_type`.
    pub fn wildcard(&self, apex: &str, rr_type: RecordType, data: &[&str]) {
        self.wildcards
            .lock()
            .unwrap()
            .entry(canonical(apex))
            .or_default()
            .insert(
                u16::from(rr_type),
                data.iter().map(|d| d.to_string()).collect(),
            );
    }

    /// Program an NSEC chain rooted at `name`.
    pub fn walk(&self, name: &str, chain: &[&str]) {
        self.walks
            .lock()
            .unwrap()
            .insert(canonical(name), chain.iter().map(|c| c.to_string()).collect());
    }

    fn lookup(&self, name: &str, rr_type: u16) -> std::result::Result<Vec<DnsAnswer>, ResolveError> {
        let name = canonical(name);
        let answers = self.answers.lock().unwrap();
        if let Some(found) = answers.get(&(name.clone(), rr_type)) {
            return Ok(found.clone());
        }
        let name_known = answers.keys().any(|(known, _)| *known == name);
        drop(answers);

        let wildcards = self.wildcards.lock().unwrap();
        for (apex, types) in wildcards.iter() {
            if name != *apex && has_suffix(&name, apex) {
                if let Some(data) = types.get(&rr_type) {
                    return Ok(data
                        .iter()
                        .map(|d| DnsAnswer::new(&name, rr_type, 60, d))
                        .collect());
                }
                return Err(ResolveError::NoRecordOfThisType { name, rr_type });
            }
        }

        if name_known {
            Err(ResolveError::NoRecordOfThisType { name, rr_type })
        } else {
            Err(ResolveError::NameDoesNotExist { name })
        }
    }
}

#[async_trait]
impl ResolverPool for StubPool {
    fn len(&self) -> usize {
        self.size
    }

    async fn query(
        &self,
        ctx: &CancellationToken,
        msg: Message,
    ) -> std::result::Result<Message, ResolveError> {
        if ctx.is_cancelled() {
            return Err(ResolveError::ContextExpired);
        }
        let Some(question) = msg.queries().first().cloned() else {
            return Err(ResolveError::Malformed {
                msg: "no question".to_string(),
            });
        };
        let name = canonical(&question.name().to_string());
        let found = self.lookup(&name, u16::from(question.query_type()))?;

        let mut response = msg.clone();
        response.set_message_type(MessageType::Response);
        response.set_response_code(ResponseCode::NoError);
        response.insert_answers(found.iter().filter_map(record_of).collect());
        Ok(response)
    }

    async fn query_blocking(
        &self,
        ctx: &CancellationToken,
        msg: Message,
    ) -> std::result::Result<Message, ResolveError> {
        self.query(ctx, msg).await
    }

    async fn wildcard_detected(&self, ctx: &CancellationToken, msg: &Message, apex: &str) -> bool {
        let candidate = wildcards::answer_sets(msg);
        if candidate.is_empty() {
            return false;
        }
        for (rr_type, set) in candidate {
            let probe_name = format!("{}.{}", wildcards::unlikely_label(), apex);
            let Some(query) = answers::build_query(&probe_name, RecordType::from(rr_type)) else {
                continue;
            };
            if let Ok(probe) = self.query(ctx, query).await {
                if let Some(profile) = wildcards::answer_sets(&probe).remove(&rr_type) {
                    if profile == set {
                        return true;
                    }
                }
            }
        }
        false
    }

    async fn nsec_traversal(
        &self,
        _ctx: &CancellationToken,
        name: &str,
    ) -> std::result::Result<Vec<String>, ResolveError> {
        Ok(self
            .walks
            .lock()
            .unwrap()
            .get(&canonical(name))
            .cloned()
            .unwrap_or_default())
    }
}

fn record_of(answer: &DnsAnswer) -> Option<Record> {
    let owner = Name::from_ascii(&answer.name).ok()?;
    let rr_type = RecordType::from(answer.rr_type);
    let rdata = match rr_type {
        RecordType::A => RData::A(rdata::A(Ipv4Addr::from_str(&answer.data).ok()?)),
        RecordType::AAAA => RData::AAAA(rdata::AAAA(Ipv6Addr::from_str(&answer.data).ok()?)),
        RecordType::CNAME => RData::CNAME(rdata::CNAME(Name::from_ascii(&answer.data).ok()?)),
        RecordType::NS => RData::NS(rdata::NS(Name::from_ascii(&answer.data).ok()?)),
        RecordType::PTR => RData::PTR(rdata::PTR(Name::from_ascii(&answer.data).ok()?)),
        RecordType::MX => {
            let (preference, exchange) = answer.data.split_once(' ')?;
            RData::MX(rdata::MX::new(
                preference.parse().ok()?,
                Name::from_ascii(exchange).ok()?,
            ))
        }
        RecordType::TXT => RData::TXT(rdata::TXT::new(vec![answer.data.clone()])),
        RecordType::SOA => {
            let (mname, rname) = answer.data.split_once(' ')?;
            RData::SOA(rdata::SOA::new(
                Name::from_ascii(mname).ok()?,
                Name::from_ascii(rname).ok()?,
                0,
                3600,
                600,
                86400,
                300,
            ))
        }
        RecordType::SRV => {
            let fields: Vec<&str> = answer.data.split(' ').collect();
            if fields.len() != 4 {
                return None;
            }
            RData::SRV(rdata::SRV::new(
                fields[0].parse().ok()?,
                fields[1].parse().ok()?,
                fields[2].parse().ok()?,
                Name::from_ascii(fields[3]).ok()?,
            ))
        }
        _ => return None,
    };
    Some(Record::from_rdata(owner, answer.ttl, rdata))
}

/// A data source that replays a fixed set of requests when started.
pub struct ReplaySource {
    base: ServiceBase,
    requests: Mutex<Vec<Request>>,
}

impl ReplaySource {
    pub fn new(name: &str, requests: Vec<Request>) -> Self {
        Self {
            base: ServiceBase::new(name),
            requests: Mutex::new(requests),
        }
    }
}

#[async_trait]
impl Service for ReplaySource {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn handles_request(&self, _req: &Request) -> bool {
        false
    }

    async fn submit(&self, ctx: &CancellationToken, req: Request) -> Result<()> {
        self.base.submit(ctx, req).await
    }

    fn output(&self) -> flume::Receiver<Request> {
        self.base.output()
    }

    fn done(&self) -> CancellationToken {
        self.base.done()
    }

    async fn start(&self) -> Result<()> {
        let sender = self.base.output_sender();
        for req in self.requests.lock().unwrap().drain(..) {
            let _ = sender.send(req);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.base.mark_done();
        Ok(())
    }
}
