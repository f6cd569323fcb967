//! Conversion between hickory messages and the pipeline's record model.

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use crate::requests::DnsAnswer;

/// Build a single-question query message for `name`.
pub fn build_query(name: &str, rr_type: RecordType) -> Option<Message> {
    let qname = Name::from_ascii(name).ok()?;
    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(qname, rr_type));
    Some(msg)
}

/// Convert every answer record of `msg`.
pub fn extract_answers(msg: &Message) -> Vec<DnsAnswer> {
    convert_records(msg.answers())
}

/// Convert records into normalised answers, dropping types the pipeline
/// has no rendering for.
pub fn convert_records(records: &[Record]) -> Vec<DnsAnswer> {
    records
        .iter()
        .filter_map(|record| {
            let data = render_data(record)?;
            Some(DnsAnswer::new(
                &record.name().to_string(),
                u16::from(record.record_type()),
                record.ttl(),
                &data,
            ))
        })
        .collect()
}

/// Render rdata the way the graph stores it: lowercase, dot-trimmed, with
/// SOA reduced to its canonical `MNAME RNAME` pair.
fn render_data(record: &Record) -> Option<String> {
    let rendered = match record.data() {
        RData::A(addr) => addr.to_string(),
        RData::AAAA(addr) => addr.to_string(),
        RData::CNAME(name) => name.to_string(),
        RData::NS(name) => name.to_string(),
        RData::PTR(name) => name.to_string(),
        RData::MX(mx) => format!("{} {}", mx.preference(), mx.exchange()),
        RData::SRV(srv) => format!(
            "{} {} {} {}",
            srv.priority(),
            srv.weight(),
            srv.port(),
            srv.target()
        ),
        RData::SOA(soa) => format!("{} {}", soa.mname(), soa.rname()),
        RData::TXT(txt) => txt
            .txt_data()
            .iter()
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    };
    if rendered.is_empty() {
        return None;
    }
    Some(rendered)
}

/// The reverse-lookup owner name for an address.
pub fn reverse_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!(
                "{}.{}.{}.{}.in-addr.arpa",
                octets[3], octets[2], octets[1], octets[0]
            )
        }
        IpAddr::V6(v6) => {
            let mut labels = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                labels.push(format!("{:x}", byte & 0x0f));
                labels.push(format!("{:x}", byte >> 4));
            }
            format!("{}.ip6.arpa", labels.join("."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata;

    #[test]
    fn reverse_names_follow_rfc_shape() {
        assert_eq!(
            reverse_name("72.237.4.113".parse().unwrap()),
            "113.4.237.72.in-addr.arpa"
        );
        let v6 = reverse_name("2001:db8::1".parse().unwrap());
        assert!(v6.ends_with(".ip6.arpa"));
        assert_eq!(v6.split('.').count(), 34);
        assert!(v6.starts_with("1.0.0.0."));
    }

    #[test]
    fn soa_renders_mname_rname_only() {
        let soa = rdata::SOA::new(
            Name::from_ascii("NS1.Example.com.").unwrap(),
            Name::from_ascii("hostmaster.example.com.").unwrap(),
            2024010101,
            7200,
            3600,
            1209600,
            300,
        );
        let record = Record::from_rdata(
            Name::from_ascii("example.com.").unwrap(),
            300,
            RData::SOA(soa),
        );
        let answers = convert_records(&[record]);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].data, "ns1.example.com hostmaster.example.com");
    }

    #[test]
    fn answers_are_normalised() {
        let record = Record::from_rdata(
            Name::from_ascii("WWW.Example.COM.").unwrap(),
            60,
            RData::CNAME(rdata::CNAME(Name::from_ascii("App.Example.COM.").unwrap())),
        );
        let answers = convert_records(&[record]);
        assert_eq!(answers[0].name, "www.example.com");
        assert_eq!(answers[0].data, "app.example.com");
        assert_eq!(answers[0].rr_type, u16::from(RecordType::CNAME));
    }

    #[test]
    fn build_query_carries_one_question() {
        let msg = build_query("www.example.com", RecordType::A).unwrap();
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].query_type(), RecordType::A);
        assert!(build_query("not a name", RecordType::A).is_none());
    }
}
