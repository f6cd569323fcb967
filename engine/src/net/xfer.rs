//! Zone transfers: AXFR against one authoritative server over TCP.

use std::net::{IpAddr, SocketAddr};

use hickory_client::client::{Client, ClientHandle};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::runtime::TokioRuntimeProvider;
use hickory_proto::tcp::TcpClientStream;

use crate::error::{EngineError, Result};
use crate::net::{XFR_CONNECT_TIMEOUT, XFR_READ_TIMEOUT};
use crate::requests::DnsAnswer;
use crate::resolve::answers;

/// Transfer `zone` from the server at `server_ip` and return every
/// resource record. An RR owned by a `*.` name is rewritten to `www.` so
/// the wildcard's existence surfaces without tripping wildcard defense.
pub async fn zone_transfer(zone: &str, server_ip: IpAddr) -> Result<Vec<DnsAnswer>> {
    let zone_name = Name::from_ascii(zone)
        .map_err(|err| EngineError::validation_error(&err.to_string()))?;
    let target = SocketAddr::new(server_ip, 53);

    let (stream, sender) =
        TcpClientStream::new(target, None, Some(XFR_READ_TIMEOUT), TokioRuntimeProvider::new());
    let connect = Client::new(stream, sender, None);
    let (mut client, bg) = tokio::time::timeout(XFR_CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| EngineError::validation_error(&format!("connect to {} timed out", target)))?
        .map_err(|err| EngineError::validation_error(&err.to_string()))?;
    tokio::spawn(bg);

    let response = tokio::time::timeout(
        XFR_READ_TIMEOUT,
        client.query(zone_name, DNSClass::IN, RecordType::AXFR),
    )
    .await
    .map_err(|_| EngineError::validation_error(&format!("transfer from {} timed out", target)))?
    .map_err(|err| EngineError::validation_error(&err.to_string()))?;

    Ok(answers::convert_records(response.answers())
        .into_iter()
        .map(dewildcard)
        .collect())
}

fn dewildcard(mut answer: DnsAnswer) -> DnsAnswer {
    if let Some(rest) = answer.name.strip_prefix("*.") {
        answer.name = format!("www.{}", rest);
    }
    answer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_owners_become_www() {
        let rewritten = dewildcard(DnsAnswer::new("*.example.com", 1, 60, "192.0.2.1"));
        assert_eq!(rewritten.name, "www.example.com");

        let untouched = dewildcard(DnsAnswer::new("app.example.com", 1, 60, "192.0.2.1"));
        assert_eq!(untouched.name, "app.example.com");
    }
}
