//! TLS certificate grabs: connect, complete a handshake with
//! verification disabled, and mine the peer certificate for DNS names.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::{EngineError, Result};
use crate::net::DIAL_TIMEOUT;
use crate::requests::canonical;

/// Certificate checks are the target's problem, not ours: the engine
/// talks to plenty of hosts serving expired or mismatched certificates
/// and still wants the names inside.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Pull the DNS names presented by the TLS endpoint at `addr:port`.
pub async fn cert_names(addr: IpAddr, port: u16) -> Result<Vec<String>> {
    let target = SocketAddr::new(addr, port);
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| EngineError::validation_error(&format!("dial {} timed out", target)))??;

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::IpAddress(addr.into());

    let tls = tokio::time::timeout(DIAL_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| EngineError::validation_error(&format!("handshake with {} timed out", target)))??;

    let (_, session) = tls.get_ref();
    let mut names = Vec::new();
    if let Some(certs) = session.peer_certificates() {
        for der in certs {
            for name in names_from_der(der.as_ref()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    Ok(names)
}

/// DNS names in a DER-encoded certificate: subject alternative names
/// first, the subject common name as a fallback. Leading wildcard labels
/// are stripped so `*.example.com` surfaces as `example.com`.
pub fn names_from_der(der: &[u8]) -> Vec<String> {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return Vec::new();
    };

    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns_name) = general_name {
                push_name(&mut names, dns_name);
            }
        }
    }
    for attr in cert.subject().iter_common_name() {
        if let Ok(cn) = attr.as_str() {
            push_name(&mut names, cn);
        }
    }
    names
}

fn push_name(names: &mut Vec<String>, raw: &str) {
    let name = canonical(raw.trim_start_matches("*."));
    if !name.is_empty() && name.contains('.') && !names.contains(&name) {
        names.push(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_prefixes_are_stripped() {
        let mut names = Vec::new();
        push_name(&mut names, "*.Apps.Example.COM");
        push_name(&mut names, "*.apps.example.com");
        push_name(&mut names, "plainhost");
        assert_eq!(names, vec!["apps.example.com".to_string()]);
    }

    #[test]
    fn junk_der_yields_no_names() {
        assert!(names_from_der(&[0u8; 16]).is_empty());
    }
}
