//! # Request Identity Extraction
//!
//! Derives the `(device_id, sender_id)` pair for a connection from one of
//! three mutually exclusive mTLS sources, selected by configuration:
//!
//! 1. **Direct TLS**: the certificate chain presented on the terminated TLS
//!    session itself.
//! 2. **RFC 9440 pass-through**: the `Client-Cert-Chain` header set by a
//!    TLS-terminating proxy (base64 of a PEM block).
//! 3. **AWS ALB pass-through**: the `X-Amzn-Mtls-Clientcert` header set by
//!    an Application Load Balancer (URL-escaped PEM).
//!
//! The extraction runs before the WebSocket upgrade is attempted, so an
//! unauthenticated peer never completes an upgrade. Extraction is a pure
//! function of the request: calling it twice yields equal identities.

use base64::{engine::general_purpose, Engine as _};
use http::HeaderMap;
use percent_encoding::percent_decode;
use rustls_pki_types::CertificateDer;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Header carrying the client certificate chain in RFC 9440 deployments.
pub const CLIENT_CERT_CHAIN_HEADER: &str = "client-cert-chain";

/// Header carrying the client certificate behind an AWS Application Load
/// Balancer in mTLS pass-through mode.
pub const AWS_ALB_CERT_HEADER: &str = "x-amzn-mtls-clientcert";

/// Identity-extraction mode, from the `tls_pass_through` configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPassThrough {
    /// No pass-through: read the peer chain of the terminated TLS session.
    #[default]
    Disabled,
    /// RFC 9440 `Client-Cert-Chain` header.
    Rfc9440,
    /// AWS ALB `X-Amzn-Mtls-Clientcert` header.
    AwsAlb,
}

impl std::str::FromStr for TlsPassThrough {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::Disabled),
            "RFC9440" => Ok(Self::Rfc9440),
            "AWSApplicationLoadBalancer" => Ok(Self::AwsAlb),
            other => Err(format!("unknown tls_pass_through mode: {other}")),
        }
    }
}

/// Which end of the peer chain direct-TLS extraction reads.
///
/// Some stacks present the leaf first, some last; the default preserves the
/// observed leaf-last behavior and the knob makes the asymmetry explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectCertOrder {
    /// Use the last certificate in the presented chain (default).
    #[default]
    Last,
    /// Use the first certificate in the presented chain.
    First,
}

impl std::str::FromStr for DirectCertOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last" => Ok(Self::Last),
            "first" => Ok(Self::First),
            other => Err(format!("unknown direct_cert_order: {other}")),
        }
    }
}

/// Identity extraction failures. Both abort the request before any upgrade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// No certificate material was presented (empty peer chain, or the
    /// configured pass-through header is absent).
    #[error("missing certificate")]
    MissingCertificate,
    /// Certificate material was presented but could not be decoded.
    #[error("cannot parse certificate: {0}")]
    ParseCertificate(String),
}

/// The authenticated identity of a connection, derived from its client
/// certificate. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Subject common-name of the certificate (a VIN for vehicle devices).
    pub device_id: String,
    /// `<client_type>.<device_id>`, where the client type derives from the
    /// certificate issuer common-name.
    pub sender_id: String,
}

impl RequestIdentity {
    fn from_der(der: &[u8]) -> Result<Self, IdentityError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| IdentityError::ParseCertificate(e.to_string()))?;

        let device_id = common_name(cert.subject())
            .ok_or_else(|| IdentityError::ParseCertificate("subject has no common name".into()))?;
        let issuer_cn = common_name(cert.issuer())
            .ok_or_else(|| IdentityError::ParseCertificate("issuer has no common name".into()))?;

        let client_type = client_type_from_issuer(&issuer_cn);
        Ok(Self {
            sender_id: format!("{client_type}.{device_id}"),
            device_id,
        })
    }
}

/// Maps the certificate issuer common-name to the client type used in
/// `sender_id`. The mapping is defined by the fleet's PKI layout; issuing
/// CAs are named after the device class they sign for, so the CN is used
/// verbatim.
fn client_type_from_issuer(issuer_cn: &str) -> String {
    issuer_cn.to_string()
}

fn common_name(name: &x509_parser::x509::X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

/// Derive the request identity for an inbound connection.
///
/// `peer_certs` is the chain from the terminated TLS session (present only
/// when this process terminates TLS itself); `headers` are the request
/// headers. Exactly one source is consulted, per `mode`.
pub fn extract_identity(
    mode: TlsPassThrough,
    headers: &HeaderMap,
    peer_certs: Option<&[CertificateDer<'static>]>,
    order: DirectCertOrder,
) -> Result<RequestIdentity, IdentityError> {
    match mode {
        TlsPassThrough::Disabled => extract_from_tls(peer_certs, order),
        TlsPassThrough::Rfc9440 => extract_from_rfc9440(headers),
        TlsPassThrough::AwsAlb => extract_from_aws_alb(headers),
    }
}

fn extract_from_tls(
    peer_certs: Option<&[CertificateDer<'static>]>,
    order: DirectCertOrder,
) -> Result<RequestIdentity, IdentityError> {
    let chain = peer_certs.filter(|c| !c.is_empty()).ok_or(IdentityError::MissingCertificate)?;
    let cert = match order {
        DirectCertOrder::Last => chain.last(),
        DirectCertOrder::First => chain.first(),
    };
    // The chain was checked non-empty above.
    let cert = cert.ok_or(IdentityError::MissingCertificate)?;
    RequestIdentity::from_der(cert.as_ref())
}

fn extract_from_rfc9440(headers: &HeaderMap) -> Result<RequestIdentity, IdentityError> {
    let value = headers
        .get(CLIENT_CERT_CHAIN_HEADER)
        .ok_or(IdentityError::MissingCertificate)?;

    let pem_bytes = general_purpose::STANDARD
        .decode(value.as_bytes())
        .map_err(|e| IdentityError::ParseCertificate(format!("invalid base64: {e}")))?;

    der_from_pem(&pem_bytes)
}

fn extract_from_aws_alb(headers: &HeaderMap) -> Result<RequestIdentity, IdentityError> {
    let value = headers
        .get(AWS_ALB_CERT_HEADER)
        .ok_or(IdentityError::MissingCertificate)?;

    let pem_bytes: Vec<u8> = percent_decode(value.as_bytes()).collect();
    der_from_pem(&pem_bytes)
}

/// Parse the first PEM block and hand its DER contents to the certificate
/// parser. Multi-cert chains use the first block only (the leaf as sent).
fn der_from_pem(pem_bytes: &[u8]) -> Result<RequestIdentity, IdentityError> {
    let (_, pem) = parse_x509_pem(pem_bytes)
        .map_err(|e| IdentityError::ParseCertificate(format!("invalid PEM: {e}")))?;
    RequestIdentity::from_der(&pem.contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

    /// A leaf certificate with subject CN "VIN123" signed by a CA whose CN
    /// is "vehicle_device", mirroring the fleet PKI layout.
    fn issued_cert() -> rcgen::Certificate {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
        let mut ca_dn = DistinguishedName::new();
        ca_dn.push(DnType::CommonName, "vehicle_device");
        ca_params.distinguished_name = ca_dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(Vec::new()).unwrap();
        let mut leaf_dn = DistinguishedName::new();
        leaf_dn.push(DnType::CommonName, "VIN123");
        leaf_params.distinguished_name = leaf_dn;
        leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap()
    }

    #[test]
    fn direct_tls_uses_last_certificate_by_default() {
        let cert = issued_cert();
        let chain = vec![cert.der().clone()];

        let identity = extract_identity(
            TlsPassThrough::Disabled,
            &HeaderMap::new(),
            Some(&chain),
            DirectCertOrder::default(),
        )
        .unwrap();

        assert_eq!(identity.device_id, "VIN123");
        assert_eq!(identity.sender_id, "vehicle_device.VIN123");
    }

    #[test]
    fn direct_tls_empty_chain_is_missing_certificate() {
        let err = extract_identity(
            TlsPassThrough::Disabled,
            &HeaderMap::new(),
            Some(&[]),
            DirectCertOrder::default(),
        )
        .unwrap_err();
        assert_eq!(err, IdentityError::MissingCertificate);

        let err = extract_identity(
            TlsPassThrough::Disabled,
            &HeaderMap::new(),
            None,
            DirectCertOrder::default(),
        )
        .unwrap_err();
        assert_eq!(err, IdentityError::MissingCertificate);
    }

    #[test]
    fn rfc9440_header_round_trips_identity() {
        let cert = issued_cert();
        let encoded = base64::engine::general_purpose::STANDARD.encode(cert.pem());

        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_CERT_CHAIN_HEADER, HeaderValue::from_str(&encoded).unwrap());

        let identity = extract_identity(
            TlsPassThrough::Rfc9440,
            &headers,
            None,
            DirectCertOrder::default(),
        )
        .unwrap();
        assert_eq!(identity.sender_id, "vehicle_device.VIN123");
    }

    #[test]
    fn rfc9440_missing_header_is_missing_certificate() {
        let err = extract_identity(
            TlsPassThrough::Rfc9440,
            &HeaderMap::new(),
            None,
            DirectCertOrder::default(),
        )
        .unwrap_err();
        assert_eq!(err, IdentityError::MissingCertificate);
    }

    #[test]
    fn rfc9440_malformed_base64_is_parse_certificate() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_CERT_CHAIN_HEADER, HeaderValue::from_static("%%not-base64%%"));

        let err = extract_identity(
            TlsPassThrough::Rfc9440,
            &headers,
            None,
            DirectCertOrder::default(),
        )
        .unwrap_err();
        assert!(matches!(err, IdentityError::ParseCertificate(_)));
    }

    #[test]
    fn aws_alb_url_escaped_pem_matches_direct_tls() {
        let cert = issued_cert();
        let escaped = utf8_percent_encode(&cert.pem(), NON_ALPHANUMERIC).to_string();

        let mut headers = HeaderMap::new();
        headers.insert(AWS_ALB_CERT_HEADER, HeaderValue::from_str(&escaped).unwrap());

        let from_header = extract_identity(
            TlsPassThrough::AwsAlb,
            &headers,
            None,
            DirectCertOrder::default(),
        )
        .unwrap();

        let chain = vec![cert.der().clone()];
        let from_tls = extract_identity(
            TlsPassThrough::Disabled,
            &HeaderMap::new(),
            Some(&chain),
            DirectCertOrder::default(),
        )
        .unwrap();

        assert_eq!(from_header, from_tls);
    }

    #[test]
    fn extraction_is_idempotent() {
        let cert = issued_cert();
        let chain = vec![cert.der().clone()];

        let first = extract_identity(
            TlsPassThrough::Disabled,
            &HeaderMap::new(),
            Some(&chain),
            DirectCertOrder::default(),
        )
        .unwrap();
        let second = extract_identity(
            TlsPassThrough::Disabled,
            &HeaderMap::new(),
            Some(&chain),
            DirectCertOrder::default(),
        )
        .unwrap();
        assert_eq!(first, second);
    }
}
