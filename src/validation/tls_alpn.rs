//! TLS-ALPN-01, see [RFC 8737](https://datatracker.ietf.org/doc/html/rfc8737).

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use der::{
    asn1::OctetString,
    oid::{AssociatedOid as _, ObjectIdentifier},
    Decode as _, Encode as _,
};
use p256::{
    ecdsa::{signature::Verifier as _, Signature, VerifyingKey},
    pkcs8::DecodePublicKey as _,
};
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
        pki_types::{CertificateDer, ServerName, UnixTime},
        CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme,
    },
    TlsConnector,
};
use x509_cert::ext::pkix::{name::GeneralName, SubjectAltName};

use super::{error_chain, key_authorization_digest, ValidationError};
use crate::api::Identifier;

pub(crate) const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// `id-pe-acmeIdentifier`
pub(crate) const ID_PE_ACME_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.31");

pub(super) fn client_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let mut config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptSelfSigned { provider }))
        .with_no_client_auth();

    config.alpn_protocols = vec![ACME_TLS_ALPN.to_vec()];

    Ok(Arc::new(config))
}

/// Accepts any certificate; validation inspects it after the handshake.
///
/// Handshake signatures are still checked. P-256 signatures are verified here directly since the
/// critical acmeIdentifier extension makes webpki refuse to parse the certificate.
#[derive(Debug)]
struct AcceptSelfSigned {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptSelfSigned {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        if dss.scheme == SignatureScheme::ECDSA_NISTP256_SHA256 {
            return verify_p256_signature(message, cert, dss.signature());
        }

        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        if dss.scheme == SignatureScheme::ECDSA_NISTP256_SHA256 {
            return verify_p256_signature(message, cert, dss.signature());
        }

        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn verify_p256_signature(
    message: &[u8],
    cert: &CertificateDer<'_>,
    signature: &[u8],
) -> Result<HandshakeSignatureValid, rustls::Error> {
    let bad_encoding = || rustls::Error::InvalidCertificate(CertificateError::BadEncoding);

    let cert = x509_cert::Certificate::from_der(cert.as_ref()).map_err(|_| bad_encoding())?;
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|_| bad_encoding())?;
    let key = VerifyingKey::from_public_key_der(&spki).map_err(|_| bad_encoding())?;

    let signature = Signature::from_der(signature)
        .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadSignature))?;

    key.verify(message, &signature)
        .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadSignature))?;

    Ok(HandshakeSignatureValid::assertion())
}

/// SNI name for an identifier; IP addresses use their reverse-DNS name ([RFC 8738 §6]).
///
/// [RFC 8738 §6]: https://datatracker.ietf.org/doc/html/rfc8738#section-6
fn server_name(identifier: &Identifier) -> Result<ServerName<'static>, ValidationError> {
    let name = match identifier.ip_addr() {
        Some(IpAddr::V4(addr)) => {
            let [a, b, c, d] = addr.octets();
            format!("{d}.{c}.{b}.{a}.in-addr.arpa")
        }
        Some(IpAddr::V6(addr)) => {
            let mut name = addr
                .octets()
                .iter()
                .rev()
                .map(|byte| format!("{:x}.{:x}.", byte & 0x0f, byte >> 4))
                .collect::<String>();
            name.push_str("ip6.arpa");
            name
        }
        None => identifier.value.clone(),
    };

    ServerName::try_from(name)
        .map_err(|err| ValidationError::Tls(format!("invalid SNI name: {err}")))
}

pub(super) async fn validate(
    config: Arc<ClientConfig>,
    addrs: &[SocketAddr],
    identifier: &Identifier,
    key_authorization: &str,
) -> Result<(), ValidationError> {
    let sni = server_name(identifier)?;

    let mut last_err = None;
    let mut stream = None;

    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(conn) => {
                stream = Some(conn);
                break;
            }
            Err(err) => last_err = Some(format!("connecting to {addr}: {err}")),
        }
    }

    let stream = stream.ok_or_else(|| {
        ValidationError::Connection(last_err.unwrap_or_else(|| {
            format!("no address to connect to for {}", identifier.value)
        }))
    })?;

    let tls = TlsConnector::from(config)
        .connect(sni, stream)
        .await
        .map_err(|err| {
            ValidationError::Tls(format!("TLS handshake failed: {}", error_chain(&err)))
        })?;

    let (_, conn) = tls.get_ref();

    if conn.alpn_protocol() != Some(ACME_TLS_ALPN) {
        return Err(ValidationError::Tls(
            "server did not negotiate the acme-tls/1 protocol".to_owned(),
        ));
    }

    let cert = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| ValidationError::Tls("server presented no certificate".to_owned()))?;

    check_certificate(cert.as_ref(), identifier, key_authorization)
}

/// Checks the presented certificate names only the identifier and proves the key authorization.
pub(crate) fn check_certificate(
    der: &[u8],
    identifier: &Identifier,
    key_authorization: &str,
) -> Result<(), ValidationError> {
    let cert = x509_cert::Certificate::from_der(der).map_err(|err| {
        ValidationError::IncorrectResponse(format!("cannot parse presented certificate: {err}"))
    })?;

    let extensions = cert
        .tbs_certificate
        .extensions
        .as_deref()
        .unwrap_or_default();

    let san = extensions
        .iter()
        .find(|ext| ext.extn_id == SubjectAltName::OID)
        .ok_or_else(|| {
            ValidationError::Unauthorized(
                "presented certificate has no subjectAltName extension".to_owned(),
            )
        })?;

    let san = SubjectAltName::from_der(san.extn_value.as_bytes()).map_err(|err| {
        ValidationError::IncorrectResponse(format!("cannot parse subjectAltName: {err}"))
    })?;

    let names_identifier = match san.0.as_slice() {
        [GeneralName::DnsName(name)] => {
            identifier.is_type_dns() && name.to_string().eq_ignore_ascii_case(&identifier.value)
        }
        [GeneralName::IpAddress(octets)] => identifier.ip_addr().is_some_and(|addr| {
            let expected = match addr {
                IpAddr::V4(addr) => addr.octets().to_vec(),
                IpAddr::V6(addr) => addr.octets().to_vec(),
            };
            octets.as_bytes() == expected.as_slice()
        }),
        _ => false,
    };

    if !names_identifier {
        return Err(ValidationError::Unauthorized(format!(
            "presented certificate must name exactly {:?} in its subjectAltName",
            identifier.value
        )));
    }

    let acme_ext = extensions
        .iter()
        .find(|ext| ext.extn_id == ID_PE_ACME_IDENTIFIER)
        .ok_or_else(|| {
            ValidationError::Unauthorized(
                "presented certificate has no acmeIdentifier extension".to_owned(),
            )
        })?;

    if !acme_ext.critical {
        return Err(ValidationError::Unauthorized(
            "acmeIdentifier extension is not marked critical".to_owned(),
        ));
    }

    let digest = OctetString::from_der(acme_ext.extn_value.as_bytes()).map_err(|err| {
        ValidationError::IncorrectResponse(format!("malformed acmeIdentifier extension: {err}"))
    })?;

    if digest.as_bytes() != key_authorization_digest(key_authorization) {
        return Err(ValidationError::Unauthorized(
            "acmeIdentifier extension does not match the expected key authorization".to_owned(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{acme_tls_certificate, spawn_tls_alpn_responder};

    #[test]
    fn reverse_dns_sni_names() {
        let name = server_name(&Identifier::ip("192.0.2.5".parse().unwrap())).unwrap();
        assert_eq!(name.to_str(), "5.2.0.192.in-addr.arpa");

        let name = server_name(&Identifier::ip("2001:db8::1".parse().unwrap())).unwrap();
        assert!(name.to_str().starts_with("1.0.0.0.0.0.0.0."));
        assert!(name.to_str().ends_with(".8.b.d.0.1.0.0.2.ip6.arpa"));
    }

    #[test]
    fn certificate_checks() {
        let identifier = Identifier::dns("example.test");

        let good = acme_tls_certificate("example.test", "tok.thumb", true).0;
        check_certificate(&good, &identifier, "tok.thumb").unwrap();

        let wrong_name = acme_tls_certificate("other.test", "tok.thumb", true).0;
        assert!(matches!(
            check_certificate(&wrong_name, &identifier, "tok.thumb"),
            Err(ValidationError::Unauthorized(_))
        ));

        let wrong_digest = acme_tls_certificate("example.test", "tok.other", true).0;
        assert!(matches!(
            check_certificate(&wrong_digest, &identifier, "tok.thumb"),
            Err(ValidationError::Unauthorized(_))
        ));

        let missing = acme_tls_certificate("example.test", "tok.thumb", false).0;
        assert!(matches!(
            check_certificate(&missing, &identifier, "tok.thumb"),
            Err(ValidationError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn handshake_with_responder() {
        let responder = spawn_tls_alpn_responder("localhost", "tok.thumb").await;
        let addrs = [SocketAddr::from(([127, 0, 0, 1], responder.port))];

        let config = client_config().unwrap();
        let identifier = Identifier::dns("localhost");

        validate(Arc::clone(&config), &addrs, &identifier, "tok.thumb")
            .await
            .unwrap();

        let err = validate(config, &addrs, &identifier, "tok.other")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Unauthorized(_)), "{err:?}");
    }
}
