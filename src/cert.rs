use std::{
    collections::BTreeSet,
    io::{BufReader, Cursor},
    net::IpAddr,
};

use der::{
    oid::{AssociatedOid as _, ObjectIdentifier},
    pem::LineEnding,
    Decode as _, Encode as _, EncodePem as _,
};
use eyre::{eyre, WrapErr as _};
use p256::{
    ecdsa::{signature::Verifier as _, Signature, SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey as _, DecodePublicKey as _},
};
use x509_cert::{
    ext::{pkix::SubjectAltName, Extension},
    request::CertReq,
    spki::SubjectPublicKeyInfoOwned,
};
use zeroize::Zeroizing;

use crate::api::{Identifier, Problem, ProblemType};

const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Creates a CSR for `identifiers` and signs it with `signer`.
///
/// The first identifier is picked for the CSR's Common Name (CN). All of them are added to a
/// Subject Alternative Name (SAN) extension.
#[cfg(test)]
pub(crate) fn create_csr(
    signer: &SigningKey,
    identifiers: &[Identifier],
) -> eyre::Result<CertReq> {
    use x509_cert::{builder::Builder as _, builder::RequestBuilder, name::Name};

    let primary = identifiers
        .first()
        .ok_or_else(|| eyre!("at least one identifier is required"))?;
    let subject = format!("CN={}", primary.value).parse::<Name>()?;

    let mut csr = RequestBuilder::new(subject, signer)?;
    csr.add_extension(&subject_alt_name(identifiers)?)?;

    csr.build::<p256::ecdsa::DerSignature>()
        .context("build csr")
}

/// Builds a SAN extension value carrying every identifier.
pub(crate) fn subject_alt_name(identifiers: &[Identifier]) -> eyre::Result<SubjectAltName> {
    use der::asn1::{Ia5String, OctetString};
    use x509_cert::ext::pkix::name::GeneralName;

    let names = identifiers
        .iter()
        .map(|identifier| match identifier.ip_addr() {
            Some(IpAddr::V4(addr)) => Ok(GeneralName::IpAddress(OctetString::new(
                addr.octets().to_vec(),
            )?)),
            Some(IpAddr::V6(addr)) => Ok(GeneralName::IpAddress(OctetString::new(
                addr.octets().to_vec(),
            )?)),
            None => Ok(GeneralName::DnsName(Ia5String::new(&identifier.value)?)),
        })
        .collect::<Result<Vec<_>, der::Error>>()?;

    Ok(SubjectAltName(names))
}

/// A certificate signing request whose self-signature checked out.
#[derive(Debug, Clone)]
pub struct VerifiedCsr {
    pub public_key: VerifyingKey,
    pub spki: SubjectPublicKeyInfoOwned,

    /// Requested names, deduplicated; DNS names lowercased.
    pub identifiers: BTreeSet<Identifier>,
}

/// Parses a DER CSR, verifies its signature and collects the names it requests.
///
/// Only ECDSA P-256 keys signing with SHA-256 are accepted.
pub fn verify_csr(der: &[u8]) -> Result<VerifiedCsr, Problem> {
    let bad_csr = |detail: String| Problem::new(ProblemType::BadCsr, detail);

    let csr = CertReq::from_der(der).map_err(|err| bad_csr(format!("cannot parse CSR: {err}")))?;

    if csr.algorithm.oid != ECDSA_WITH_SHA256 {
        return Err(Problem::new(
            ProblemType::BadSignatureAlgorithm,
            format!("unsupported CSR signature algorithm: {}", csr.algorithm.oid),
        ));
    }

    let spki = csr.info.public_key.clone();
    let spki_der = spki
        .to_der()
        .map_err(|err| bad_csr(format!("cannot encode CSR public key: {err}")))?;
    let public_key = VerifyingKey::from_public_key_der(&spki_der)
        .map_err(|_| Problem::new(ProblemType::BadPublicKey, "CSR key is not an ECDSA P-256 key"))?;

    let signature = csr
        .signature
        .as_bytes()
        .and_then(|bytes| Signature::from_der(bytes).ok())
        .ok_or_else(|| bad_csr("CSR signature is not a DER ECDSA signature".to_owned()))?;

    let info = csr
        .info
        .to_der()
        .map_err(|err| bad_csr(format!("cannot encode CSR info: {err}")))?;

    public_key
        .verify(&info, &signature)
        .map_err(|_| bad_csr("CSR signature does not verify".to_owned()))?;

    let mut identifiers = BTreeSet::new();

    for rdn in csr.info.subject.0.iter() {
        for atv in rdn.0.iter().filter(|atv| atv.oid == COMMON_NAME) {
            let cn = std::str::from_utf8(atv.value.value())
                .map_err(|_| bad_csr("CSR common name is not UTF-8".to_owned()))?;
            identifiers.insert(identifier_from_name(cn));
        }
    }

    for attr in csr.info.attributes.iter() {
        if attr.oid != EXTENSION_REQUEST {
            continue;
        }

        for value in attr.values.iter() {
            let extensions = value
                .to_der()
                .and_then(|der| Vec::<Extension>::from_der(&der))
                .map_err(|err| bad_csr(format!("cannot parse requested extensions: {err}")))?;

            for ext in extensions.iter().filter(|ext| ext.extn_id == SubjectAltName::OID) {
                let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
                    .map_err(|err| bad_csr(format!("cannot parse CSR SAN: {err}")))?;

                for name in san.0 {
                    identifiers.insert(identifier_from_general_name(name).ok_or_else(|| {
                        bad_csr("CSR SAN contains an unsupported name type".to_owned())
                    })?);
                }
            }
        }
    }

    if identifiers.is_empty() {
        return Err(bad_csr("CSR does not request any names".to_owned()));
    }

    Ok(VerifiedCsr {
        public_key,
        spki,
        identifiers,
    })
}

fn identifier_from_name(name: &str) -> Identifier {
    match name.parse::<IpAddr>() {
        Ok(addr) => Identifier::ip(addr),
        Err(_) => Identifier::dns(&name.to_ascii_lowercase()),
    }
}

fn identifier_from_general_name(
    name: x509_cert::ext::pkix::name::GeneralName,
) -> Option<Identifier> {
    use x509_cert::ext::pkix::name::GeneralName;

    match name {
        GeneralName::DnsName(dns) => Some(Identifier::dns(&dns.to_string().to_ascii_lowercase())),
        GeneralName::IpAddress(octets) => {
            let bytes = octets.as_bytes();
            let addr = match bytes.len() {
                4 => IpAddr::from(<[u8; 4]>::try_from(bytes).ok()?),
                16 => IpAddr::from(<[u8; 16]>::try_from(bytes).ok()?),
                _ => return None,
            };
            Some(Identifier::ip(addr))
        }
        _ => None,
    }
}

/// Normalizes an identifier for comparison against CSR names.
pub(crate) fn normalize_identifier(identifier: &Identifier) -> Identifier {
    match identifier.ip_addr() {
        Some(addr) => Identifier::ip(addr),
        None => Identifier::dns(&identifier.value.to_ascii_lowercase()),
    }
}

/// PEM-encodes a single certificate.
pub(crate) fn to_pem(cert: &x509_cert::Certificate) -> eyre::Result<String> {
    cert.to_pem(LineEnding::LF).context("encode certificate as PEM")
}

/// PEM-encodes DER certificates back to back, in order.
pub(crate) fn chain_pem<'a>(certs: impl IntoIterator<Item = &'a [u8]>) -> eyre::Result<String> {
    certs
        .into_iter()
        .map(|der| {
            pem::encode_string("CERTIFICATE", pem::LineEnding::LF, der)
                .map_err(|err| eyre!("encode certificate as PEM: {err}"))
        })
        .collect()
}

/// Reads every certificate from a PEM bundle.
pub(crate) fn parse_pem_certificates(pem: &str) -> eyre::Result<Vec<x509_cert::Certificate>> {
    let mut rdr = BufReader::new(Cursor::new(pem));

    rustls_pemfile::certs(&mut rdr)
        .map(|res| {
            let der = res.context("read PEM certificate")?;
            x509_cert::Certificate::from_der(&der).context("parse certificate")
        })
        .collect()
}

/// Loads a P-256 private key from PEM.
///
/// Accepts PKCS#8, encrypted PKCS#8 when `password` is given, and SEC1 (`EC PRIVATE KEY`).
/// SEC1 keys encrypted the legacy OpenSSL way (`Proc-Type: 4,ENCRYPTED`) are decrypted too,
/// but only with `DES-EDE3-CBC`.
pub(crate) fn load_signing_key(pem: &str, password: Option<&str>) -> eyre::Result<SigningKey> {
    if pem.contains(LEGACY_ENCRYPTED_HEADER) {
        let password =
            password.ok_or_else(|| eyre!("private key is encrypted but no password was given"))?;
        let der = decrypt_legacy_pem(pem, password)?;
        let secret = p256::SecretKey::from_sec1_der(&der)
            .map_err(|_| eyre!("decrypt legacy PEM private key: wrong password or not P-256"))?;
        return Ok(SigningKey::from(secret));
    }

    if let Some(password) = password {
        return SigningKey::from_pkcs8_encrypted_pem(pem, password)
            .map_err(|err| eyre!("decrypt PKCS#8 private key: {err}"));
    }

    if let Ok(key) = SigningKey::from_pkcs8_pem(pem) {
        return Ok(key);
    }

    let secret = p256::SecretKey::from_sec1_pem(pem)
        .map_err(|err| eyre!("private key is neither PKCS#8 nor SEC1 P-256: {err}"))?;

    Ok(SigningKey::from(secret))
}

const LEGACY_ENCRYPTED_HEADER: &str = "Proc-Type: 4,ENCRYPTED";

/// Decrypts an RFC 1421 style PEM body (`DEK-Info: DES-EDE3-CBC,<iv>`) to DER.
///
/// The key is derived with OpenSSL's `EVP_BytesToKey` (MD5, one round, IV prefix as salt).
fn decrypt_legacy_pem(pem: &str, password: &str) -> eyre::Result<Zeroizing<Vec<u8>>> {
    use base64::prelude::*;
    use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut as _, KeyIvInit as _};
    use md5::{Digest as _, Md5};

    let mut dek_info = None;
    let mut body = String::new();

    for line in pem.lines().map(str::trim) {
        if line.starts_with("-----") || line.is_empty() || line.starts_with("Proc-Type:") {
            continue;
        }

        match line.strip_prefix("DEK-Info:") {
            Some(info) => dek_info = Some(info.trim()),
            None => body.push_str(line),
        }
    }

    let dek_info = dek_info.ok_or_else(|| eyre!("encrypted PEM has no DEK-Info header"))?;
    let (cipher, iv) = dek_info
        .split_once(',')
        .ok_or_else(|| eyre!("malformed DEK-Info header: {dek_info}"))?;

    if !cipher.eq_ignore_ascii_case("DES-EDE3-CBC") {
        eyre::bail!("unsupported PEM encryption {cipher}; only DES-EDE3-CBC is supported");
    }

    let iv = crate::util::hex_decode(iv.trim())
        .filter(|iv| iv.len() == 8)
        .ok_or_else(|| eyre!("malformed DEK-Info IV: {iv}"))?;

    let mut key = Zeroizing::new(Vec::with_capacity(32));
    let mut block = Vec::new();
    while key.len() < 24 {
        let mut md5 = Md5::new();
        md5.update(&block);
        md5.update(password.as_bytes());
        md5.update(&iv);
        block = md5.finalize().to_vec();
        key.extend_from_slice(&block);
    }

    let mut buf = Zeroizing::new(
        BASE64_STANDARD
            .decode(&body)
            .context("decode encrypted PEM body")?,
    );

    let decryptor = cbc::Decryptor::<des::TdesEde3>::new_from_slices(&key[..24], &iv)
        .map_err(|err| eyre!("initialize DES-EDE3-CBC: {err}"))?;
    let len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| eyre!("decrypt legacy PEM private key: wrong password"))?
        .len();
    buf.truncate(len);

    Ok(buf)
}

/// SubjectPublicKeyInfo of a P-256 verifying key.
pub(crate) fn spki_of(key: &VerifyingKey) -> eyre::Result<SubjectPublicKeyInfoOwned> {
    use p256::pkcs8::EncodePublicKey as _;

    let der = key.to_public_key_der().context("encode public key")?;
    SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).context("decode public key info")
}
