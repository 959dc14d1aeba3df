use std::{path::Path, time::Duration as StdDuration};

use der::{
    asn1::{GeneralizedTime, UtcTime},
    DateTime, Encode as _,
};
use eyre::{ensure, eyre, WrapErr as _};
use p256::ecdsa::SigningKey;
use time::{Duration, OffsetDateTime};
use x509_cert::{
    builder::{Builder as _, CertificateBuilder, Profile},
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::{Time, Validity},
    Certificate,
};

use crate::cert::{create_p256_key, load_signing_key, parse_pem_certificates, spki_of, to_pem};

/// CA certificates are valid for 30 years.
const CA_VALIDITY: Duration = Duration::days(30 * 365);

/// A CA certificate in the three encodings it is handed out in.
#[derive(Debug, Clone)]
pub(crate) struct CaCertificate {
    pub cert: Certificate,
    pub der: Vec<u8>,
    pub pem: String,
}

impl CaCertificate {
    fn new(cert: Certificate) -> eyre::Result<Self> {
        Ok(CaCertificate {
            der: cert.to_der().context("encode CA certificate")?,
            pem: to_pem(&cert)?,
            cert,
        })
    }
}

/// One trust path from the leaf issuer up to a root.
#[derive(Debug, Clone)]
pub(crate) struct Chain {
    pub root: CaCertificate,

    /// Leaf side first; the first entry always certifies the shared leaf-issuing key.
    pub intermediates: Vec<CaCertificate>,
}

/// Key and name every leaf certificate is issued under.
pub(crate) struct LeafIssuer {
    pub key: SigningKey,
    pub name: Name,
}

/// Generates `alternate_roots + 1` independent chains of `chain_length` intermediates each.
///
/// All chains end in a certificate for the same leaf-issuing key and subject, so one leaf
/// certificate validates under every root.
pub(crate) fn generate(
    alternate_roots: usize,
    chain_length: usize,
) -> eyre::Result<(LeafIssuer, Vec<Chain>)> {
    ensure!(chain_length >= 1, "chain length must be at least 1");

    let issuer = LeafIssuer {
        key: create_p256_key(),
        name: ca_name("intermediate")?,
    };
    let issuer_spki = spki_of(issuer.key.verifying_key())?;

    let now = OffsetDateTime::now_utc();

    let chains = (0..=alternate_roots)
        .map(|idx| {
            let root_key = create_p256_key();
            let root_name = ca_name("root")?;
            let root = sign_ca(
                Profile::Root,
                root_name.clone(),
                spki_of(root_key.verifying_key())?,
                &root_key,
                now,
            )?;

            let mut intermediates = Vec::with_capacity(chain_length);
            let mut signer_key = root_key;
            let mut signer_name = root_name;

            for _ in 1..chain_length {
                let key = create_p256_key();
                let name = ca_name("intermediate")?;

                let cert = sign_ca(
                    Profile::SubCA {
                        issuer: signer_name,
                        path_len_constraint: None,
                    },
                    name.clone(),
                    spki_of(key.verifying_key())?,
                    &signer_key,
                    now,
                )?;

                intermediates.push(cert);
                signer_key = key;
                signer_name = name;
            }

            intermediates.push(sign_ca(
                Profile::SubCA {
                    issuer: signer_name,
                    path_len_constraint: Some(0),
                },
                issuer.name.clone(),
                issuer_spki.clone(),
                &signer_key,
                now,
            )?);

            intermediates.reverse();

            log::debug!(
                "generated chain {idx} with {} intermediate(s)",
                intermediates.len()
            );

            Ok(Chain {
                root: CaCertificate::new(root)?,
                intermediates: intermediates
                    .into_iter()
                    .map(CaCertificate::new)
                    .collect::<eyre::Result<_>>()?,
            })
        })
        .collect::<eyre::Result<Vec<_>>>()?;

    Ok((issuer, chains))
}

/// Key and certificate files of an externally managed CA.
#[derive(Debug, Clone)]
pub struct ExternalCa<'a> {
    pub root_cert: &'a Path,
    pub root_key: &'a Path,
    pub root_password: Option<&'a str>,
    pub intermediate_cert: &'a Path,
    pub intermediate_key: &'a Path,
    pub intermediate_password: Option<&'a str>,
}

/// Loads a single chain from an externally supplied root and intermediate.
pub(crate) fn load(external: &ExternalCa<'_>) -> eyre::Result<(LeafIssuer, Vec<Chain>)> {
    let (root, _root_key) = load_pair(
        external.root_cert,
        external.root_key,
        external.root_password,
    )?;
    let (intermediate, key) = load_pair(
        external.intermediate_cert,
        external.intermediate_key,
        external.intermediate_password,
    )?;

    ensure!(
        intermediate.tbs_certificate.issuer == root.tbs_certificate.subject,
        "intermediate certificate is not issued by the root certificate"
    );

    let issuer = LeafIssuer {
        key,
        name: intermediate.tbs_certificate.subject.clone(),
    };

    let chain = Chain {
        root: CaCertificate::new(root)?,
        intermediates: vec![CaCertificate::new(intermediate)?],
    };

    Ok((issuer, vec![chain]))
}

fn load_pair(
    cert_path: &Path,
    key_path: &Path,
    password: Option<&str>,
) -> eyre::Result<(Certificate, SigningKey)> {
    let cert_pem = std::fs::read_to_string(cert_path)
        .wrap_err_with(|| format!("read certificate {}", cert_path.display()))?;
    let key_pem = std::fs::read_to_string(key_path)
        .wrap_err_with(|| format!("read private key {}", key_path.display()))?;

    let cert = parse_pem_certificates(&cert_pem)?
        .into_iter()
        .next()
        .ok_or_else(|| eyre!("no certificate in {}", cert_path.display()))?;

    let key = load_signing_key(&key_pem, password)
        .wrap_err_with(|| format!("load private key {}", key_path.display()))?;

    ensure!(
        spki_of(key.verifying_key())? == cert.tbs_certificate.subject_public_key_info,
        "private key {} does not match certificate {}",
        key_path.display(),
        cert_path.display(),
    );

    Ok((cert, key))
}

fn ca_name(kind: &str) -> eyre::Result<Name> {
    let suffix = rand::random::<u32>() & 0x00ff_ffff;

    format!("CN=acme-testsrv {kind} {suffix:06x}")
        .parse::<Name>()
        .context("build CA name")
}

fn sign_ca(
    profile: Profile,
    subject: Name,
    spki: SubjectPublicKeyInfoOwned,
    signer: &SigningKey,
    now: OffsetDateTime,
) -> eyre::Result<Certificate> {
    let builder = CertificateBuilder::new(
        profile,
        random_serial()?,
        validity(now, now + CA_VALIDITY)?,
        subject,
        spki,
        signer,
    )
    .context("prepare CA certificate")?;

    builder
        .build::<p256::ecdsa::DerSignature>()
        .context("sign CA certificate")
}

/// 16 random bytes, positive and without a leading zero byte.
pub(crate) fn random_serial() -> eyre::Result<SerialNumber> {
    use rand::Rng as _;

    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes[0] = bytes[0] % 0x7e + 1;

    SerialNumber::new(&bytes).context("encode serial number")
}

pub(crate) fn validity(
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> eyre::Result<Validity> {
    Ok(Validity {
        not_before: asn1_time(not_before)?,
        not_after: asn1_time(not_after)?,
    })
}

/// UTCTime through 2049, GeneralizedTime from 2050 on.
fn asn1_time(ts: OffsetDateTime) -> eyre::Result<Time> {
    let secs = u64::try_from(ts.unix_timestamp()).context("timestamp before 1970")?;
    let dt = DateTime::from_unix_duration(StdDuration::from_secs(secs))
        .context("timestamp out of range")?;

    Ok(if dt.year() < 2050 {
        Time::UtcTime(UtcTime::from_date_time(dt).context("encode UTCTime")?)
    } else {
        Time::GeneralTime(GeneralizedTime::from_date_time(dt))
    })
}
