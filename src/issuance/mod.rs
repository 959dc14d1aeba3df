//! Certificate issuance.
//!
//! A [`CertificateAuthority`] holds one or more trust chains that all certify a single
//! leaf-issuing key. It signs leaf certificates for finalized orders, serves chains for download,
//! and tracks revocation status for OCSP-style queries.

use std::sync::Arc;

use der::{asn1::Ia5String, oid::ObjectIdentifier, Encode as _};
use eyre::{ensure, eyre, WrapErr as _};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use x509_cert::{
    builder::{Builder as _, CertificateBuilder, Profile},
    ext::pkix::{
        name::GeneralName, AccessDescription, AuthorityInfoAccessSyntax, ExtendedKeyUsage,
    },
    name::Name,
    spki::SubjectPublicKeyInfoOwned,
};

use crate::{
    api::{Identifier, Problem, ProblemType, RevocationReason},
    cert::{chain_pem, subject_alt_name},
    store::{CertificateEntry, RevocationEntry, Store, StoreError},
    util::{hex, rfc3339},
};

mod chain;

use self::chain::{Chain, LeafIssuer};
pub use self::chain::ExternalCa;

const ID_AD_OCSP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1");
const ID_KP_SERVER_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");
const ID_KP_CLIENT_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2");

/// Attempts at drawing a serial number not yet used by another certificate.
const SERIAL_ATTEMPTS: usize = 8;

/// Issuance settings fixed at startup.
#[derive(Debug, Clone)]
pub struct IssuanceConfig {
    /// Number of chains offered besides the default one.
    pub alternate_roots: usize,

    /// Number of intermediates between a root and the leaf.
    pub chain_length: usize,

    /// Lifetime of issued leaf certificates.
    pub validity: Duration,

    /// Advertised in the leaf's Authority Information Access extension.
    pub ocsp_responder_url: Option<String>,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        IssuanceConfig {
            alternate_roots: 0,
            chain_length: 1,
            validity: Duration::seconds(157_766_400),
            ocsp_responder_url: None,
        }
    }
}

/// What the CA needs to know to sign a leaf.
#[derive(Debug, Clone)]
pub struct IssueRequest<'a> {
    pub account_id: &'a str,
    pub order_id: &'a str,

    /// Names to certify, in order; the first non-wildcard fitting name becomes the CN.
    pub identifiers: &'a [Identifier],

    pub public_key: SubjectPublicKeyInfoOwned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RevocationStatus {
    Good,
    Revoked,
}

/// OCSP-equivalent status of one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    pub serial: String,
    pub status: RevocationStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RevocationReason>,

    pub this_update: String,
    pub not_before: String,
    pub not_after: String,
}

pub struct CertificateAuthority {
    store: Arc<Store>,
    issuer: LeafIssuer,
    chains: Vec<Chain>,
    validity: Duration,
    ocsp_responder_url: Option<String>,
}

impl CertificateAuthority {
    /// Creates a CA with freshly generated roots and intermediates.
    pub fn generate(store: Arc<Store>, config: &IssuanceConfig) -> eyre::Result<Self> {
        let (issuer, chains) = chain::generate(config.alternate_roots, config.chain_length)?;

        log::info!(
            "generated {} chain(s) of {} intermediate(s)",
            chains.len(),
            config.chain_length
        );

        Self::with_chains(store, config, issuer, chains)
    }

    /// Creates a CA from an externally supplied root and intermediate.
    ///
    /// Only a single chain is served; alternate roots and chain length are ignored.
    pub fn load(
        store: Arc<Store>,
        config: &IssuanceConfig,
        external: &ExternalCa<'_>,
    ) -> eyre::Result<Self> {
        if config.alternate_roots > 0 || config.chain_length != 1 {
            log::warn!("external CA serves a single chain with one intermediate");
        }

        let (issuer, chains) = chain::load(external).context("load external CA")?;

        log::info!("loaded external CA {}", issuer.name);

        Self::with_chains(store, config, issuer, chains)
    }

    fn with_chains(
        store: Arc<Store>,
        config: &IssuanceConfig,
        issuer: LeafIssuer,
        chains: Vec<Chain>,
    ) -> eyre::Result<Self> {
        ensure!(
            config.validity > Duration::ZERO,
            "certificate validity must be positive"
        );

        Ok(CertificateAuthority {
            store,
            issuer,
            chains,
            validity: config.validity,
            ocsp_responder_url: config.ocsp_responder_url.clone(),
        })
    }

    /// Number of chains a certificate can be downloaded with.
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Root certificate of chain `index`, PEM.
    pub fn root_pem(&self, index: usize) -> Option<&str> {
        self.chains.get(index).map(|chain| chain.root.pem.as_str())
    }

    /// Leaf-issuing intermediate of chain `index`, PEM.
    pub fn intermediate_pem(&self, index: usize) -> Option<&str> {
        self.chains
            .get(index)
            .and_then(|chain| chain.intermediates.first())
            .map(|cert| cert.pem.as_str())
    }

    /// Signs a leaf certificate and stores it.
    ///
    /// Signing happens without touching the store; only the final insert takes its lock.
    pub fn issue(&self, request: IssueRequest<'_>) -> eyre::Result<CertificateEntry> {
        ensure!(
            !request.identifiers.is_empty(),
            "cannot issue a certificate without names"
        );

        let not_before = OffsetDateTime::now_utc().replace_nanosecond(0)?;
        let not_after = not_before + self.validity;

        let public_key = request
            .public_key
            .to_der()
            .context("encode leaf public key")?;

        for _ in 0..SERIAL_ATTEMPTS {
            let serial = chain::random_serial()?;
            let serial_hex = hex(serial.as_bytes());

            if self.store.certificate_by_serial(&serial_hex).is_some() {
                continue;
            }

            let cert = self.sign_leaf(&request, serial, not_before, not_after)?;

            let entry = CertificateEntry {
                id: self.store.generate_id(),
                account_id: request.account_id.to_owned(),
                order_id: request.order_id.to_owned(),
                der: cert.to_der().context("encode leaf certificate")?,
                serial: serial_hex,
                public_key: public_key.clone(),
                identifiers: request.identifiers.to_vec(),
                issued: not_before,
                expires: not_after,
                revocation: None,
            };

            match self.store.add_certificate(entry) {
                Ok(entry) => {
                    log::info!(
                        "issued certificate {} (serial {}) for {:?}",
                        entry.id,
                        entry.serial,
                        entry
                            .identifiers
                            .iter()
                            .map(|id| id.value.as_str())
                            .collect::<Vec<_>>(),
                    );
                    return Ok(entry);
                }
                Err(StoreError::AlreadyExists) => continue,
                Err(err) => return Err(eyre!(err)),
            }
        }

        Err(eyre!("could not allocate a unique serial number"))
    }

    fn sign_leaf(
        &self,
        request: &IssueRequest<'_>,
        serial: x509_cert::serial_number::SerialNumber,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> eyre::Result<x509_cert::Certificate> {
        let mut builder = CertificateBuilder::new(
            Profile::Leaf {
                issuer: self.issuer.name.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: false,
            },
            serial,
            chain::validity(not_before, not_after)?,
            leaf_subject(request.identifiers)?,
            request.public_key.clone(),
            &self.issuer.key,
        )
        .context("prepare leaf certificate")?;

        builder.add_extension(&subject_alt_name(request.identifiers)?)?;
        builder.add_extension(&ExtendedKeyUsage(vec![ID_KP_SERVER_AUTH, ID_KP_CLIENT_AUTH]))?;

        if let Some(url) = &self.ocsp_responder_url {
            builder.add_extension(&AuthorityInfoAccessSyntax(vec![AccessDescription {
                access_method: ID_AD_OCSP,
                access_location: GeneralName::UniformResourceIdentifier(Ia5String::new(url)?),
            }]))?;
        }

        builder
            .build::<p256::ecdsa::DerSignature>()
            .context("sign leaf certificate")
    }

    /// Leaf followed by the intermediates of chain `index`, PEM.
    pub fn certificate_chain(
        &self,
        cert: &CertificateEntry,
        index: usize,
    ) -> Result<String, Problem> {
        let chain = self.chains.get(index).ok_or_else(|| {
            Problem::not_found(format!("no certificate chain with index {index}"))
        })?;

        let certs = std::iter::once(cert.der.as_slice())
            .chain(chain.intermediates.iter().map(|ca| ca.der.as_slice()));

        chain_pem(certs).map_err(|err| Problem::server_internal(err.to_string()))
    }

    /// Marks a certificate revoked.
    ///
    /// Repeating a revocation with the same reason succeeds without touching the recorded
    /// revocation time; a different reason is rejected as `alreadyRevoked`.
    pub fn revoke(
        &self,
        cert_id: &str,
        reason: RevocationReason,
    ) -> Result<CertificateEntry, Problem> {
        let entry = self.store.update_certificate(cert_id, |cert| {
            match cert.revocation {
                Some(existing) if existing.reason == reason => {}
                Some(_) => {
                    return Err(Problem::new(
                        ProblemType::AlreadyRevoked,
                        "certificate has already been revoked",
                    ))
                }
                None => {
                    cert.revocation = Some(RevocationEntry {
                        reason,
                        revoked_at: OffsetDateTime::now_utc(),
                    });
                }
            }

            Ok(cert.clone())
        })?;

        log::info!(
            "revoked certificate {} (serial {}): {reason:?}",
            entry.id,
            entry.serial
        );

        Ok(entry)
    }

    /// Current revocation status for a serial number given in hex.
    pub fn status(&self, serial: &str) -> Option<CertificateStatus> {
        let cert = self
            .store
            .certificate_by_serial(&serial.to_ascii_lowercase())?;

        Some(CertificateStatus {
            status: match cert.revocation {
                Some(_) => RevocationStatus::Revoked,
                None => RevocationStatus::Good,
            },
            revoked_at: cert.revocation.map(|rev| rfc3339(rev.revoked_at)),
            reason: cert.revocation.map(|rev| rev.reason),
            this_update: rfc3339(OffsetDateTime::now_utc()),
            not_before: rfc3339(cert.issued),
            not_after: rfc3339(cert.expires),
            serial: cert.serial,
        })
    }
}

/// CN for the leaf: the first name short enough to fit, else an empty subject.
fn leaf_subject(identifiers: &[Identifier]) -> eyre::Result<Name> {
    let cn = identifiers
        .iter()
        .map(|id| id.value.as_str())
        .find(|value| value.len() <= 64);

    match cn {
        Some(cn) => format!("CN={cn}").parse::<Name>().context("build leaf subject"),
        None => Ok(Name::default()),
    }
}
