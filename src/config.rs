//! Server configuration file.
//!
//! The file is a JSON object with a single `acme` key; every field inside it is optional.
//!
//! ```json
//! {
//!   "acme": {
//!     "listenAddress": "0.0.0.0:14000",
//!     "managementListenAddress": "0.0.0.0:15000",
//!     "httpPort": 5002,
//!     "tlsPort": 5001,
//!     "externalAccountBindingRequired": false,
//!     "externalAccountMACKeys": {
//!       "kid-1": "zWNDZM6eQGHWpSRTPal5eIUYFTu7EajVIoguysqZ9wG44nMEtx3MUAsUDkMTQ12W"
//!     },
//!     "domainBlocklist": ["blocked.test"],
//!     "certificateValidityPeriod": 157766400
//!   }
//! }
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    path::Path,
};

use base64::prelude::*;
use eyre::{ensure, eyre, WrapErr as _};
use serde::Deserialize;

use crate::{
    api::ChallengeType, issuance::IssuanceConfig, protocol::ProtocolConfig, store::Store,
    validation::ValidationConfig,
};

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    acme: Config,
}

/// Settings read from the configuration file.
///
/// Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub listen_address: String,

    /// Management interface address; an empty string disables it.
    pub management_listen_address: String,

    pub http_port: u16,
    pub tls_port: u16,

    #[serde(rename = "ocspResponderURL")]
    pub ocsp_responder_url: Option<String>,

    pub external_account_binding_required: bool,

    /// Key ID to base64url-encoded MAC key.
    #[serde(rename = "externalAccountMACKeys")]
    pub external_account_mac_keys: BTreeMap<String, String>,

    pub domain_blocklist: Vec<String>,

    pub certificate_validity_period: u64,

    pub terms_of_service: Option<String>,

    pub order_lifetime: u64,
    pub pending_authorization_lifetime: u64,
    pub valid_authorization_lifetime: u64,
    pub reuse_valid_authorizations: bool,

    pub challenge_types: Vec<String>,

    pub validation_timeout: u64,
    pub max_validation_attempts: u32,
    pub validation_retry_backoff: u64,
    pub max_redirects: usize,
}

impl Default for Config {
    fn default() -> Self {
        let protocol = ProtocolConfig::default();
        let validation = ValidationConfig::default();

        Config {
            listen_address: "0.0.0.0:14000".to_owned(),
            management_listen_address: "0.0.0.0:15000".to_owned(),
            http_port: validation.http_port,
            tls_port: validation.tls_port,
            ocsp_responder_url: None,
            external_account_binding_required: false,
            external_account_mac_keys: BTreeMap::new(),
            domain_blocklist: Vec::new(),
            certificate_validity_period: IssuanceConfig::default().validity.whole_seconds()
                as u64,
            terms_of_service: protocol.terms_of_service,
            order_lifetime: protocol.order_lifetime.whole_seconds() as u64,
            pending_authorization_lifetime: protocol.pending_authz_lifetime.whole_seconds() as u64,
            valid_authorization_lifetime: protocol.valid_authz_lifetime.whole_seconds() as u64,
            reuse_valid_authorizations: protocol.reuse_valid_authz,
            challenge_types: ChallengeType::ALL
                .iter()
                .map(|kind| kind.as_str().to_owned())
                .collect(),
            validation_timeout: validation.attempt_timeout.as_secs(),
            max_validation_attempts: protocol.max_attempts,
            validation_retry_backoff: protocol.retry_backoff.whole_seconds() as u64,
            max_redirects: validation.max_redirects,
        }
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;

        Self::from_json(&json).with_context(|| format!("parse config file {}", path.display()))
    }

    pub fn from_json(json: &str) -> eyre::Result<Self> {
        let file = serde_json::from_str::<ConfigFile>(json)?;
        file.acme.validate()?;
        Ok(file.acme)
    }

    /// Rejects values the server cannot start with.
    pub fn validate(&self) -> eyre::Result<()> {
        let listen = self.listen_address()?;

        if let Some(addr) = self.management_address()? {
            ensure!(
                addr != listen,
                "management interface cannot share the listen address {addr}"
            );
        }

        ensure!(
            self.certificate_validity_period > 0,
            "certificate validity period must be positive"
        );
        ensure!(self.order_lifetime > 0, "order lifetime must be positive");
        ensure!(
            self.pending_authorization_lifetime > 0 && self.valid_authorization_lifetime > 0,
            "authorization lifetimes must be positive"
        );
        ensure!(self.validation_timeout > 0, "validation timeout must be positive");
        ensure!(
            self.max_validation_attempts > 0,
            "at least one validation attempt must be allowed"
        );

        let challenge_types = self.challenge_types()?;
        ensure!(
            !challenge_types.is_empty(),
            "at least one challenge type must be offered"
        );

        self.external_keys()?;

        Ok(())
    }

    pub fn listen_address(&self) -> eyre::Result<SocketAddr> {
        self.listen_address
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.listen_address))
    }

    /// Management interface address, `None` when disabled.
    pub fn management_address(&self) -> eyre::Result<Option<SocketAddr>> {
        if self.management_listen_address.is_empty() {
            return Ok(None);
        }

        self.management_listen_address
            .parse()
            .map(Some)
            .with_context(|| {
                format!(
                    "invalid management listen address {:?}",
                    self.management_listen_address
                )
            })
    }

    pub fn challenge_types(&self) -> eyre::Result<Vec<ChallengeType>> {
        self.challenge_types
            .iter()
            .map(|name| name.parse::<ChallengeType>().map_err(|err| eyre!(err)))
            .collect()
    }

    /// Decoded external account MAC keys.
    pub fn external_keys(&self) -> eyre::Result<HashMap<String, Vec<u8>>> {
        self.external_account_mac_keys
            .iter()
            .map(|(kid, key)| -> eyre::Result<(String, Vec<u8>)> {
                let key = BASE64_URL_SAFE_NO_PAD
                    .decode(key.trim_end_matches('='))
                    .with_context(|| format!("MAC key for {kid:?} is not valid base64url"))?;

                ensure!(!key.is_empty(), "MAC key for {kid:?} is empty");

                Ok((kid.clone(), key))
            })
            .collect()
    }

    pub fn store(&self) -> eyre::Result<Store> {
        Ok(Store::new(
            self.external_keys()?,
            self.domain_blocklist.clone(),
        ))
    }

    pub fn protocol_config(&self, strict: bool) -> eyre::Result<ProtocolConfig> {
        Ok(ProtocolConfig {
            strict,
            external_account_required: self.external_account_binding_required,
            terms_of_service: self.terms_of_service.clone(),
            order_lifetime: seconds(self.order_lifetime),
            pending_authz_lifetime: seconds(self.pending_authorization_lifetime),
            valid_authz_lifetime: seconds(self.valid_authorization_lifetime),
            reuse_valid_authz: self.reuse_valid_authorizations,
            challenge_types: self.challenge_types()?,
            max_attempts: self.max_validation_attempts,
            retry_backoff: seconds(self.validation_retry_backoff),
        })
    }

    pub fn validation_config(
        &self,
        dns_server: Option<SocketAddr>,
        always_valid: bool,
    ) -> ValidationConfig {
        ValidationConfig {
            http_port: self.http_port,
            tls_port: self.tls_port,
            attempt_timeout: std::time::Duration::from_secs(self.validation_timeout),
            max_redirects: self.max_redirects,
            dns_server,
            always_valid,
        }
    }

    pub fn issuance_config(&self, alternate_roots: usize, chain_length: usize) -> IssuanceConfig {
        IssuanceConfig {
            alternate_roots,
            chain_length,
            validity: seconds(self.certificate_validity_period),
            ocsp_responder_url: self.ocsp_responder_url.clone(),
        }
    }
}

/// Reads the chain length setting leniently.
///
/// An absent or unparsable value keeps the default of one intermediate. Zero is accepted and
/// raised to one, since leaves are always signed by an intermediate.
pub fn chain_length(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return 1;
    };

    match raw.trim().parse::<usize>() {
        Ok(0) => {
            log::info!("chain length 0 requested, issuing under a single intermediate");
            1
        }
        Ok(len) => len,
        Err(err) => {
            log::warn!("ignoring chain length {raw:?}: {err}");
            1
        }
    }
}

fn seconds(secs: u64) -> time::Duration {
    time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.http_port, 5002);
        assert_eq!(config.tls_port, 5001);
        assert_eq!(config.certificate_validity_period, 157_766_400);

        let protocol = config.protocol_config(false).unwrap();
        assert_eq!(protocol.challenge_types, ChallengeType::ALL.to_vec());
        assert_eq!(protocol.max_attempts, 3);
    }

    #[test]
    fn reads_camel_case_fields() {
        let config = Config::from_json(
            r#"{
                "acme": {
                    "listenAddress": "127.0.0.1:14000",
                    "managementListenAddress": "",
                    "httpPort": 8080,
                    "ocspResponderURL": "http://ocsp.test",
                    "externalAccountBindingRequired": true,
                    "externalAccountMACKeys": { "kid-1": "c2VjcmV0LWtleQ" },
                    "domainBlocklist": ["blocked.test", "*.evil.test"],
                    "certificateValidityPeriod": 3600,
                    "challengeTypes": ["dns-01"]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.management_address().unwrap(), None);
        assert_eq!(config.http_port, 8080);

        let keys = config.external_keys().unwrap();
        assert_eq!(keys["kid-1"], b"secret-key");

        let store = config.store().unwrap();
        assert!(store.is_blocked("www.evil.test"));
        assert!(store.external_key("kid-1").is_some());

        let protocol = config.protocol_config(true).unwrap();
        assert!(protocol.strict);
        assert!(protocol.external_account_required);
        assert_eq!(protocol.challenge_types, vec![ChallengeType::Dns01]);

        let issuance = config.issuance_config(2, 1);
        assert_eq!(issuance.validity, time::Duration::hours(1));
        assert_eq!(issuance.ocsp_responder_url.as_deref(), Some("http://ocsp.test"));
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            r#"{ "acme": { "listenAddress": "nowhere" } }"#,
            r#"{ "acme": { "challengeTypes": ["tls-sni-01"] } }"#,
            r#"{ "acme": { "challengeTypes": [] } }"#,
            r#"{ "acme": { "externalAccountMACKeys": { "kid": "not base64!" } } }"#,
            r#"{ "acme": { "validationTimeout": 0 } }"#,
            r#"{ "acme": { "certificateValidityPeriod": 0 } }"#,
            r#"{ "acme": { "managementListenAddress": "0.0.0.0:14000" } }"#,
        ];

        for json in bad {
            assert!(Config::from_json(json).is_err(), "{json}");
        }
    }

    #[test]
    fn chain_length_is_read_leniently() {
        assert_eq!(chain_length(None), 1);
        assert_eq!(chain_length(Some("3")), 3);
        assert_eq!(chain_length(Some(" 2 ")), 2);
        assert_eq!(chain_length(Some("0")), 1);
        assert_eq!(chain_length(Some("-1")), 1);
        assert_eq!(chain_length(Some("two")), 1);
    }
}
