//! Domain control validation.
//!
//! Each challenge attempt runs as its own task bounded by a timeout; its outcome is handed to a
//! caller-supplied callback, never returned to the request that triggered it.

use std::{error::Error as StdError, fmt, net::SocketAddr, sync::Arc, time::Duration};

use hickory_resolver::TokioAsyncResolver;
use sha2::{Digest as _, Sha256};

use crate::{
    api::{ChallengeType, Identifier, Problem, ProblemType},
    jws::Jwk,
    util::base64url,
};

mod dns;
mod http;
mod tls_alpn;

/// Validation settings fixed at startup.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Port HTTP-01 probes connect to.
    pub http_port: u16,

    /// Port TLS-ALPN-01 probes connect to.
    pub tls_port: u16,

    /// Upper bound for a single validation attempt.
    pub attempt_timeout: Duration,

    /// Redirects an HTTP-01 probe follows before giving up.
    pub max_redirects: usize,

    /// Resolver used for every lookup instead of the system one.
    pub dns_server: Option<SocketAddr>,

    /// Reports every attempt as successful without probing.
    pub always_valid: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            http_port: 5002,
            tls_port: 5001,
            attempt_timeout: Duration::from_secs(30),
            max_redirects: 10,
            dns_server: None,
            always_valid: false,
        }
    }
}

/// Everything a probe needs to know about one challenge attempt.
#[derive(Debug, Clone)]
pub struct ValidationJob {
    pub kind: ChallengeType,
    pub identifier: Identifier,
    pub token: String,
    pub key_authorization: String,
}

impl ValidationJob {
    pub fn new(kind: ChallengeType, identifier: Identifier, token: String, key: &Jwk) -> Self {
        ValidationJob {
            kind,
            identifier,
            key_authorization: key_authorization(&token, key),
            token,
        }
    }
}

/// `token || '.' || base64url(thumbprint(key))`, see [RFC 8555 §8.1].
///
/// [RFC 8555 §8.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.1
pub fn key_authorization(token: &str, key: &Jwk) -> String {
    format!("{token}.{}", key.thumbprint())
}

/// Structured reason a probe failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Claimant unreachable, or the HTTP exchange broke down.
    Connection(String),

    /// Name resolution failed.
    Dns(String),

    /// TLS handshake failed or negotiated the wrong protocol.
    Tls(String),

    /// The claimant answered with something that is not a valid response at all.
    IncorrectResponse(String),

    /// The claimant answered, but not with proof for this account and token.
    Unauthorized(String),

    /// The attempt did not finish in time.
    Timeout(Duration),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Connection(detail)
            | ValidationError::Dns(detail)
            | ValidationError::Tls(detail)
            | ValidationError::IncorrectResponse(detail)
            | ValidationError::Unauthorized(detail) => f.write_str(detail),
            ValidationError::Timeout(after) => {
                write!(f, "timeout: validation did not complete within {after:?}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for Problem {
    fn from(err: ValidationError) -> Self {
        let kind = match err {
            ValidationError::Connection(_) | ValidationError::Timeout(_) => ProblemType::Connection,
            ValidationError::Dns(_) => ProblemType::Dns,
            ValidationError::Tls(_) => ProblemType::Tls,
            ValidationError::IncorrectResponse(_) => ProblemType::IncorrectResponse,
            ValidationError::Unauthorized(_) => ProblemType::Unauthorized,
        };

        Problem::new(kind, err.to_string())
    }
}

/// Runs challenge probes.
///
/// Cheap to clone; clones share the HTTP client and resolver.
#[derive(Clone)]
pub struct ValidationEngine {
    config: Arc<ValidationConfig>,
    http: reqwest::Client,
    tls: Arc<tokio_rustls::rustls::ClientConfig>,
    resolver: TokioAsyncResolver,
}

impl ValidationEngine {
    pub fn new(config: ValidationConfig) -> eyre::Result<Self> {
        let resolver = dns::resolver(config.dns_server)?;

        let http = http::client(
            config.max_redirects,
            config.dns_server.map(|_| resolver.clone()),
        )?;

        let tls = tls_alpn::client_config()?;

        if let Some(addr) = config.dns_server {
            log::info!("validation lookups use DNS server {addr}");
        }

        if config.always_valid {
            log::warn!("validation disabled: every challenge attempt will succeed");
        }

        Ok(ValidationEngine {
            config: Arc::new(config),
            http,
            tls,
            resolver,
        })
    }

    /// Starts one validation attempt in the background.
    ///
    /// `report` is called exactly once with the outcome, at the latest when the attempt timeout
    /// elapses. Must be called from within a Tokio runtime.
    pub fn dispatch<F>(&self, job: ValidationJob, report: F)
    where
        F: FnOnce(Result<(), Problem>) + Send + 'static,
    {
        let engine = self.clone();

        tokio::spawn(async move {
            let timeout = engine.config.attempt_timeout;

            let mut probe = tokio::spawn({
                let engine = engine.clone();
                let job = job.clone();
                async move { engine.validate(&job).await }
            });

            let outcome = match tokio::time::timeout(timeout, &mut probe).await {
                Ok(Ok(res)) => res.map_err(Problem::from),
                Ok(Err(err)) => Err(Problem::server_internal(format!(
                    "validation task failed: {err}"
                ))),
                Err(_) => {
                    probe.abort();
                    Err(ValidationError::Timeout(timeout).into())
                }
            };

            match &outcome {
                Ok(()) => log::info!(
                    "{} validation for {} succeeded",
                    job.kind,
                    job.identifier.value
                ),
                Err(problem) => log::info!(
                    "{} validation for {} failed: {problem}",
                    job.kind,
                    job.identifier.value
                ),
            }

            report(outcome);
        });
    }

    /// Runs the probe matching the job's challenge type, without a timeout.
    pub async fn validate(&self, job: &ValidationJob) -> Result<(), ValidationError> {
        if self.config.always_valid {
            return Ok(());
        }

        log::debug!(
            "validating {} for {} (token {})",
            job.kind,
            job.identifier.value,
            job.token
        );

        match job.kind {
            ChallengeType::Http01 => {
                http::validate(
                    &self.http,
                    &job.identifier,
                    self.config.http_port,
                    &job.token,
                    &job.key_authorization,
                )
                .await
            }

            ChallengeType::TlsAlpn01 => {
                let addrs = self.lookup(&job.identifier, self.config.tls_port).await?;
                tls_alpn::validate(
                    Arc::clone(&self.tls),
                    &addrs,
                    &job.identifier,
                    &job.key_authorization,
                )
                .await
            }

            ChallengeType::Dns01 => {
                dns::validate(&self.resolver, &job.identifier, &job.key_authorization).await
            }
        }
    }

    async fn lookup(
        &self,
        identifier: &Identifier,
        port: u16,
    ) -> Result<Vec<SocketAddr>, ValidationError> {
        if let Some(addr) = identifier.ip_addr() {
            return Ok(vec![SocketAddr::new(addr, port)]);
        }

        let host = identifier.value.as_str();

        let addrs = if self.config.dns_server.is_some() {
            self.resolver
                .lookup_ip(host)
                .await
                .map_err(|err| ValidationError::Dns(format!("cannot resolve {host}: {err}")))?
                .iter()
                .map(|addr| SocketAddr::new(addr, port))
                .collect::<Vec<_>>()
        } else {
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|err| ValidationError::Dns(format!("cannot resolve {host}: {err}")))?
                .collect::<Vec<_>>()
        };

        if addrs.is_empty() {
            return Err(ValidationError::Dns(format!("no addresses found for {host}")));
        }

        Ok(addrs)
    }
}

/// SHA-256 digest of a key authorization.
pub(crate) fn key_authorization_digest(key_authorization: &str) -> [u8; 32] {
    Sha256::digest(key_authorization).into()
}

/// Expected TXT record content for a DNS-01 challenge.
pub(crate) fn dns_txt_value(key_authorization: &str) -> String {
    base64url(&key_authorization_digest(key_authorization))
}

/// Flattens an error and its sources into one line.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();

    while let Some(err) = source {
        let msg = err.to_string();
        if !detail.contains(&msg) {
            detail.push_str(": ");
            detail.push_str(&msg);
        }
        source = err.source();
    }

    detail
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use super::*;
    use crate::test::TestKey;

    fn job(kind: ChallengeType, identifier: Identifier) -> ValidationJob {
        ValidationJob::new(
            kind,
            identifier,
            "token-123".to_owned(),
            &TestKey::generate().jwk(),
        )
    }

    #[test]
    fn key_authorization_format() {
        let key = TestKey::generate().jwk();
        let key_auth = key_authorization("tok", &key);

        assert_eq!(key_auth, format!("tok.{}", key.thumbprint()));
        assert_eq!(dns_txt_value(&key_auth).len(), 43);
    }

    #[test]
    fn problems_carry_validation_types() {
        let problem = Problem::from(ValidationError::Timeout(Duration::from_secs(1)));
        assert!(problem.is_type(ProblemType::Connection));
        assert!(problem.detail.unwrap().contains("timeout"));

        let problem = Problem::from(ValidationError::Dns("NXDOMAIN".to_owned()));
        assert!(problem.is_type(ProblemType::Dns));

        let problem = Problem::from(ValidationError::Unauthorized("nope".to_owned()));
        assert!(problem.is_type(ProblemType::Unauthorized));
    }

    #[tokio::test]
    async fn always_valid_skips_probes() {
        let engine = ValidationEngine::new(ValidationConfig {
            always_valid: true,
            ..Default::default()
        })
        .unwrap();

        let (tx, rx) = oneshot::channel();
        engine.dispatch(
            job(ChallengeType::Dns01, Identifier::dns("unresolvable.invalid")),
            move |res| drop(tx.send(res)),
        );

        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn attempt_times_out() {
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let held = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::clone(&held);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.lock().unwrap().push(stream);
            }
        });

        let engine = ValidationEngine::new(ValidationConfig {
            http_port: port,
            attempt_timeout: Duration::from_millis(300),
            ..Default::default()
        })
        .unwrap();

        let (tx, rx) = oneshot::channel();
        engine.dispatch(
            job(
                ChallengeType::Http01,
                Identifier::ip("127.0.0.1".parse().unwrap()),
            ),
            move |res| drop(tx.send(res)),
        );

        let problem = rx.await.unwrap().unwrap_err();
        assert!(problem.is_type(ProblemType::Connection));
        assert!(problem.detail.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn unreachable_claimant_is_a_connection_error() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let engine = ValidationEngine::new(ValidationConfig {
            http_port: port,
            tls_port: port,
            attempt_timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap();

        let ip = Identifier::ip("127.0.0.1".parse().unwrap());

        let err = engine
            .validate(&job(ChallengeType::Http01, ip.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Connection(_)), "{err:?}");

        let err = engine
            .validate(&job(ChallengeType::TlsAlpn01, ip))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Connection(_)), "{err:?}");
    }
}
