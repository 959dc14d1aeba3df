//! Protocol engine.
//!
//! Applies authenticated ACME requests to the [`Store`], drives the order, authorization and
//! challenge state machines, hands challenges to the [`ValidationEngine`] and finalized orders to
//! the [`CertificateAuthority`]. Nothing here knows about HTTP; the server module only moves bytes
//! and headers in and out.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::{
    api::{
        self, AuthorizationStatus, ChallengeType, Directory, DirectoryMeta, OrderStatus, Problem,
        ProblemType,
    },
    issuance::CertificateAuthority,
    jws::{Jwk, SignedRequest},
    store::{AccountEntry, AuthorizationEntry, ChallengeEntry, OrderEntry, Store},
    util::rfc3339,
    validation::ValidationEngine,
};

mod account;
mod authz;
mod order;
mod revoke;

pub use self::order::CertificateDownload;

/// Protocol policy fixed at startup.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Rejects request shapes that are tolerated for compatibility.
    pub strict: bool,

    /// New accounts must carry an external account binding.
    pub external_account_required: bool,

    /// Advertised in the directory's `meta` object.
    pub terms_of_service: Option<String>,

    pub order_lifetime: Duration,
    pub pending_authz_lifetime: Duration,
    pub valid_authz_lifetime: Duration,

    /// Attaches an account's still-valid authorization to new orders for the same identifier.
    pub reuse_valid_authz: bool,

    /// Challenge types offered on new authorizations, where applicable to the identifier.
    pub challenge_types: Vec<ChallengeType>,

    /// Validation attempts allowed per challenge.
    pub max_attempts: u32,

    /// Minimum wait between a failed attempt and its retry.
    pub retry_backoff: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            strict: false,
            external_account_required: false,
            terms_of_service: Some("data:text/plain,Do%20what%20thou%20wilt".to_owned()),
            order_lifetime: Duration::days(7),
            pending_authz_lifetime: Duration::days(7),
            valid_authz_lifetime: Duration::days(30),
            reuse_valid_authz: true,
            challenge_types: ChallengeType::ALL.to_vec(),
            max_attempts: 3,
            retry_backoff: Duration::ZERO,
        }
    }
}

/// Resource URLs, all relative to the base the request came in on.
#[derive(Debug, Clone)]
pub struct Urls {
    base: String,
}

impl Urls {
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Urls { base }
    }

    pub fn directory(&self) -> String {
        format!("{}/directory", self.base)
    }

    pub fn new_nonce(&self) -> String {
        format!("{}/acme/new-nonce", self.base)
    }

    pub fn new_account(&self) -> String {
        format!("{}/acme/new-acct", self.base)
    }

    pub fn new_order(&self) -> String {
        format!("{}/acme/new-order", self.base)
    }

    pub fn revoke_cert(&self) -> String {
        format!("{}/acme/revoke-cert", self.base)
    }

    pub fn key_change(&self) -> String {
        format!("{}/acme/key-change", self.base)
    }

    pub fn account(&self, id: &str) -> String {
        format!("{}/acme/acct/{id}", self.base)
    }

    pub fn account_orders(&self, id: &str) -> String {
        format!("{}/acme/acct/{id}/orders", self.base)
    }

    pub fn order(&self, id: &str) -> String {
        format!("{}/acme/order/{id}", self.base)
    }

    pub fn finalize(&self, id: &str) -> String {
        format!("{}/acme/finalize/{id}", self.base)
    }

    pub fn authorization(&self, id: &str) -> String {
        format!("{}/acme/authz/{id}", self.base)
    }

    pub fn challenge(&self, id: &str) -> String {
        format!("{}/acme/chall/{id}", self.base)
    }

    /// Default chain for index 0, alternate chains otherwise.
    pub fn certificate(&self, id: &str, index: usize) -> String {
        match index {
            0 => format!("{}/acme/cert/{id}", self.base),
            index => format!("{}/acme/cert/{id}/{index}", self.base),
        }
    }

    /// Account ID a `kid` header refers to.
    fn account_id<'a>(&self, kid: &'a str) -> Option<&'a str> {
        kid.strip_prefix(self.base.as_str())?
            .strip_prefix("/acme/acct/")
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }
}

/// How a request is allowed to identify its signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMode {
    /// Embedded `jwk`; newAccount.
    Jwk,

    /// Account URL in `kid`; everything else.
    Kid,

    /// Either; revokeCert.
    Any,
}

/// Who signed a request.
#[derive(Debug, Clone)]
enum Signer {
    Key(Jwk),
    Account(AccountEntry),
}

/// A request whose signature and nonce have been checked.
#[derive(Debug)]
struct Authenticated {
    request: SignedRequest,
    signer: Signer,
}

impl Authenticated {
    fn account(&self) -> Result<&AccountEntry, Problem> {
        match &self.signer {
            Signer::Account(account) => Ok(account),
            Signer::Key(_) => Err(Problem::malformed(
                "request must be signed with an account kid",
            )),
        }
    }
}

pub struct Protocol {
    store: Arc<Store>,
    ca: Arc<CertificateAuthority>,
    va: ValidationEngine,
    config: ProtocolConfig,
}

impl Protocol {
    pub fn new(
        store: Arc<Store>,
        ca: Arc<CertificateAuthority>,
        va: ValidationEngine,
        config: ProtocolConfig,
    ) -> Self {
        Protocol {
            store,
            ca,
            va,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn is_strict(&self) -> bool {
        self.config.strict
    }

    pub fn directory(&self, urls: &Urls) -> Directory {
        Directory {
            new_nonce: urls.new_nonce(),
            new_account: urls.new_account(),
            new_order: urls.new_order(),
            new_authz: None,
            revoke_cert: urls.revoke_cert(),
            key_change: urls.key_change(),
            meta: Some(DirectoryMeta {
                terms_of_service: self.config.terms_of_service.clone(),
                external_account_required: self.config.external_account_required,
            }),
        }
    }

    pub fn new_nonce(&self) -> String {
        self.store.new_nonce()
    }

    /// Parses and authenticates a JWS request directed at `url`.
    ///
    /// Checks happen in this order: envelope shape, target URL, key lookup, signature, nonce. The
    /// nonce is only redeemed for requests that are otherwise well-formed and correctly signed.
    fn authenticate(
        &self,
        urls: &Urls,
        url: &str,
        body: &[u8],
        mode: KeyMode,
    ) -> Result<Authenticated, Problem> {
        let request = SignedRequest::parse(body)?;
        let header = &request.header;

        match header.url.as_deref() {
            Some(signed_url) if signed_url == url => {}
            Some(signed_url) => {
                return Err(Problem::unauthorized(format!(
                    "JWS header url {signed_url:?} does not match request URL {url:?}"
                )))
            }
            None => return Err(Problem::malformed("JWS header is missing the url parameter")),
        }

        let signer = match (&header.jwk, &header.kid) {
            (Some(_), Some(_)) => {
                return Err(Problem::malformed(
                    "JWS header must not carry both jwk and kid",
                ))
            }
            (None, None) => return Err(Problem::malformed("JWS header must carry jwk or kid")),

            (Some(jwk), None) => {
                if mode == KeyMode::Kid {
                    return Err(Problem::malformed(
                        "request must be signed with an account kid, not an embedded jwk",
                    ));
                }

                request.verify(&jwk.verifying_key()?)?;
                Signer::Key(jwk.clone())
            }

            (None, Some(kid)) => {
                if mode == KeyMode::Jwk {
                    return Err(Problem::malformed(
                        "request must carry an embedded jwk, not a kid",
                    ));
                }

                let id = urls.account_id(kid).ok_or_else(|| {
                    Problem::malformed(format!("kid {kid:?} is not an account URL"))
                })?;

                let account = self.store.account(id).map_err(|_| {
                    Problem::new(
                        ProblemType::AccountDoesNotExist,
                        format!("account {kid} does not exist"),
                    )
                })?;

                request.verify(&account.key.verifying_key()?)?;

                if account.status != api::AccountStatus::Valid {
                    return Err(Problem::unauthorized(format!(
                        "account {kid} is not valid, it has status {:?}",
                        account.status
                    )));
                }

                Signer::Account(account)
            }
        };

        let nonce = header
            .nonce
            .as_deref()
            .ok_or_else(|| Problem::bad_nonce("JWS header is missing the nonce parameter"))?;

        self.store.redeem_nonce(nonce).map_err(|_| {
            Problem::bad_nonce(format!("JWS has an invalid anti-replay nonce: {nonce:?}"))
        })?;

        log::debug!("authenticated request to {url}");

        Ok(Authenticated { request, signer })
    }

    /// Access check for resources readable by their owning account.
    ///
    /// `body` is `None` for an unauthenticated GET, which only lax mode allows. Otherwise the
    /// request must be a POST-as-GET signed by an account; that account is returned.
    fn read_access(
        &self,
        urls: &Urls,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<Option<AccountEntry>, Problem> {
        let Some(body) = body else {
            if self.config.strict {
                return Err(Problem::malformed(
                    "unauthenticated GET is not allowed in strict mode, use POST-as-GET",
                )
                .with_status(405));
            }

            return Ok(None);
        };

        let auth = self.authenticate(urls, url, body, KeyMode::Kid)?;

        if !auth.request.is_post_as_get() {
            return Err(Problem::malformed("POST-as-GET requests must have an empty payload"));
        }

        Ok(Some(auth.account()?.clone()))
    }

    /// Applies time-based expiry to an authorization and returns its current state.
    fn refresh_authorization(&self, id: &str) -> Result<AuthorizationEntry, Problem> {
        let now = OffsetDateTime::now_utc();

        self.store.update_authorization(id, |authz| {
            if matches!(
                authz.status,
                AuthorizationStatus::Pending | AuthorizationStatus::Valid
            ) && authz.expires <= now
            {
                log::debug!("authorization {} expired", authz.id);
                authz.status = AuthorizationStatus::Expired;
            }

            Ok::<_, Problem>(authz.clone())
        })
    }

    /// Re-derives an order's status from its authorizations and expiry.
    ///
    /// Every authorization is read afresh; earlier observations are never trusted.
    fn refresh_order(&self, id: &str) -> Result<OrderEntry, Problem> {
        let order = self.store.order(id)?;

        if !matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) {
            return Ok(order);
        }

        let authzs = order
            .authorizations
            .iter()
            .map(|id| self.refresh_authorization(id))
            .collect::<Result<Vec<_>, _>>()?;

        let now = OffsetDateTime::now_utc();

        self.store.update_order(id, |order| {
            if !matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) {
                return Ok(order.clone());
            }

            if order.expires <= now {
                order.status = OrderStatus::Invalid;
                order.error = Some(Problem::malformed("order expired before it was finalized"));
            } else if let Some(failed) = authzs.iter().find(|authz| authz.status.is_failed()) {
                order.status = OrderStatus::Invalid;
                order.error = Some(Problem::unauthorized(format!(
                    "authorization for {} is {:?}",
                    failed.identifier.value, failed.status
                )));
            } else if order.status == OrderStatus::Pending
                && authzs
                    .iter()
                    .all(|authz| authz.status == AuthorizationStatus::Valid)
            {
                order.status = OrderStatus::Ready;
            }

            if order.status != OrderStatus::Pending {
                log::debug!("order {} is now {:?}", order.id, order.status);
            }

            Ok::<_, Problem>(order.clone())
        })
    }

    fn account_doc(&self, urls: &Urls, account: &AccountEntry) -> api::Account {
        api::Account {
            status: account.status,
            contact: (!account.contact.is_empty()).then(|| account.contact.clone()),
            terms_of_service_agreed: Some(account.terms_of_service_agreed),
            orders: urls.account_orders(&account.id),
            key: account.key.clone(),
        }
    }

    fn order_doc(&self, urls: &Urls, order: &OrderEntry) -> api::Order {
        api::Order {
            status: order.status,
            expires: rfc3339(order.expires),
            identifiers: order.identifiers.clone(),
            not_before: order.not_before.clone(),
            not_after: order.not_after.clone(),
            error: order.error.clone(),
            authorizations: order
                .authorizations
                .iter()
                .map(|id| urls.authorization(id))
                .collect(),
            finalize: urls.finalize(&order.id),
            certificate: order.certificate.as_deref().map(|id| urls.certificate(id, 0)),
        }
    }

    fn authorization_doc(
        &self,
        urls: &Urls,
        authz: &AuthorizationEntry,
    ) -> Result<api::Authorization, Problem> {
        let challenges = authz
            .challenges
            .iter()
            .map(|id| Ok(self.challenge_doc(urls, &self.store.challenge(id)?)))
            .collect::<Result<Vec<_>, Problem>>()?;

        Ok(api::Authorization {
            identifier: authz.identifier.clone(),
            status: authz.status,
            expires: Some(rfc3339(authz.expires)),
            challenges,
            wildcard: authz.wildcard.then_some(true),
        })
    }

    fn challenge_doc(&self, urls: &Urls, chall: &ChallengeEntry) -> api::Challenge {
        api::Challenge {
            _type: chall.kind,
            url: urls.challenge(&chall.id),
            status: chall.status,
            validated: chall.validated.map(rfc3339),
            error: chall.error.clone(),
            token: chall.token.clone(),
        }
    }
}

/// Fails unless `account` owns the resource.
fn ensure_owner(
    account: Option<&AccountEntry>,
    owner_id: &str,
    what: &str,
) -> Result<(), Problem> {
    match account {
        Some(account) if account.id != owner_id => Err(Problem::unauthorized(format!(
            "account {} does not own this {what}",
            account.id
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{protocol, protocol_with, TestKey};

    #[test]
    fn urls_round_trip_account_ids() {
        let urls = Urls::new("http://acme.test:14000/");
        assert_eq!(urls.directory(), "http://acme.test:14000/directory");

        let kid = urls.account("abc");
        assert_eq!(urls.account_id(&kid), Some("abc"));
        assert_eq!(urls.account_id(&urls.account_orders("abc")), None);
        assert_eq!(urls.account_id("http://elsewhere.test/acme/acct/abc"), None);

        assert_eq!(urls.certificate("c", 0), "http://acme.test:14000/acme/cert/c");
        assert_eq!(urls.certificate("c", 2), "http://acme.test:14000/acme/cert/c/2");
    }

    #[tokio::test]
    async fn nonces_are_single_use() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();

        let nonce = proto.new_nonce();
        let body = key.sign_jwk(&urls.new_account(), Some(nonce.clone()), &serde_json::json!({}));
        proto.new_account(&urls, body.as_bytes()).unwrap();

        let replay = key.sign_jwk(&urls.new_account(), Some(nonce), &serde_json::json!({}));
        let err = proto.new_account(&urls, replay.as_bytes()).unwrap_err();
        assert!(err.is_bad_nonce());

        let missing = key.sign_jwk(&urls.new_account(), None, &serde_json::json!({}));
        let err = proto.new_account(&urls, missing.as_bytes()).unwrap_err();
        assert!(err.is_bad_nonce());
    }

    #[tokio::test]
    async fn request_url_must_match() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();

        let nonce = Some(proto.new_nonce());
        let body = key.sign_jwk(&urls.new_order(), nonce, &serde_json::json!({}));
        let err = proto.new_account(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::Unauthorized));
    }

    #[tokio::test]
    async fn bad_signature_does_not_burn_nonce() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let nonce = proto.new_nonce();

        let body = key.sign_jwk(&urls.new_account(), Some(nonce.clone()), &serde_json::json!({}));
        let mut jws = serde_json::from_str::<serde_json::Value>(&body).unwrap();
        jws["signature"] = serde_json::Value::String(crate::util::base64url(&[0u8; 64]));

        let err = proto
            .new_account(&urls, jws.to_string().as_bytes())
            .unwrap_err();
        assert_eq!(err.detail.as_deref(), Some("JWS verification error"));

        proto.store().redeem_nonce(&nonce).unwrap();
    }

    #[tokio::test]
    async fn unknown_kid_is_account_does_not_exist() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();

        let kid = urls.account("nobody");
        let body = key.sign_kid(
            &kid,
            &urls.new_order(),
            Some(proto.new_nonce()),
            &serde_json::json!({}),
        );
        let err = proto.new_order(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::AccountDoesNotExist));
    }

    #[tokio::test]
    async fn strict_mode_rejects_unauthenticated_get() {
        let (proto, urls) = protocol_with(ProtocolConfig {
            strict: true,
            ..Default::default()
        });

        let err = proto.order(&urls, "any", None).unwrap_err();
        assert_eq!(err.status, Some(405));
    }

    #[tokio::test]
    async fn directory_lists_endpoints() {
        let (proto, urls) = protocol();
        let dir = proto.directory(&urls);

        assert_eq!(dir.new_account, "http://acme.test/acme/new-acct");
        assert!(dir.new_authz.is_none());
        assert!(!dir.meta.unwrap().external_account_required);
    }
}
