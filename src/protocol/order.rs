use std::collections::BTreeSet;

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    api::{
        AuthorizationStatus, ChallengeStatus, ChallengeType, Finalize, Identifier, NewOrder, Order,
        OrderStatus, Problem, ProblemType, Subproblem,
    },
    cert::{normalize_identifier, verify_csr},
    issuance::IssueRequest,
    jws::Jwk,
    store::{AuthorizationEntry, ChallengeEntry, OrderEntry},
    util::random_token,
};

use super::{ensure_owner, KeyMode, Protocol, Urls};

/// A certificate chain ready to be served.
#[derive(Debug, Clone)]
pub struct CertificateDownload {
    /// Leaf and intermediates, PEM.
    pub pem: String,

    /// URLs of the same certificate under the other chains.
    pub alternates: Vec<String>,
}

impl Protocol {
    /// Creates an order with an authorization per identifier.
    ///
    /// Returns the order document and its URL.
    pub fn new_order(&self, urls: &Urls, body: &[u8]) -> Result<(Order, String), Problem> {
        let auth = self.authenticate(urls, &urls.new_order(), body, KeyMode::Kid)?;
        let account = auth.account()?;
        let req = auth.request.json::<NewOrder>()?;

        if req.identifiers.is_empty() {
            return Err(Problem::malformed("order must contain at least one identifier"));
        }

        let mut identifiers = Vec::with_capacity(req.identifiers.len());
        for identifier in &req.identifiers {
            let identifier = check_identifier(identifier)?;
            if !identifiers.contains(&identifier) {
                identifiers.push(identifier);
            }
        }

        let blocked = identifiers
            .iter()
            .filter(|id| id.is_type_dns() && self.store.is_blocked(&id.value))
            .map(|id| {
                Subproblem::new(
                    ProblemType::RejectedIdentifier,
                    format!("policy forbids issuing for name {:?}", id.value),
                    id,
                )
            })
            .collect::<Vec<_>>();

        if !blocked.is_empty() {
            log::info!("rejected order with {} blocked identifier(s)", blocked.len());

            return Err(Problem::new(
                ProblemType::RejectedIdentifier,
                "order includes identifiers the server will not issue for",
            )
            .with_subproblems(blocked));
        }

        for (field, value) in [("notBefore", &req.not_before), ("notAfter", &req.not_after)] {
            if let Some(value) = value {
                OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
                    Problem::malformed(format!("{field} is not an RFC 3339 timestamp: {err}"))
                })?;
            }
        }

        // decided up front so nothing is stored for an order that cannot be served
        let offers = identifiers
            .iter()
            .map(|id| {
                let offered = self.offered_challenges(id);
                if offered.is_empty() {
                    Err(Problem::new(
                        ProblemType::UnsupportedIdentifier,
                        format!("no enabled challenge type can validate {:?}", id.value),
                    ))
                } else {
                    Ok(offered)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let now = OffsetDateTime::now_utc();

        let authorizations = identifiers
            .iter()
            .zip(offers)
            .map(|(identifier, offered)| {
                match self.reusable_authorization(&account.id, identifier, now) {
                    Some(authz) => {
                        log::debug!("reusing authorization {} for {}", authz.id, identifier.value);
                        Ok(authz.id)
                    }
                    None => self.create_authorization(&account.id, identifier, &offered, now),
                }
            })
            .collect::<Result<Vec<_>, Problem>>()?;

        let order = self.store.add_order(OrderEntry {
            id: self.store.generate_id(),
            account_id: account.id.clone(),
            seq: self.store.next_seq(),
            identifiers,
            status: OrderStatus::Pending,
            expires: now + self.config.order_lifetime,
            not_before: req.not_before,
            not_after: req.not_after,
            authorizations,
            certificate: None,
            error: None,
        })?;

        log::info!(
            "created order {} for account {}: {:?}",
            order.id,
            account.id,
            order
                .identifiers
                .iter()
                .map(|id| id.value.as_str())
                .collect::<Vec<_>>()
        );

        // reused authorizations can make the order ready right away
        let order = self.refresh_order(&order.id)?;

        Ok((self.order_doc(urls, &order), urls.order(&order.id)))
    }

    /// Reads an order; `body` is `None` for an unauthenticated GET.
    pub fn order(&self, urls: &Urls, id: &str, body: Option<&[u8]>) -> Result<Order, Problem> {
        let account = self.read_access(urls, &urls.order(id), body)?;

        let order = self.refresh_order(id)?;
        ensure_owner(account.as_ref(), &order.account_id, "order")?;

        Ok(self.order_doc(urls, &order))
    }

    /// Issues the certificate for a ready order.
    ///
    /// Signing happens inside this call; the returned order is `valid` on success and `invalid`
    /// if issuance failed.
    pub fn finalize(&self, urls: &Urls, id: &str, body: &[u8]) -> Result<Order, Problem> {
        let auth = self.authenticate(urls, &urls.finalize(id), body, KeyMode::Kid)?;
        let account = auth.account()?;

        let order = self.store.order(id)?;
        ensure_owner(Some(account), &order.account_id, "order")?;

        let order = self.refresh_order(id)?;
        if order.status != OrderStatus::Ready {
            return Err(not_ready(order.status));
        }

        let csr = auth.request.json::<Finalize>()?.csr_der()?;
        let csr = verify_csr(&csr)?;

        let expected = order.identifiers.iter().cloned().collect::<BTreeSet<_>>();
        if csr.identifiers != expected {
            let missing = expected.difference(&csr.identifiers).map(|id| id.value.as_str());
            let extra = csr.identifiers.difference(&expected).map(|id| id.value.as_str());

            return Err(Problem::new(
                ProblemType::BadCsr,
                format!(
                    "CSR names must match the order identifiers exactly (missing: {:?}, \
                     unexpected: {:?})",
                    missing.collect::<Vec<_>>(),
                    extra.collect::<Vec<_>>(),
                ),
            ));
        }

        if Jwk::from_verifying_key(&csr.public_key).same_key(&account.key) {
            return Err(Problem::new(
                ProblemType::BadCsr,
                "certificate public key must not be the account key",
            ));
        }

        let order = self.store.update_order(id, |order| {
            if order.status != OrderStatus::Ready {
                return Err(not_ready(order.status));
            }

            order.status = OrderStatus::Processing;
            Ok(order.clone())
        })?;

        let issued = self.ca.issue(IssueRequest {
            account_id: &account.id,
            order_id: &order.id,
            identifiers: &order.identifiers,
            public_key: csr.spki,
        });

        let order = self.store.update_order(id, |order| {
            match &issued {
                Ok(cert) => {
                    order.status = OrderStatus::Valid;
                    order.certificate = Some(cert.id.clone());
                }
                Err(err) => {
                    log::warn!("issuance for order {} failed: {err:#}", order.id);
                    order.status = OrderStatus::Invalid;
                    order.error = Some(Problem::server_internal(format!(
                        "error issuing certificate: {err}"
                    )));
                }
            }

            Ok::<_, Problem>(order.clone())
        })?;

        Ok(self.order_doc(urls, &order))
    }

    /// Serves an issued certificate with the chain at `index`.
    pub fn certificate(
        &self,
        urls: &Urls,
        id: &str,
        index: usize,
        body: Option<&[u8]>,
    ) -> Result<CertificateDownload, Problem> {
        let account = self.read_access(urls, &urls.certificate(id, index), body)?;

        let cert = self.store.certificate(id)?;
        ensure_owner(account.as_ref(), &cert.account_id, "certificate")?;

        let pem = self.ca.certificate_chain(&cert, index)?;

        let alternates = (0..self.ca.chain_count())
            .filter(|&other| other != index)
            .map(|other| urls.certificate(id, other))
            .collect();

        Ok(CertificateDownload { pem, alternates })
    }

    fn offered_challenges(&self, identifier: &Identifier) -> Vec<ChallengeType> {
        let applicable: &[ChallengeType] = if identifier.is_wildcard() {
            &[ChallengeType::Dns01]
        } else if identifier.is_type_ip() {
            &[ChallengeType::Http01, ChallengeType::TlsAlpn01]
        } else {
            &ChallengeType::ALL
        };

        applicable
            .iter()
            .copied()
            .filter(|kind| self.config.challenge_types.contains(kind))
            .collect()
    }

    fn reusable_authorization(
        &self,
        account_id: &str,
        identifier: &Identifier,
        now: OffsetDateTime,
    ) -> Option<AuthorizationEntry> {
        if !self.config.reuse_valid_authz {
            return None;
        }

        let wildcard = identifier.is_wildcard();
        let base = identifier.base_domain();

        self.store.find_authorization(|authz| {
            authz.account_id == account_id
                && authz.status == AuthorizationStatus::Valid
                && authz.expires > now
                && authz.wildcard == wildcard
                && authz.identifier._type == identifier._type
                && authz.identifier.value == base
        })
    }

    /// Stores a pending authorization and its challenges; returns the authorization ID.
    fn create_authorization(
        &self,
        account_id: &str,
        identifier: &Identifier,
        offered: &[ChallengeType],
        now: OffsetDateTime,
    ) -> Result<String, Problem> {
        let authz_id = self.store.generate_id();

        let challenges = offered
            .iter()
            .map(|&kind| {
                let chall = self.store.add_challenge(ChallengeEntry {
                    id: self.store.generate_id(),
                    authorization_id: authz_id.clone(),
                    kind,
                    token: random_token(32),
                    status: ChallengeStatus::Pending,
                    error: None,
                    validated: None,
                    last_attempt: None,
                    attempts: 0,
                })?;
                Ok(chall.id)
            })
            .collect::<Result<Vec<_>, Problem>>()?;

        let authz = self.store.add_authorization(AuthorizationEntry {
            id: authz_id,
            account_id: account_id.to_owned(),
            identifier: Identifier {
                _type: identifier._type.clone(),
                value: identifier.base_domain().to_owned(),
            },
            wildcard: identifier.is_wildcard(),
            status: AuthorizationStatus::Pending,
            expires: now + self.config.pending_authz_lifetime,
            challenges,
        })?;

        Ok(authz.id)
    }
}

fn not_ready(status: OrderStatus) -> Problem {
    Problem::new(
        ProblemType::OrderNotReady,
        format!("order is not ready to be finalized, it has status {status:?}"),
    )
}

/// Checks an identifier is acceptable and returns it normalized.
fn check_identifier(identifier: &Identifier) -> Result<Identifier, Problem> {
    let rejected = |detail: String| {
        Problem::new(ProblemType::RejectedIdentifier, detail)
            .with_subproblems(vec![Subproblem::new(
                ProblemType::RejectedIdentifier,
                "invalid identifier",
                identifier,
            )])
    };

    if identifier.is_type_ip() {
        if identifier.ip_addr().is_none() {
            return Err(Problem::malformed(format!(
                "{:?} is not a valid IP address",
                identifier.value
            )));
        }

        return Ok(normalize_identifier(identifier));
    }

    if !identifier.is_type_dns() {
        return Err(Problem::new(
            ProblemType::UnsupportedIdentifier,
            format!("identifier type {:?} is not supported", identifier._type),
        ));
    }

    let normalized = normalize_identifier(identifier);
    let name = normalized.base_domain();

    if name.parse::<std::net::IpAddr>().is_ok() {
        return Err(rejected(format!(
            "{name:?} is an IP address, use an identifier of type ip"
        )));
    }

    if name.is_empty() || name.len() > 253 || name.ends_with('.') {
        return Err(rejected(format!(
            "{:?} is not a valid domain name",
            identifier.value
        )));
    }

    let labels_ok = name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    });

    if !labels_ok {
        return Err(rejected(format!(
            "{:?} is not a valid domain name; wildcards are only allowed as the leftmost label",
            identifier.value
        )));
    }

    if !name.contains('.') {
        return Err(rejected(format!(
            "{:?} must have at least two labels",
            identifier.value
        )));
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        api::{AuthorizationStatus, EmptyString},
        cert::{create_csr, create_p256_key},
        protocol::ProtocolConfig,
        store::Store,
        test::{protocol, protocol_from, protocol_with, register, validate_all, TestKey},
        util::base64url,
        validation::ValidationConfig,
    };

    fn id_of(url: &str) -> &str {
        url.rsplit('/').next().unwrap()
    }

    #[test]
    fn identifier_checks() {
        let ok = check_identifier(&Identifier::dns("WWW.Example.Test")).unwrap();
        assert_eq!(ok.value, "www.example.test");

        let ok = check_identifier(&Identifier::dns("*.example.test")).unwrap();
        assert!(ok.is_wildcard());

        let bad_names = [
            "foo.*.example.test",
            "*.*.example.test",
            "exa mple.test",
            "localhost",
            "",
        ];
        for bad in bad_names {
            let err = check_identifier(&Identifier::dns(bad)).unwrap_err();
            assert!(err.is_type(ProblemType::RejectedIdentifier), "{bad}");
        }

        let ip = check_identifier(&Identifier::ip("2001:db8:0::1".parse().unwrap())).unwrap();
        assert_eq!(ip.value, "2001:db8::1");

        let unknown = Identifier {
            _type: "email".to_owned(),
            value: "a@example.test".to_owned(),
        };
        let err = check_identifier(&unknown).unwrap_err();
        assert!(err.is_type(ProblemType::UnsupportedIdentifier));
    }

    #[tokio::test]
    async fn blocked_domains_create_nothing() {
        let store = Store::new(Default::default(), vec!["blocked.test".to_owned()]);
        let (proto, urls) =
            protocol_from(store, ProtocolConfig::default(), ValidationConfig::default());
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);

        let payload = json!({ "identifiers": [
            { "type": "dns", "value": "ok.example.test" },
            { "type": "dns", "value": "www.blocked.test" },
        ]});
        let body = key.sign_kid(&kid, &urls.new_order(), Some(proto.new_nonce()), &payload);
        let err = proto.new_order(&urls, body.as_bytes()).unwrap_err();

        assert!(err.is_type(ProblemType::RejectedIdentifier));
        let subproblems = err.subproblems.unwrap();
        assert_eq!(subproblems.len(), 1);
        assert_eq!(subproblems[0].identifier.as_ref().unwrap().value, "www.blocked.test");

        let account_id = id_of(&kid);
        assert!(proto.store().authorizations_by_account(account_id).is_empty());
        assert!(proto.store().orders_by_account(account_id).is_empty());
    }

    #[tokio::test]
    async fn challenge_offers_depend_on_identifier() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);

        let payload = json!({ "identifiers": [
            { "type": "dns", "value": "*.example.test" },
            { "type": "ip", "value": "192.0.2.7" },
            { "type": "dns", "value": "example.test" },
        ]});
        let body = key.sign_kid(&kid, &urls.new_order(), Some(proto.new_nonce()), &payload);
        let (order, _) = proto.new_order(&urls, body.as_bytes()).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.authorizations.len(), 3);

        let kinds = |url: &str| {
            let authz = proto.store().authorization(id_of(url)).unwrap();
            authz
                .challenges
                .iter()
                .map(|id| proto.store().challenge(id).unwrap().kind)
                .collect::<Vec<_>>()
        };

        assert_eq!(kinds(&order.authorizations[0]), [ChallengeType::Dns01]);
        assert_eq!(
            kinds(&order.authorizations[1]),
            [ChallengeType::Http01, ChallengeType::TlsAlpn01]
        );
        assert_eq!(kinds(&order.authorizations[2]).len(), 3);

        let wildcard = proto
            .store()
            .authorization(id_of(&order.authorizations[0]))
            .unwrap();
        assert!(wildcard.wildcard);
        assert_eq!(wildcard.identifier.value, "example.test");
    }

    #[tokio::test]
    async fn disabled_challenge_types_are_not_offered() {
        let (proto, urls) = protocol_with(ProtocolConfig {
            challenge_types: vec![ChallengeType::Http01],
            ..Default::default()
        });
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);

        let payload = json!({ "identifiers": [{ "type": "dns", "value": "*.example.test" }] });
        let body = key.sign_kid(&kid, &urls.new_order(), Some(proto.new_nonce()), &payload);
        let err = proto.new_order(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::UnsupportedIdentifier));
    }

    #[tokio::test]
    async fn finalize_before_ready_is_rejected() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let order_url = crate::test::order(&proto, &urls, &key, &kid, &["example.test"]);
        let id = id_of(&order_url);

        let csr = create_csr(&create_p256_key(), &[Identifier::dns("example.test")]).unwrap();
        let payload = json!({ "csr": base64url(&der::Encode::to_der(&csr).unwrap()) });
        let body = key.sign_kid(&kid, &urls.finalize(id), Some(proto.new_nonce()), &payload);

        let err = proto.finalize(&urls, id, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::OrderNotReady));
        assert_eq!(err.status, Some(403));
    }

    #[tokio::test]
    async fn finalize_checks_csr_names_and_key() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let order_url = crate::test::order(&proto, &urls, &key, &kid, &["example.test"]);
        let id = id_of(&order_url);
        validate_all(&proto, &urls, &key, &kid, &order_url).await;

        let finalize = |signer: &p256::ecdsa::SigningKey, names: &[Identifier]| {
            let csr = create_csr(signer, names).unwrap();
            let payload = json!({ "csr": base64url(&der::Encode::to_der(&csr).unwrap()) });
            let body = key.sign_kid(&kid, &urls.finalize(id), Some(proto.new_nonce()), &payload);
            proto.finalize(&urls, id, body.as_bytes())
        };

        let err = finalize(
            &create_p256_key(),
            &[Identifier::dns("example.test"), Identifier::dns("extra.test")],
        )
        .unwrap_err();
        assert!(err.is_type(ProblemType::BadCsr));

        let err = finalize(key.signing_key(), &[Identifier::dns("example.test")]).unwrap_err();
        assert!(err.is_type(ProblemType::BadCsr));

        // rejected CSRs leave the order ready
        let order = finalize(&create_p256_key(), &[Identifier::dns("EXAMPLE.test")]).unwrap();
        assert_eq!(order.status, OrderStatus::Valid);
        assert!(order.certificate.is_some());
    }

    #[tokio::test]
    async fn valid_authorizations_are_reused() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);

        let first = crate::test::order(&proto, &urls, &key, &kid, &["example.test"]);
        validate_all(&proto, &urls, &key, &kid, &first).await;

        let payload = json!({ "identifiers": [{ "type": "dns", "value": "example.test" }] });
        let body = key.sign_kid(&kid, &urls.new_order(), Some(proto.new_nonce()), &payload);
        let (second, _) = proto.new_order(&urls, body.as_bytes()).unwrap();
        assert_eq!(second.status, OrderStatus::Ready);

        let first = proto.order(&urls, id_of(&first), None).unwrap();
        assert_eq!(first.authorizations, second.authorizations);
    }

    #[tokio::test]
    async fn expired_authorizations_invalidate_orders() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let order_url = crate::test::order(&proto, &urls, &key, &kid, &["example.test"]);
        let order = proto.order(&urls, id_of(&order_url), None).unwrap();

        proto
            .store()
            .update_authorization(id_of(&order.authorizations[0]), |authz| {
                authz.expires = OffsetDateTime::now_utc() - time::Duration::seconds(1);
                Ok::<_, Problem>(())
            })
            .unwrap();

        let order = proto.order(&urls, id_of(&order_url), None).unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);

        let authz = proto.store().authorization(id_of(&order.authorizations[0])).unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Expired);
    }

    #[tokio::test]
    async fn orders_are_private_to_their_account() {
        let (proto, urls) = protocol();
        let owner = TestKey::generate();
        let owner_kid = register(&proto, &urls, &owner);
        let other = TestKey::generate();
        let other_kid = register(&proto, &urls, &other);

        let order_url =
            crate::test::order(&proto, &urls, &owner, &owner_kid, &["example.test"]);
        let body = other.sign_kid(&other_kid, &order_url, Some(proto.new_nonce()), &EmptyString);
        let err = proto
            .order(&urls, id_of(&order_url), Some(body.as_bytes()))
            .unwrap_err();
        assert!(err.is_type(ProblemType::Unauthorized));
    }
}
