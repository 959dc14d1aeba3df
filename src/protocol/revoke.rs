use p256::pkcs8::EncodePublicKey as _;
use time::OffsetDateTime;

use crate::{
    api::{AuthorizationStatus, Problem, Revocation},
    store::{AccountEntry, CertificateEntry},
};

use super::{KeyMode, Protocol, Signer, Urls};

impl Protocol {
    /// Revokes a certificate, see [RFC 8555 §7.6].
    ///
    /// The request is signed either by an account, which must have issued the certificate or hold
    /// valid authorizations for all of its identifiers, or by the certified key itself.
    ///
    /// [RFC 8555 §7.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.6
    pub fn revoke_certificate(&self, urls: &Urls, body: &[u8]) -> Result<(), Problem> {
        let auth = self.authenticate(urls, &urls.revoke_cert(), body, KeyMode::Any)?;

        let revocation = auth.request.json::<Revocation>()?;
        let reason = revocation.reason()?;
        let der = revocation.certificate_der()?;

        let cert = self
            .store
            .certificate_by_der(&der)
            .ok_or_else(|| Problem::not_found("unknown certificate"))?;

        match &auth.signer {
            Signer::Account(account) => {
                if !self.may_revoke(account, &cert) {
                    return Err(Problem::unauthorized(format!(
                        "account {} is not authorized to revoke this certificate",
                        account.id
                    )));
                }
            }
            Signer::Key(jwk) => {
                let spki = jwk
                    .verifying_key()?
                    .to_public_key_der()
                    .map_err(|err| Problem::server_internal(err.to_string()))?;

                if spki.as_bytes() != cert.public_key.as_slice() {
                    return Err(Problem::unauthorized(
                        "request is not signed by the certificate's key",
                    ));
                }
            }
        }

        self.ca.revoke(&cert.id, reason)?;
        Ok(())
    }

    fn may_revoke(&self, account: &AccountEntry, cert: &CertificateEntry) -> bool {
        if account.id == cert.account_id {
            return true;
        }

        let now = OffsetDateTime::now_utc();
        let authzs = self.store.authorizations_by_account(&account.id);

        cert.identifiers.iter().all(|identifier| {
            let base = identifier.base_domain();

            authzs.iter().any(|authz| {
                authz.status == AuthorizationStatus::Valid
                    && authz.expires > now
                    && authz.identifier._type == identifier._type
                    && authz.identifier.value == base
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        api::{ProblemType, RevocationReason},
        issuance::RevocationStatus,
        test::{issue, protocol, register, TestKey},
        util::base64url,
    };

    fn revocation(cert: &CertificateEntry, reason: Option<u8>) -> serde_json::Value {
        json!({ "certificate": base64url(&cert.der), "reason": reason })
    }

    #[tokio::test]
    async fn issuing_account_revokes() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (cert, _) = issue(&proto, &urls, &key, &kid, &["example.test"]).await;

        let url = urls.revoke_cert();
        let payload = revocation(&cert, Some(1));
        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &payload);
        proto.revoke_certificate(&urls, body.as_bytes()).unwrap();

        let status = proto.ca().status(&cert.serial).unwrap();
        assert_eq!(status.status, RevocationStatus::Revoked);
        assert_eq!(status.reason, Some(RevocationReason::KeyCompromise));

        // same reason again is fine, another one is not
        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &payload);
        proto.revoke_certificate(&urls, body.as_bytes()).unwrap();

        let payload = revocation(&cert, Some(4));
        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &payload);
        let err = proto.revoke_certificate(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::AlreadyRevoked));
    }

    #[tokio::test]
    async fn certificate_key_revokes() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (cert, cert_key) = issue(&proto, &urls, &key, &kid, &["example.test"]).await;

        let url = urls.revoke_cert();
        let body = cert_key.sign_jwk(&url, Some(proto.new_nonce()), &revocation(&cert, None));
        proto.revoke_certificate(&urls, body.as_bytes()).unwrap();

        let status = proto.ca().status(&cert.serial).unwrap();
        assert_eq!(status.reason, Some(RevocationReason::Unspecified));

        // some other key
        let other = TestKey::generate();
        let body = other.sign_jwk(&url, Some(proto.new_nonce()), &revocation(&cert, None));
        let err = proto.revoke_certificate(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::Unauthorized));
    }

    #[tokio::test]
    async fn authorized_accounts_revoke() {
        let (proto, urls) = protocol();
        let owner = TestKey::generate();
        let owner_kid = register(&proto, &urls, &owner);
        let (cert, _) = issue(&proto, &urls, &owner, &owner_kid, &["example.test"]).await;

        let stranger = TestKey::generate();
        let stranger_kid = register(&proto, &urls, &stranger);

        let url = urls.revoke_cert();
        let payload = revocation(&cert, None);
        let body = stranger.sign_kid(&stranger_kid, &url, Some(proto.new_nonce()), &payload);
        let err = proto.revoke_certificate(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::Unauthorized));

        // once it controls the name, it may revoke
        issue(&proto, &urls, &stranger, &stranger_kid, &["example.test"]).await;
        let body = stranger.sign_kid(&stranger_kid, &url, Some(proto.new_nonce()), &payload);
        proto.revoke_certificate(&urls, body.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn bad_reason_and_unknown_certificate() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (cert, _) = issue(&proto, &urls, &key, &kid, &["example.test"]).await;

        let url = urls.revoke_cert();
        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &revocation(&cert, Some(7)));
        let err = proto.revoke_certificate(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::BadRevocationReason));

        let payload = json!({ "certificate": base64url(b"not a certificate") });
        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &payload);
        let err = proto.revoke_certificate(&urls, body.as_bytes()).unwrap_err();
        assert_eq!(err.status, Some(404));
    }
}
