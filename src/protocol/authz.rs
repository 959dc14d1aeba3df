use std::sync::Arc;

use time::OffsetDateTime;

use crate::{
    api::{
        Authorization, AuthorizationStatus, AuthorizationUpdate, Challenge, ChallengeStatus,
        Problem, ProblemType,
    },
    validation::ValidationJob,
};

use super::{ensure_owner, KeyMode, Protocol, Urls};

impl Protocol {
    /// Reads or deactivates an authorization; `body` is `None` for an unauthenticated GET.
    pub fn authorization(
        &self,
        urls: &Urls,
        id: &str,
        body: Option<&[u8]>,
    ) -> Result<Authorization, Problem> {
        let url = urls.authorization(id);

        let update = match body {
            Some(body) => {
                let auth = self.authenticate(urls, &url, body, KeyMode::Kid)?;
                let account = auth.account()?;

                let authz = self.store.authorization(id)?;
                ensure_owner(Some(account), &authz.account_id, "authorization")?;

                if auth.request.is_post_as_get() {
                    None
                } else {
                    Some(auth.request.json::<AuthorizationUpdate>()?)
                }
            }
            None => {
                self.read_access(urls, &url, None)?;
                None
            }
        };

        let mut authz = self.refresh_authorization(id)?;

        if let Some(update) = update {
            if update.status != AuthorizationStatus::Deactivated {
                return Err(Problem::malformed(format!(
                    "cannot change authorization status to {:?}",
                    update.status
                )));
            }

            authz = self.store.update_authorization(id, |authz| {
                if !matches!(
                    authz.status,
                    AuthorizationStatus::Pending | AuthorizationStatus::Valid
                ) {
                    return Err(Problem::malformed(format!(
                        "cannot deactivate an authorization with status {:?}",
                        authz.status
                    )));
                }

                authz.status = AuthorizationStatus::Deactivated;
                Ok(authz.clone())
            })?;

            log::info!("deactivated authorization {id}");
        }

        self.authorization_doc(urls, &authz)
    }

    /// Reads a challenge, or requests a validation attempt for it.
    ///
    /// An attempt is dispatched in the background and this returns right away with the challenge
    /// in `processing`; the outcome lands in the store through [`Protocol::record_validation`].
    /// Returns the challenge document and the URL of its authorization.
    pub fn challenge(
        self: &Arc<Self>,
        urls: &Urls,
        id: &str,
        body: Option<&[u8]>,
    ) -> Result<(Challenge, String), Problem> {
        let url = urls.challenge(id);

        let Some(body) = body else {
            self.read_access(urls, &url, None)?;
            let chall = self.store.challenge(id)?;
            let up = urls.authorization(&chall.authorization_id);
            return Ok((self.challenge_doc(urls, &chall), up));
        };

        let auth = self.authenticate(urls, &url, body, KeyMode::Kid)?;
        let account = auth.account()?;

        let chall = self.store.challenge(id)?;
        let up = urls.authorization(&chall.authorization_id);

        let authz = self.store.authorization(&chall.authorization_id)?;
        ensure_owner(Some(account), &authz.account_id, "challenge")?;

        if auth.request.is_post_as_get() {
            return Ok((self.challenge_doc(urls, &chall), up));
        }

        let payload = auth.request.json::<serde_json::Value>()?;
        let is_empty_object = payload.as_object().is_some_and(|obj| obj.is_empty());
        if !payload.is_object() || (self.config.strict && !is_empty_object) {
            return Err(Problem::malformed(
                "challenge response payload must be an empty JSON object",
            ));
        }

        if matches!(chall.status, ChallengeStatus::Processing | ChallengeStatus::Valid) {
            return Ok((self.challenge_doc(urls, &chall), up));
        }

        let authz = self.refresh_authorization(&authz.id)?;
        if authz.status != AuthorizationStatus::Pending {
            return Err(Problem::conflict(format!(
                "authorization is no longer pending, it has status {:?}",
                authz.status
            )));
        }

        let now = OffsetDateTime::now_utc();
        let max_attempts = self.config.max_attempts;
        let backoff = self.config.retry_backoff;

        let (chall, dispatch) = self.store.update_challenge(id, |chall| {
            match chall.status {
                ChallengeStatus::Processing | ChallengeStatus::Valid => {
                    return Ok((chall.clone(), false))
                }
                ChallengeStatus::Pending => {}
                ChallengeStatus::Invalid => {
                    if chall.attempts >= max_attempts {
                        return Err(Problem::new(
                            ProblemType::RateLimited,
                            format!(
                                "challenge failed {} time(s), no further attempts are allowed",
                                chall.attempts
                            ),
                        ));
                    }

                    if let Some(retry_at) = chall.last_attempt.map(|at| at + backoff) {
                        if now < retry_at {
                            return Err(Problem::new(
                                ProblemType::RateLimited,
                                format!("challenge may be retried after {retry_at}"),
                            ));
                        }
                    }
                }
            }

            chall.status = ChallengeStatus::Processing;
            chall.attempts += 1;
            chall.last_attempt = Some(now);
            chall.error = None;

            Ok((chall.clone(), true))
        })?;

        if dispatch {
            let job = ValidationJob::new(
                chall.kind,
                authz.identifier.clone(),
                chall.token.clone(),
                &account.key,
            );

            log::info!(
                "dispatching {} attempt {} for {} (challenge {})",
                chall.kind,
                chall.attempts,
                authz.identifier.value,
                chall.id
            );

            let proto = Arc::clone(self);
            let chall_id = chall.id.clone();
            self.va
                .dispatch(job, move |outcome| proto.record_validation(&chall_id, outcome));
        }

        Ok((self.challenge_doc(urls, &chall), up))
    }

    /// Writes the outcome of a validation attempt back into the store.
    ///
    /// A success marks the challenge valid and makes a still-pending authorization valid; an
    /// authorization that already left `pending` is left as it is. A failure marks the challenge
    /// invalid and fails the authorization once none of its challenges can be retried. An
    /// authorization that is already valid never reverts.
    pub fn record_validation(&self, chall_id: &str, outcome: Result<(), Problem>) {
        if let Err(err) = self.try_record_validation(chall_id, outcome) {
            log::warn!("could not record validation result for challenge {chall_id}: {err}");
        }
    }

    fn try_record_validation(
        &self,
        chall_id: &str,
        outcome: Result<(), Problem>,
    ) -> Result<(), Problem> {
        let chall = self.store.challenge(chall_id)?;
        let now = OffsetDateTime::now_utc();
        let valid_lifetime = self.config.valid_authz_lifetime;

        match outcome {
            Ok(()) => {
                let promoted = self.store.update_authorization(&chall.authorization_id, |authz| {
                    if authz.status != AuthorizationStatus::Pending {
                        return Ok(false);
                    }

                    if authz.expires <= now {
                        authz.status = AuthorizationStatus::Expired;
                        return Ok(false);
                    }

                    authz.status = AuthorizationStatus::Valid;
                    authz.expires = now + valid_lifetime;
                    Ok::<_, Problem>(true)
                })?;

                self.store.update_challenge(chall_id, |chall| {
                    chall.status = ChallengeStatus::Valid;
                    chall.validated = Some(now);
                    chall.error = None;
                    Ok::<_, Problem>(())
                })?;

                if promoted {
                    log::info!("authorization {} is valid", chall.authorization_id);
                } else {
                    log::debug!(
                        "challenge {chall_id} passed after authorization {} left pending",
                        chall.authorization_id
                    );
                }
            }

            Err(problem) => {
                self.store.update_challenge(chall_id, |chall| {
                    chall.status = ChallengeStatus::Invalid;
                    chall.error = Some(problem);
                    Ok::<_, Problem>(())
                })?;

                let authz = self.store.authorization(&chall.authorization_id)?;
                let max_attempts = self.config.max_attempts;

                let exhausted = authz.challenges.iter().try_fold(true, |all, id| {
                    let chall = self.store.challenge(id)?;
                    Ok::<_, Problem>(
                        all && chall.status == ChallengeStatus::Invalid
                            && chall.attempts >= max_attempts,
                    )
                })?;

                if exhausted {
                    let failed = self.store.update_authorization(&authz.id, |authz| {
                        let pending = authz.status == AuthorizationStatus::Pending;
                        if pending {
                            authz.status = AuthorizationStatus::Invalid;
                        }
                        Ok::<_, Problem>(pending)
                    })?;

                    if failed {
                        log::info!("authorization {} is invalid", authz.id);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        api::EmptyString,
        protocol::ProtocolConfig,
        store::Store,
        test::{protocol, protocol_from, register, wait_for_challenge, TestKey},
        validation::ValidationConfig,
    };

    fn id_of(url: &str) -> &str {
        url.rsplit('/').next().unwrap()
    }

    /// First challenge of the only authorization of a fresh order for `name`.
    fn first_challenge(
        proto: &Arc<Protocol>,
        urls: &Urls,
        key: &TestKey,
        kid: &str,
        name: &str,
    ) -> (String, String) {
        let order_url = crate::test::order(proto, urls, key, kid, &[name]);
        let order = proto.store().order(id_of(&order_url)).unwrap();
        let authz = proto.store().authorization(&order.authorizations[0]).unwrap();
        (authz.id, authz.challenges[0].clone())
    }

    fn trigger(
        proto: &Arc<Protocol>,
        urls: &Urls,
        key: &TestKey,
        kid: &str,
        chall_id: &str,
    ) -> Result<(Challenge, String), Problem> {
        let url = urls.challenge(chall_id);
        let body = key.sign_kid(kid, &url, Some(proto.new_nonce()), &json!({}));
        proto.challenge(urls, chall_id, Some(body.as_bytes()))
    }

    #[tokio::test]
    async fn successful_validation_makes_authorization_valid() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (authz_id, chall_id) = first_challenge(&proto, &urls, &key, &kid, "example.test");

        let (chall, up) = trigger(&proto, &urls, &key, &kid, &chall_id).unwrap();
        assert_eq!(up, urls.authorization(&authz_id));
        assert!(matches!(
            chall.status,
            ChallengeStatus::Processing | ChallengeStatus::Valid
        ));

        let chall = wait_for_challenge(&proto, &chall_id).await;
        assert_eq!(chall.status, ChallengeStatus::Valid);
        assert!(chall.validated.is_some());

        let authz = proto.store().authorization(&authz_id).unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Valid);

        // a later failure on another challenge does not revert the authorization
        let other = authz.challenges[1].clone();
        proto.record_validation(&other, Err(Problem::new(ProblemType::Dns, "NXDOMAIN")));
        let authz = proto.store().authorization(&authz_id).unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Valid);
    }

    #[tokio::test]
    async fn timeout_leaves_authorization_pending() {
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _held = tokio::spawn(async move {
            let mut streams = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                streams.push(stream);
            }
        });

        let (proto, urls) = protocol_from(
            Store::new(Default::default(), vec![]),
            ProtocolConfig::default(),
            ValidationConfig {
                http_port: port,
                attempt_timeout: Duration::from_millis(300),
                ..Default::default()
            },
        );
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (authz_id, chall_id) = first_challenge(&proto, &urls, &key, &kid, "127.0.0.1");

        trigger(&proto, &urls, &key, &kid, &chall_id).unwrap();

        let chall = wait_for_challenge(&proto, &chall_id).await;
        assert_eq!(chall.status, ChallengeStatus::Invalid);
        let error = chall.error.unwrap();
        assert!(error.is_type(ProblemType::Connection));
        assert!(error.detail.unwrap().contains("timeout"));

        let authz = proto.store().authorization(&authz_id).unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Pending);
    }

    #[tokio::test]
    async fn exhausted_challenges_fail_the_authorization() {
        let (proto, urls) = protocol_from(
            Store::new(Default::default(), vec![]),
            ProtocolConfig {
                max_attempts: 1,
                ..Default::default()
            },
            ValidationConfig::default(),
        );
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (authz_id, _) = first_challenge(&proto, &urls, &key, &kid, "example.test");
        let authz = proto.store().authorization(&authz_id).unwrap();

        for (n, chall_id) in authz.challenges.iter().enumerate() {
            proto
                .store()
                .update_challenge(chall_id, |chall| {
                    chall.attempts = 1;
                    Ok::<_, Problem>(())
                })
                .unwrap();
            proto.record_validation(chall_id, Err(Problem::unauthorized("wrong response")));

            let status = proto.store().authorization(&authz_id).unwrap().status;
            if n + 1 < authz.challenges.len() {
                assert_eq!(status, AuthorizationStatus::Pending);
            } else {
                assert_eq!(status, AuthorizationStatus::Invalid);
            }
        }

        // retrying a used-up challenge is refused
        let err = trigger(&proto, &urls, &key, &kid, &authz.challenges[0]).unwrap_err();
        assert_eq!(err.status, Some(409));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (proto, urls) = protocol_from(
            Store::new(Default::default(), vec![]),
            ProtocolConfig {
                max_attempts: 2,
                ..Default::default()
            },
            ValidationConfig::default(),
        );
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (_, chall_id) = first_challenge(&proto, &urls, &key, &kid, "example.test");

        proto
            .store()
            .update_challenge(&chall_id, |chall| {
                chall.status = ChallengeStatus::Invalid;
                chall.attempts = 2;
                Ok::<_, Problem>(())
            })
            .unwrap();

        let err = trigger(&proto, &urls, &key, &kid, &chall_id).unwrap_err();
        assert!(err.is_type(ProblemType::RateLimited));
    }

    #[tokio::test]
    async fn strict_mode_requires_empty_object() {
        let (proto, urls) = crate::test::protocol_with(ProtocolConfig {
            strict: true,
            ..Default::default()
        });
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (_, chall_id) = first_challenge(&proto, &urls, &key, &kid, "example.test");

        let url = urls.challenge(&chall_id);
        let payload = json!({ "keyAuthorization": "x" });
        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &payload);
        let err = proto
            .challenge(&urls, &chall_id, Some(body.as_bytes()))
            .unwrap_err();
        assert!(err.is_type(ProblemType::Malformed));

        // POST-as-GET only reads
        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &EmptyString);
        let (chall, _) = proto
            .challenge(&urls, &chall_id, Some(body.as_bytes()))
            .unwrap();
        assert_eq!(chall.status, ChallengeStatus::Pending);
    }

    #[tokio::test]
    async fn deactivation() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (authz_id, chall_id) = first_challenge(&proto, &urls, &key, &kid, "example.test");

        let url = urls.authorization(&authz_id);
        let payload = json!({ "status": "deactivated" });
        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &payload);
        let authz = proto
            .authorization(&urls, &authz_id, Some(body.as_bytes()))
            .unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Deactivated);

        let err = trigger(&proto, &urls, &key, &kid, &chall_id).unwrap_err();
        assert_eq!(err.status, Some(409));

        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &payload);
        let err = proto
            .authorization(&urls, &authz_id, Some(body.as_bytes()))
            .unwrap_err();
        assert!(err.is_type(ProblemType::Malformed));
    }

    #[tokio::test]
    async fn late_success_is_recorded_without_touching_the_authorization() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = register(&proto, &urls, &key);
        let (authz_id, chall_id) = first_challenge(&proto, &urls, &key, &kid, "example.test");

        proto.record_validation(&chall_id, Ok(()));
        let valid = proto.store().authorization(&authz_id).unwrap();
        assert_eq!(valid.status, AuthorizationStatus::Valid);

        // a second challenge passing after the authorization went valid
        let other = valid.challenges[1].clone();
        proto.record_validation(&other, Ok(()));

        let chall = proto.store().challenge(&other).unwrap();
        assert_eq!(chall.status, ChallengeStatus::Valid);
        assert!(chall.validated.is_some());
        assert!(chall.error.is_none());

        let authz = proto.store().authorization(&authz_id).unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Valid);
        assert_eq!(authz.expires, valid.expires);

        // and one passing after the client deactivated it
        let (authz_id, chall_id) = first_challenge(&proto, &urls, &key, &kid, "other.test");
        proto
            .store()
            .update_authorization(&authz_id, |authz| {
                authz.status = AuthorizationStatus::Deactivated;
                Ok::<_, Problem>(())
            })
            .unwrap();

        proto.record_validation(&chall_id, Ok(()));

        let chall = proto.store().challenge(&chall_id).unwrap();
        assert_eq!(chall.status, ChallengeStatus::Valid);
        let authz = proto.store().authorization(&authz_id).unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Deactivated);
    }
}
