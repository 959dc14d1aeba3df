use crate::{
    api::{
        Account, AccountStatus, AccountUpdate, KeyChange, NewAccount, OrderList, Problem,
        ProblemType,
    },
    jws::{verify_external_account_binding, FlattenedJsonJws},
    store::{AccountEntry, StoreError},
};

use super::{KeyMode, Protocol, Signer, Urls};

impl Protocol {
    /// Registers an account, or finds the one already bound to the signing key.
    ///
    /// Returns the account document, its URL and whether it was newly created.
    pub fn new_account(
        &self,
        urls: &Urls,
        body: &[u8],
    ) -> Result<(Account, String, bool), Problem> {
        let url = urls.new_account();
        let auth = self.authenticate(urls, &url, body, KeyMode::Jwk)?;

        let Signer::Key(jwk) = auth.signer else {
            return Err(Problem::malformed("newAccount must be signed with an embedded jwk"));
        };

        let req = auth.request.json::<NewAccount>()?;

        if let Some(existing) = self.store.account_by_key(&jwk) {
            log::debug!("key is already bound to account {}", existing.id);
            let location = urls.account(&existing.id);
            return Ok((self.account_doc(urls, &existing), location, false));
        }

        if req.only_return_existing() {
            return Err(Problem::new(
                ProblemType::AccountDoesNotExist,
                "no account exists for this key",
            ));
        }

        if self.config.strict && req.terms_of_service_agreed != Some(true) {
            return Err(Problem::malformed(
                "must agree to the terms of service to create an account",
            ));
        }

        let contact = req.contact.unwrap_or_default();
        validate_contacts(&contact)?;

        let eab_key_id = match &req.external_account_binding {
            Some(eab) => Some(verify_external_account_binding(eab, &jwk, &url, |kid| {
                self.store.external_key(kid)
            })?),
            None if self.config.external_account_required => {
                return Err(Problem::new(
                    ProblemType::ExternalAccountRequired,
                    "an external account binding is required to create an account",
                ))
            }
            None => None,
        };

        let account = AccountEntry {
            id: self.store.generate_id(),
            key: jwk.clone(),
            contact,
            status: AccountStatus::Valid,
            terms_of_service_agreed: req.terms_of_service_agreed.unwrap_or(false),
            eab_key_id,
        };

        let account = match self.store.add_account(account) {
            Ok(account) => account,

            // lost a race against a concurrent registration with the same key
            Err(StoreError::AlreadyExists) => {
                let existing = self.store.account_by_key(&jwk).ok_or_else(|| {
                    Problem::server_internal("account vanished during registration")
                })?;
                let location = urls.account(&existing.id);
                return Ok((self.account_doc(urls, &existing), location, false));
            }

            Err(err) => return Err(err.into()),
        };

        log::info!("created account {}", account.id);

        let location = urls.account(&account.id);
        Ok((self.account_doc(urls, &account), location, true))
    }

    /// Reads, updates or deactivates an account.
    pub fn account(&self, urls: &Urls, id: &str, body: &[u8]) -> Result<Account, Problem> {
        let auth = self.authenticate(urls, &urls.account(id), body, KeyMode::Kid)?;
        let signer = auth.account()?;

        if signer.id != id {
            return Err(Problem::unauthorized(
                "request signer does not match the account URL",
            ));
        }

        if auth.request.is_post_as_get() {
            return Ok(self.account_doc(urls, signer));
        }

        let update = auth.request.json::<AccountUpdate>()?;

        if let Some(contact) = &update.contact {
            validate_contacts(contact)?;
        }

        let account = self.store.update_account(id, |account| {
            match update.status {
                None => {}
                Some(AccountStatus::Deactivated) => account.status = AccountStatus::Deactivated,
                Some(status) => {
                    return Err(Problem::malformed(format!(
                        "cannot change account status to {status:?}"
                    )))
                }
            }

            if let Some(contact) = update.contact {
                account.contact = contact;
            }

            Ok(account.clone())
        })?;

        if account.status == AccountStatus::Deactivated {
            log::info!("deactivated account {id}");
        }

        Ok(self.account_doc(urls, &account))
    }

    /// Lists the URLs of an account's orders, oldest first.
    pub fn account_orders(
        &self,
        urls: &Urls,
        id: &str,
        body: &[u8],
    ) -> Result<OrderList, Problem> {
        let auth = self.authenticate(urls, &urls.account_orders(id), body, KeyMode::Kid)?;

        if auth.account()?.id != id {
            return Err(Problem::unauthorized(
                "request signer does not match the account URL",
            ));
        }

        Ok(OrderList {
            orders: self
                .store
                .orders_by_account(id)
                .iter()
                .map(|order| urls.order(&order.id))
                .collect(),
        })
    }

    /// Binds a new key to the signing account.
    ///
    /// The outer JWS is signed by the current key, the inner one by the new key.
    pub fn key_change(&self, urls: &Urls, body: &[u8]) -> Result<Account, Problem> {
        let url = urls.key_change();
        let auth = self.authenticate(urls, &url, body, KeyMode::Kid)?;
        let account = auth.account()?;

        let inner = auth.request.json::<FlattenedJsonJws>()?.decode()?;

        let new_key = match (&inner.header.jwk, &inner.header.kid) {
            (Some(jwk), None) => jwk.clone(),
            _ => {
                return Err(Problem::malformed(
                    "inner JWS must carry the new key as jwk and no kid",
                ))
            }
        };

        if inner.header.url.as_deref() != Some(url.as_str()) {
            return Err(Problem::malformed(
                "inner JWS url does not match the outer JWS url",
            ));
        }

        if self.config.strict && inner.header.nonce.is_some() {
            return Err(Problem::malformed("inner JWS must not carry a nonce"));
        }

        inner.verify(&new_key.verifying_key()?)?;

        let change = inner.json::<KeyChange>()?;

        if change.account != urls.account(&account.id) {
            return Err(Problem::malformed(
                "key change account does not match the signing account",
            ));
        }

        if !change.old_key.same_key(&account.key) {
            return Err(Problem::malformed(
                "oldKey does not match the key currently bound to the account",
            ));
        }

        if new_key.same_key(&account.key) {
            return Err(Problem::malformed("new key is the same as the old key"));
        }

        let account = self
            .store
            .rekey_account(&account.id, new_key)
            .map_err(|err| match err {
                StoreError::AlreadyExists => {
                    Problem::conflict("new key is already in use by another account")
                }
                err => err.into(),
            })?;

        log::info!("rolled over key of account {}", account.id);

        Ok(self.account_doc(urls, &account))
    }
}

/// Only `mailto:` URIs naming a single address are supported.
fn validate_contacts(contacts: &[String]) -> Result<(), Problem> {
    for contact in contacts {
        let Some(addr) = contact.strip_prefix("mailto:") else {
            return Err(Problem::new(
                ProblemType::UnsupportedContact,
                format!("contact {contact:?} is not a mailto: URI"),
            ));
        };

        let valid = addr
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
            && !addr.contains([',', '?', ' ']);

        if !valid {
            return Err(Problem::new(
                ProblemType::InvalidContact,
                format!("contact {contact:?} is not a single valid email address"),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::{
        api::EmptyString,
        protocol::ProtocolConfig,
        store::Store,
        test::{external_account_binding, protocol, protocol_from, protocol_with, TestKey},
        validation::ValidationConfig,
    };

    #[tokio::test]
    async fn registration_is_idempotent_per_key() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();

        let payload = json!({ "contact": ["mailto:admin@example.test"] });
        let body = key.sign_jwk(&urls.new_account(), Some(proto.new_nonce()), &payload);
        let (account, location, created) = proto.new_account(&urls, body.as_bytes()).unwrap();
        assert!(created);
        assert_eq!(account.status, AccountStatus::Valid);
        assert_eq!(account.contact.unwrap(), ["mailto:admin@example.test"]);

        let body = key.sign_jwk(&urls.new_account(), Some(proto.new_nonce()), &json!({}));
        let (_, again, created) = proto.new_account(&urls, body.as_bytes()).unwrap();
        assert!(!created);
        assert_eq!(again, location);
    }

    #[tokio::test]
    async fn only_return_existing() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();

        let payload = json!({ "onlyReturnExisting": true });
        let body = key.sign_jwk(&urls.new_account(), Some(proto.new_nonce()), &payload);
        let err = proto.new_account(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::AccountDoesNotExist));
    }

    #[tokio::test]
    async fn contacts_must_be_mailto() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();

        let payload = json!({ "contact": ["tel:+12025551212"] });
        let body = key.sign_jwk(&urls.new_account(), Some(proto.new_nonce()), &payload);
        let err = proto.new_account(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::UnsupportedContact));

        let payload = json!({ "contact": ["mailto:a@example.test,b@example.test"] });
        let body = key.sign_jwk(&urls.new_account(), Some(proto.new_nonce()), &payload);
        let err = proto.new_account(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::InvalidContact));
    }

    #[tokio::test]
    async fn strict_mode_requires_terms_agreement() {
        let (proto, urls) = protocol_with(ProtocolConfig {
            strict: true,
            ..Default::default()
        });
        let key = TestKey::generate();

        let body = key.sign_jwk(&urls.new_account(), Some(proto.new_nonce()), &json!({}));
        let err = proto.new_account(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::Malformed));

        let payload = json!({ "termsOfServiceAgreed": true });
        let body = key.sign_jwk(&urls.new_account(), Some(proto.new_nonce()), &payload);
        proto.new_account(&urls, body.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn external_account_binding_required() {
        let mac_key = b"0123456789abcdef0123456789abcdef".to_vec();
        let store = Store::new(HashMap::from([("kid-1".to_owned(), mac_key.clone())]), vec![]);
        let (proto, urls) = protocol_from(
            store,
            ProtocolConfig {
                external_account_required: true,
                ..Default::default()
            },
            ValidationConfig::default(),
        );
        let key = TestKey::generate();

        let body = key.sign_jwk(&urls.new_account(), Some(proto.new_nonce()), &json!({}));
        let err = proto.new_account(&urls, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::ExternalAccountRequired));

        let eab = external_account_binding("kid-1", &mac_key, &key.jwk(), &urls.new_account());
        let payload = json!({ "externalAccountBinding": eab });
        let body = key.sign_jwk(&urls.new_account(), Some(proto.new_nonce()), &payload);
        let (_, location, created) = proto.new_account(&urls, body.as_bytes()).unwrap();
        assert!(created);

        let id = location.rsplit('/').next().unwrap();
        let stored = proto.store().account(id).unwrap();
        assert_eq!(stored.eab_key_id.as_deref(), Some("kid-1"));
    }

    #[tokio::test]
    async fn deactivated_accounts_cannot_sign() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = crate::test::register(&proto, &urls, &key);
        let id = kid.rsplit('/').next().unwrap().to_owned();

        let payload = json!({ "status": "deactivated" });
        let body = key.sign_kid(&kid, &kid, Some(proto.new_nonce()), &payload);
        let account = proto.account(&urls, &id, body.as_bytes()).unwrap();
        assert_eq!(account.status, AccountStatus::Deactivated);

        let body = key.sign_kid(&kid, &kid, Some(proto.new_nonce()), &EmptyString);
        let err = proto.account(&urls, &id, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::Unauthorized));
    }

    #[tokio::test]
    async fn contact_update() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = crate::test::register(&proto, &urls, &key);
        let id = kid.rsplit('/').next().unwrap().to_owned();

        let payload = json!({ "contact": ["mailto:new@example.test"] });
        let body = key.sign_kid(&kid, &kid, Some(proto.new_nonce()), &payload);
        let account = proto.account(&urls, &id, body.as_bytes()).unwrap();
        assert_eq!(account.contact.unwrap(), ["mailto:new@example.test"]);

        let payload = json!({ "status": "revoked" });
        let body = key.sign_kid(&kid, &kid, Some(proto.new_nonce()), &payload);
        let err = proto.account(&urls, &id, body.as_bytes()).unwrap_err();
        assert!(err.is_type(ProblemType::Malformed));
    }

    #[tokio::test]
    async fn key_rollover() {
        let (proto, urls) = protocol();
        let old = TestKey::generate();
        let kid = crate::test::register(&proto, &urls, &old);

        let new = TestKey::generate();
        let inner = new.sign_jwk(
            &urls.key_change(),
            None,
            &json!({ "account": kid, "oldKey": old.jwk() }),
        );
        let inner = serde_json::from_str::<serde_json::Value>(&inner).unwrap();
        let body = old.sign_kid(&kid, &urls.key_change(), Some(proto.new_nonce()), &inner);
        let account = proto.key_change(&urls, body.as_bytes()).unwrap();
        assert!(account.key.same_key(&new.jwk()));

        // the old key no longer authenticates
        let body = old.sign_kid(&kid, &kid, Some(proto.new_nonce()), &EmptyString);
        let id = kid.rsplit('/').next().unwrap();
        assert!(proto.account(&urls, id, body.as_bytes()).is_err());

        let body = new.sign_kid(&kid, &kid, Some(proto.new_nonce()), &EmptyString);
        proto.account(&urls, id, body.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn key_rollover_to_a_taken_key_conflicts() {
        let (proto, urls) = protocol();
        let first = TestKey::generate();
        let second = TestKey::generate();
        let kid = crate::test::register(&proto, &urls, &first);
        crate::test::register(&proto, &urls, &second);

        let inner = second.sign_jwk(
            &urls.key_change(),
            None,
            &json!({ "account": kid, "oldKey": first.jwk() }),
        );
        let inner = serde_json::from_str::<serde_json::Value>(&inner).unwrap();
        let body = first.sign_kid(&kid, &urls.key_change(), Some(proto.new_nonce()), &inner);
        let err = proto.key_change(&urls, body.as_bytes()).unwrap_err();
        assert_eq!(err.status, Some(409));
    }

    #[tokio::test]
    async fn orders_list() {
        let (proto, urls) = protocol();
        let key = TestKey::generate();
        let kid = crate::test::register(&proto, &urls, &key);
        let id = kid.rsplit('/').next().unwrap().to_owned();

        let first = crate::test::order(&proto, &urls, &key, &kid, &["a.example.test"]);
        let second = crate::test::order(&proto, &urls, &key, &kid, &["b.example.test"]);

        let url = urls.account_orders(&id);
        let body = key.sign_kid(&kid, &url, Some(proto.new_nonce()), &EmptyString);
        let list = proto.account_orders(&urls, &id, body.as_bytes()).unwrap();
        assert_eq!(list.orders, [first, second]);
    }
}
