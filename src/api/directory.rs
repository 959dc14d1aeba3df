use serde::{Deserialize, Serialize};

/// Directory object for ACME client self-configuration.
///
/// This server does not implement pre-authorization, so `newAuthz` is always omitted.
///
/// See [RFC 8555 §7.1.1].
///
/// # Example JSON
///
/// ```json
/// {
///   "newNonce": "http://127.0.0.1:14000/acme/new-nonce",
///   "newAccount": "http://127.0.0.1:14000/acme/new-acct",
///   "newOrder": "http://127.0.0.1:14000/acme/new-order",
///   "revokeCert": "http://127.0.0.1:14000/acme/revoke-cert",
///   "keyChange": "http://127.0.0.1:14000/acme/key-change",
///   "meta": {
///     "termsOfService": "data:text/plain,Do%20what%20thou%20wilt",
///     "externalAccountRequired": false
///   }
/// }
/// ```
///
/// [RFC 8555 §7.1.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.1
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_authz: Option<String>,

    pub revoke_cert: String,
    pub key_change: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

/// <https://datatracker.ietf.org/doc/html/rfc8555#section-9.7.6>
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    /// URL identifying the current terms of service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,

    /// If true, all newAccount requests must include an `externalAccountBinding` field.
    pub external_account_required: bool,
}
