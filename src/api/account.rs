use serde::{Deserialize, Serialize};

use crate::jws::{FlattenedJsonJws, Jwk};

/// The status of an [`Account`].
///
/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

/// An ACME account resource.
///
/// Represents a set of metadata associated with an account.
///
/// See [RFC 8555 §7.1.2].
///
/// # Example JSON
///
/// ```json
/// {
///   "status": "valid",
///   "contact": [
///     "mailto:cert-admin@example.com",
///     "mailto:admin@example.com"
///   ],
///   "termsOfServiceAgreed": true,
///   "orders": "https://example.com/acme/acct/evOfKhNU60wg/orders"
/// }
/// ```
///
/// [RFC 8555 §7.1.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub status: AccountStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    pub orders: String,

    /// Public key bound to the account.
    pub key: Jwk,
}

/// Payload of a newAccount request.
///
/// See [RFC 8555 §7.3].
///
/// [RFC 8555 §7.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    #[serde(default)]
    pub contact: Option<Vec<String>>,

    #[serde(default)]
    pub terms_of_service_agreed: Option<bool>,

    #[serde(default)]
    pub only_return_existing: Option<bool>,

    /// A JWS over the account key, MAC'd with a key provisioned out-of-band.
    #[serde(default)]
    pub external_account_binding: Option<FlattenedJsonJws>,
}

impl NewAccount {
    pub fn only_return_existing(&self) -> bool {
        self.only_return_existing.unwrap_or(false)
    }
}

/// Payload of a POST to an existing account URL.
///
/// See [RFC 8555 §7.3.2] and [§7.3.6].
///
/// [RFC 8555 §7.3.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.2
/// [§7.3.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.6
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdate {
    #[serde(default)]
    pub contact: Option<Vec<String>>,

    #[serde(default)]
    pub status: Option<AccountStatus>,
}

/// List of order URLs owned by an account.
///
/// See [RFC 8555 §7.1.2.1].
///
/// [RFC 8555 §7.1.2.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.2.1
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderList {
    pub orders: Vec<String>,
}
