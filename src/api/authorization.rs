use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Authorization`].
///
/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
}

impl AuthorizationStatus {
    /// Returns true if an order referencing this authorization can no longer become ready.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            AuthorizationStatus::Invalid
                | AuthorizationStatus::Deactivated
                | AuthorizationStatus::Expired
        )
    }
}

/// An ACME authorization object.
///
/// Represents a server's authorization for an account to represent an identifier.
///
/// See [RFC 8555 §7.1.4].
///
/// [RFC 8555 §7.1.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4
///
/// # Example JSON
///
/// ```json
/// {
///   "identifier": { "type": "dns", "value": "example.test" },
///   "status": "pending",
///   "expires": "2026-10-26T08:26:43Z",
///   "challenges": [
///     {
///       "type": "dns-01",
///       "url": "http://127.0.0.1:14000/acme/chall/ZRkP8kGr0k4f3PSGYMqqzw",
///       "status": "invalid",
///       "error": {
///         "type": "urn:ietf:params:acme:error:dns",
///         "detail": "NXDOMAIN looking up TXT for _acme-challenge.example.test.",
///         "status": 400
///       },
///       "token": "RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8"
///     }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Authorization identifier.
    pub identifier: api::Identifier,

    /// Authorization status.
    pub status: AuthorizationStatus,

    /// The timestamp after which the server will consider this authorization invalid.
    ///
    /// Uses RFC 3339 format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    /// The challenges the client can fulfill in order to prove possession of the identifier.
    pub challenges: Vec<api::Challenge>,

    /// Present and true for authorizations created for a wildcard domain name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<bool>,
}

impl Authorization {
    /// Returns the offered challenge of the given type.
    pub fn challenge(&self, kind: api::ChallengeType) -> Option<&api::Challenge> {
        self.challenges.iter().find(|chall| chall._type == kind)
    }
}

/// Payload of a POST to an authorization URL.
///
/// Only deactivation is accepted, see [RFC 8555 §7.5.2].
///
/// [RFC 8555 §7.5.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.5.2
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationUpdate {
    pub status: AuthorizationStatus,
}
