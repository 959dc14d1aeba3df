use serde::{Deserialize, Serialize};

use crate::jws::Jwk;

/// Payload of the inner JWS of a key rollover request.
///
/// The outer JWS is signed by the current account key; the inner JWS is signed by the new key and
/// carries it in its `jwk` header.
///
/// See [RFC 8555 §7.3.5].
///
/// [RFC 8555 §7.3.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.5
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChange {
    /// URL of the account being modified.
    pub account: String,

    /// Key currently bound to the account.
    pub old_key: Jwk,
}
