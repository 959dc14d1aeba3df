use time::OffsetDateTime;

use crate::{
    api::{
        AccountStatus, AuthorizationStatus, ChallengeStatus, ChallengeType, Identifier,
        OrderStatus, Problem, RevocationReason,
    },
    jws::Jwk,
};

/// A registered account.
#[derive(Debug, Clone)]
pub struct AccountEntry {
    pub id: String,
    pub key: Jwk,
    pub contact: Vec<String>,
    pub status: AccountStatus,
    pub terms_of_service_agreed: bool,

    /// External account key this account was bound to at creation.
    pub eab_key_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderEntry {
    pub id: String,
    pub account_id: String,

    /// Insertion sequence; orders of an account are listed in this order.
    pub seq: u64,

    pub identifiers: Vec<Identifier>,
    pub status: OrderStatus,
    pub expires: OffsetDateTime,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
    pub authorizations: Vec<String>,
    pub certificate: Option<String>,
    pub error: Option<Problem>,
}

#[derive(Debug, Clone)]
pub struct AuthorizationEntry {
    pub id: String,
    pub account_id: String,
    pub identifier: Identifier,
    pub wildcard: bool,
    pub status: AuthorizationStatus,
    pub expires: OffsetDateTime,
    pub challenges: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ChallengeEntry {
    pub id: String,
    pub authorization_id: String,
    pub kind: ChallengeType,
    pub token: String,
    pub status: ChallengeStatus,
    pub error: Option<Problem>,
    pub validated: Option<OffsetDateTime>,
    pub last_attempt: Option<OffsetDateTime>,

    /// Number of validation attempts dispatched so far.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct CertificateEntry {
    pub id: String,
    pub account_id: String,
    pub order_id: String,

    /// Leaf certificate, DER.
    pub der: Vec<u8>,

    /// Lowercase hex, no leading zero stripping.
    pub serial: String,

    /// DER SubjectPublicKeyInfo of the certified key.
    pub public_key: Vec<u8>,

    pub identifiers: Vec<Identifier>,
    pub issued: OffsetDateTime,
    pub expires: OffsetDateTime,
    pub revocation: Option<RevocationEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevocationEntry {
    pub reason: RevocationReason,
    pub revoked_at: OffsetDateTime,
}
