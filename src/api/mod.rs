//! JSON API payloads.
//!
//! Wire documents exchanged with ACME clients, plus the RFC 7807 problem document used for every
//! error response.

use std::fmt;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::{ser::Serializer, Deserialize, Serialize};

mod account;
mod authorization;
mod challenge;
mod directory;
mod finalize;
mod identifier;
mod key_change;
mod order;
mod revocation;

pub use self::{
    account::{Account, AccountStatus, AccountUpdate, NewAccount, OrderList},
    authorization::{Authorization, AuthorizationStatus, AuthorizationUpdate},
    challenge::{Challenge, ChallengeStatus, ChallengeType},
    directory::{Directory, DirectoryMeta},
    finalize::Finalize,
    identifier::Identifier,
    key_change::KeyChange,
    order::{NewOrder, Order, OrderStatus},
    revocation::{Revocation, RevocationReason},
};

/// Serializes to `""`.
pub struct EmptyString;

impl Serialize for EmptyString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

/// Error types defined in [RFC 8555 §6.7].
///
/// The last four variants are only ever recorded on challenges as validation causes.
///
/// [RFC 8555 §6.7]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemType {
    AccountDoesNotExist,
    AlreadyRevoked,
    BadCsr,
    BadNonce,
    BadPublicKey,
    BadRevocationReason,
    BadSignatureAlgorithm,
    ExternalAccountRequired,
    InvalidContact,
    Malformed,
    OrderNotReady,
    RateLimited,
    RejectedIdentifier,
    ServerInternal,
    Unauthorized,
    UnsupportedContact,
    UnsupportedIdentifier,

    Connection,
    Dns,
    IncorrectResponse,
    Tls,
}

impl ProblemType {
    const URN_PREFIX: &'static str = "urn:ietf:params:acme:error:";

    fn name(self) -> &'static str {
        match self {
            ProblemType::AccountDoesNotExist => "accountDoesNotExist",
            ProblemType::AlreadyRevoked => "alreadyRevoked",
            ProblemType::BadCsr => "badCSR",
            ProblemType::BadNonce => "badNonce",
            ProblemType::BadPublicKey => "badPublicKey",
            ProblemType::BadRevocationReason => "badRevocationReason",
            ProblemType::BadSignatureAlgorithm => "badSignatureAlgorithm",
            ProblemType::ExternalAccountRequired => "externalAccountRequired",
            ProblemType::InvalidContact => "invalidContact",
            ProblemType::Malformed => "malformed",
            ProblemType::OrderNotReady => "orderNotReady",
            ProblemType::RateLimited => "rateLimited",
            ProblemType::RejectedIdentifier => "rejectedIdentifier",
            ProblemType::ServerInternal => "serverInternal",
            ProblemType::Unauthorized => "unauthorized",
            ProblemType::UnsupportedContact => "unsupportedContact",
            ProblemType::UnsupportedIdentifier => "unsupportedIdentifier",
            ProblemType::Connection => "connection",
            ProblemType::Dns => "dns",
            ProblemType::IncorrectResponse => "incorrectResponse",
            ProblemType::Tls => "tls",
        }
    }

    /// Full URN, e.g. `urn:ietf:params:acme:error:badNonce`.
    pub fn urn(self) -> String {
        format!("{}{}", Self::URN_PREFIX, self.name())
    }

    fn default_status(self) -> u16 {
        match self {
            ProblemType::Unauthorized | ProblemType::OrderNotReady => 403,
            ProblemType::RateLimited => 429,
            ProblemType::ServerInternal => 500,
            _ => 400,
        }
    }
}

/// Problem document as defined in [RFC 7807] and [RFC 8555 §6.7].
///
/// [RFC 7807]: https://datatracker.ietf.org/doc/html/rfc7807
/// [RFC 8555 §6.7]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.7
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    pub fn new(kind: ProblemType, detail: impl Into<String>) -> Self {
        Problem {
            _type: kind.urn(),
            detail: Some(detail.into()),
            status: Some(kind.default_status()),
            subproblems: None,
        }
    }

    /// Overrides the HTTP status implied by the problem type.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_subproblems(mut self, subproblems: Vec<Subproblem>) -> Self {
        self.subproblems = Some(subproblems);
        self
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Problem::new(ProblemType::Malformed, detail)
    }

    pub fn bad_nonce(detail: impl Into<String>) -> Self {
        Problem::new(ProblemType::BadNonce, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Problem::new(ProblemType::Unauthorized, detail)
    }

    pub fn server_internal(detail: impl Into<String>) -> Self {
        Problem::new(ProblemType::ServerInternal, detail)
    }

    /// Unknown resource.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Problem::malformed(detail).with_status(404)
    }

    /// Request conflicts with the current state of the resource.
    pub fn conflict(detail: impl Into<String>) -> Self {
        Problem::malformed(detail).with_status(409)
    }

    /// Returns true if the problem has the given type.
    pub fn is_type(&self, kind: ProblemType) -> bool {
        self._type == kind.urn()
    }

    /// Returns true if problem type is "badNonce".
    pub fn is_bad_nonce(&self) -> bool {
        self.is_type(ProblemType::BadNonce)
    }

    fn http_status(&self) -> StatusCode {
        self.status
            .and_then(|status| StatusCode::from_u16(status).ok())
            .unwrap_or(StatusCode::BAD_REQUEST)
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type),
            _ => write!(f, "{}", self._type),
        }
    }
}

impl std::error::Error for Problem {}

impl ResponseError for Problem {
    fn status_code(&self) -> StatusCode {
        self.http_status()
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.http_status())
            .content_type("application/problem+json")
            .json(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<identifier::Identifier>,
}

impl Subproblem {
    pub fn new(kind: ProblemType, detail: impl Into<String>, identifier: &Identifier) -> Self {
        Subproblem {
            _type: kind.urn(),
            detail: Some(detail.into()),
            identifier: Some(identifier.clone()),
        }
    }
}
