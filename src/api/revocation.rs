use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::api::{Problem, ProblemType};

/// Certificate revocation request.
///
/// See [RFC 8555 §7.6].
///
/// [RFC 8555 §7.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.6
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    /// The certificate to be revoked, in the base64url-encoded version of the DER format.
    ///
    /// Note: not PEM, since headers are omitted.
    pub certificate: String,

    /// One of the revocation reasonCodes defined in [RFC 5280 §5.3.1].
    ///
    /// [RFC 5280 §5.3.1]: https://datatracker.ietf.org/doc/html/rfc5280#section-5.3.1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<u8>,
}

impl Revocation {
    pub fn certificate_der(&self) -> Result<Vec<u8>, Problem> {
        BASE64_URL_SAFE_NO_PAD
            .decode(self.certificate.trim_end_matches('='))
            .map_err(|err| {
                Problem::malformed(format!("certificate is not valid base64url: {err}"))
            })
    }

    /// The requested reason, with an absent reason meaning `unspecified`.
    pub fn reason(&self) -> Result<RevocationReason, Problem> {
        match self.reason {
            None => Ok(RevocationReason::Unspecified),
            Some(code) => RevocationReason::from_code(code).ok_or_else(|| {
                Problem::new(
                    ProblemType::BadRevocationReason,
                    format!("unsupported revocation reason code: {code}"),
                )
            }),
        }
    }
}

/// Enumeration of reasons for revocation.
///
/// The reason codes are taken from [RFC 5280 §5.3.1].
///
/// [RFC 5280 §5.3.1]: https://tools.ietf.org/html/rfc5280#section-5.3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RevocationReason {
    Unspecified = 0,
    KeyCompromise = 1,
    CACompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    // value 7 is not used
    RemoveFromCRL = 8,
    PrivilegeWithdrawn = 9,
    AACompromise = 10,
}

impl RevocationReason {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => RevocationReason::Unspecified,
            1 => RevocationReason::KeyCompromise,
            2 => RevocationReason::CACompromise,
            3 => RevocationReason::AffiliationChanged,
            4 => RevocationReason::Superseded,
            5 => RevocationReason::CessationOfOperation,
            6 => RevocationReason::CertificateHold,
            8 => RevocationReason::RemoveFromCRL,
            9 => RevocationReason::PrivilegeWithdrawn,
            10 => RevocationReason::AACompromise,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revocation(reason: Option<u8>) -> Revocation {
        Revocation {
            certificate: String::new(),
            reason,
        }
    }

    #[test]
    fn reason_codes() {
        let absent = revocation(None);
        assert_eq!(absent.reason().unwrap(), RevocationReason::Unspecified);

        let superseded = revocation(Some(4));
        assert_eq!(superseded.reason().unwrap(), RevocationReason::Superseded);

        let unused = revocation(Some(7));
        assert!(unused
            .reason()
            .unwrap_err()
            .is_type(ProblemType::BadRevocationReason));
    }
}
