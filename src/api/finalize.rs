use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::api::Problem;

/// Finalize request carrying a signed CSR.
///
/// See [RFC 8555 §7.4].
///
/// [RFC 8555 §7.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.4
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalize {
    /// Certificate Signing Request (CSR) in base64url-encoded DER.
    ///
    /// Note: not PEM, since headers are omitted.
    pub csr: String,
}

impl Finalize {
    /// Decodes the CSR field into DER bytes.
    pub fn csr_der(&self) -> Result<Vec<u8>, Problem> {
        BASE64_URL_SAFE_NO_PAD
            .decode(self.csr.trim_end_matches('='))
            .map_err(|err| Problem::malformed(format!("CSR is not valid base64url: {err}")))
    }
}
