//! JWS request envelopes.
//!
//! See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use hmac::{Hmac, Mac as _};
use p256::{
    ecdsa::{signature::Verifier as _, Signature, VerifyingKey},
    EncodedPoint,
};
use serde::{de, Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::api::{Problem, ProblemType};

/// JWT Protected Header scheme as defined in [RFC 8555 §6.2].
///
/// > For newAccount requests, and for revokeCert requests authenticated by a certificate key,
/// there MUST be a "jwk" field. This field MUST contain the public key corresponding to the
/// private key used to sign the JWS.
/// >
/// > For all other requests, the request is signed using an existing account, and there MUST be a
/// "kid" field. This field MUST contain the account URL received by POSTing to the newAccount
/// resource.
///
/// [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct JwsProtectedHeader {
    /// Algorithm.
    ///
    /// Only "ES256" is accepted for request signatures; external account bindings use HMAC.
    pub alg: String,

    /// Anti-replay nonce, as defined in [RFC 8555 §6.5].
    ///
    /// [RFC 8555 §6.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.5
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// The URL this JWS is directed at, see [RFC 8555 §6.4].
    ///
    /// [RFC 8555 §6.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.4
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// JSON Web Key.
    ///
    /// Mutually exclusive with `kid` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,

    /// Key ID.
    ///
    /// Mutually exclusive with `jwk` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

#[cfg(test)]
impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: Option<String>) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: Some(url.to_owned()),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: Option<String>) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: Some(url.to_owned()),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

/// A P-256 public key in JWK form.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Jwk {
    kty: String,
    crv: String,
    x: String,
    y: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    alg: Option<String>,

    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    _use: Option<String>,
}

impl Jwk {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);

        // an uncompressed, non-identity point always carries both coordinates
        let x = point.x().map(|x| x.as_slice()).unwrap_or_default();
        let y = point.y().map(|y| y.as_slice()).unwrap_or_default();

        Jwk {
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
            alg: None,
            _use: None,
        }
    }

    /// Decodes the key into a usable verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, Problem> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(Problem::new(
                ProblemType::BadPublicKey,
                format!("unsupported key type {}/{}", self.kty, self.crv),
            ));
        }

        let coordinate = |value: &str| {
            BASE64_URL_SAFE_NO_PAD
                .decode(value)
                .ok()
                .filter(|bytes| bytes.len() == 32)
                .ok_or_else(|| {
                    Problem::new(ProblemType::BadPublicKey, "invalid EC point coordinate")
                })
        };

        let x = coordinate(&self.x)?;
        let y = coordinate(&self.y)?;

        let point = EncodedPoint::from_affine_coordinates(
            x.as_slice().into(),
            y.as_slice().into(),
            false,
        );

        VerifyingKey::from_encoded_point(&point)
            .map_err(|_| Problem::new(ProblemType::BadPublicKey, "EC point is not on P-256"))
    }

    /// Base64url-encoded SHA-256 thumbprint as defined in [RFC 7638].
    ///
    /// [RFC 7638]: https://datatracker.ietf.org/doc/html/rfc7638
    pub fn thumbprint(&self) -> String {
        let thumb = JwkThumb::from(self);

        // serializing four owned strings cannot fail
        let json = serde_json::to_string(&thumb).unwrap_or_default();

        BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(json))
    }

    /// Returns true if both JWKs describe the same public key.
    pub fn same_key(&self, other: &Jwk) -> bool {
        self.thumbprint() == other.thumbprint()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) struct JwkThumb {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(a: &Jwk) -> Self {
        JwkThumb {
            crv: a.crv.clone(),
            kty: a.kty.clone(),
            x: a.x.clone(),
            y: a.y.clone(),
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

impl FlattenedJsonJws {
    pub fn new(protected: String, payload: String, signature: String) -> Self {
        FlattenedJsonJws {
            protected,
            payload,
            signature,
        }
    }

    /// Decodes the base64url parts without verifying anything.
    pub fn decode(&self) -> Result<SignedRequest, Problem> {
        let decode = |part: &str, what: &str| {
            BASE64_URL_SAFE_NO_PAD
                .decode(part)
                .map_err(|err| Problem::malformed(format!("JWS {what} is not base64url: {err}")))
        };

        let header = decode(&self.protected, "protected header")?;
        let header = serde_json::from_slice::<JwsProtectedHeader>(&header)
            .map_err(|err| Problem::malformed(format!("invalid JWS protected header: {err}")))?;

        Ok(SignedRequest {
            header,
            payload: decode(&self.payload, "payload")?,
            signing_input: format!("{}.{}", self.protected, self.payload),
            signature: decode(&self.signature, "signature")?,
        })
    }
}

/// A decoded, not yet verified, JWS request.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub header: JwsProtectedHeader,
    pub payload: Vec<u8>,
    signing_input: String,
    signature: Vec<u8>,
}

impl SignedRequest {
    /// Parses a flattened JSON JWS request body.
    pub fn parse(body: &[u8]) -> Result<Self, Problem> {
        let jws = serde_json::from_slice::<FlattenedJsonJws>(body)
            .map_err(|err| Problem::malformed(format!("request is not a flattened JWS: {err}")))?;

        jws.decode()
    }

    /// Verifies the ES256 signature against `key`.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), Problem> {
        if self.header.alg != "ES256" {
            return Err(Problem::new(
                ProblemType::BadSignatureAlgorithm,
                format!("unsupported JWS algorithm: {}", self.header.alg),
            ));
        }

        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| Problem::malformed("JWS verification error"))?;

        key.verify(self.signing_input.as_bytes(), &signature)
            .map_err(|_| Problem::malformed("JWS verification error"))
    }

    /// Returns true for a POST-as-GET request, i.e. one with an empty payload.
    pub fn is_post_as_get(&self) -> bool {
        self.payload.is_empty()
    }

    /// Deserializes the payload.
    pub fn json<T: de::DeserializeOwned>(&self) -> Result<T, Problem> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| Problem::malformed(format!("invalid request payload: {err}")))
    }
}

/// Verifies an external account binding and returns the external key ID it was made with.
///
/// See [RFC 8555 §7.3.4].
///
/// [RFC 8555 §7.3.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.4
pub fn verify_external_account_binding<'a>(
    eab: &FlattenedJsonJws,
    account_key: &Jwk,
    url: &str,
    mac_key: impl FnOnce(&str) -> Option<&'a [u8]>,
) -> Result<String, Problem> {
    let binding = eab.decode()?;

    if binding.header.nonce.is_some() {
        return Err(Problem::malformed(
            "external account binding must not contain a nonce",
        ));
    }

    if binding.header.url.as_deref() != Some(url) {
        return Err(Problem::malformed(
            "external account binding URL does not match the request URL",
        ));
    }

    let kid = binding
        .header
        .kid
        .as_deref()
        .ok_or_else(|| Problem::malformed("external account binding is missing a key ID"))?;

    let key = mac_key(kid).ok_or_else(|| {
        Problem::unauthorized(format!("unknown external account binding key ID: {kid}"))
    })?;

    let bound_key = binding.json::<Jwk>()?;
    if !bound_key.same_key(account_key) {
        return Err(Problem::unauthorized(
            "external account binding does not match the account key",
        ));
    }

    let input = binding.signing_input.as_bytes();
    let tag = binding.signature.as_slice();

    let verified = match binding.header.alg.as_str() {
        "HS256" => Hmac::<Sha256>::new_from_slice(key)
            .map(|mac| mac.chain_update(input).verify_slice(tag).is_ok()),
        "HS384" => Hmac::<Sha384>::new_from_slice(key)
            .map(|mac| mac.chain_update(input).verify_slice(tag).is_ok()),
        "HS512" => Hmac::<Sha512>::new_from_slice(key)
            .map(|mac| mac.chain_update(input).verify_slice(tag).is_ok()),
        alg => {
            return Err(Problem::new(
                ProblemType::BadSignatureAlgorithm,
                format!("unsupported external account binding algorithm: {alg}"),
            ))
        }
    };

    if verified != Ok(true) {
        return Err(Problem::unauthorized(
            "external account binding signature verification failed",
        ));
    }

    Ok(kid.to_owned())
}
