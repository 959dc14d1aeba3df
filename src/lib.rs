//! A self-contained ACME ([RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555)) server for
//! testing ACME clients.
//!
//! Everything lives in memory and is gone when the process exits: accounts, orders,
//! authorizations, challenges, and the certificate authority itself, whose roots and
//! intermediates are generated at startup unless an external CA is supplied.
//!
//! # Components
//!
//! - [`store::Store`] holds every protocol entity behind opaque identifiers.
//! - [`Protocol`] authenticates JWS requests, redeems nonces, and drives the order,
//!   authorization, and challenge state machines.
//! - [`ValidationEngine`] runs `http-01`, `tls-alpn-01`, and `dns-01` probes in the background,
//!   each bounded by a timeout, reporting outcomes back through the store.
//! - [`issuance::CertificateAuthority`] signs leaf certificates, serves chains (including
//!   alternate roots), and tracks revocation.
//! - [`server`] exposes the protocol over HTTP with `actix-web`, plus a separate management
//!   interface serving root certificates and certificate status.
//!
//! # Identifiers
//!
//! Orders may contain `dns` identifiers, including a single leftmost wildcard label which can
//! only be validated with `dns-01`, and `ip` identifiers ([RFC 8738]), validated with `http-01`
//! or `tls-alpn-01`.
//!
//! # Not For Production
//!
//! Issued certificates chain to throwaway roots. Nothing is persisted, and there are no rate
//! limits besides the per-challenge retry bound.
//!
//! [RFC 8738]: https://datatracker.ietf.org/doc/html/rfc8738

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod cert;
mod util;

pub mod api;
pub mod config;
pub mod issuance;
pub mod jws;
pub mod protocol;
pub mod server;
pub mod store;
pub mod validation;


pub use crate::{
    cert::{create_p256_key, verify_csr, VerifiedCsr},
    protocol::{Protocol, ProtocolConfig, Urls},
    validation::{ValidationConfig, ValidationEngine},
};
