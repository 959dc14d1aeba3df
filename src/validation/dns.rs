//! DNS-01, see [RFC 8555 §8.4](https://datatracker.ietf.org/doc/html/rfc8555#section-8.4).

use std::net::SocketAddr;

use hickory_resolver::{
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    proto::op::ResponseCode,
    TokioAsyncResolver,
};

use super::{dns_txt_value, ValidationError};
use crate::api::Identifier;

/// Builds the resolver all validation lookups share.
///
/// A configured server is queried directly and answers are never cached, so records changed
/// between attempts are seen immediately.
pub(super) fn resolver(dns_server: Option<SocketAddr>) -> eyre::Result<TokioAsyncResolver> {
    let Some(addr) = dns_server else {
        return Ok(match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(err) => {
                log::warn!("cannot read system resolver configuration ({err}); using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        });
    };

    let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
    let config = ResolverConfig::from_parts(None, vec![], group);

    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;

    Ok(TokioAsyncResolver::tokio(config, opts))
}

pub(super) async fn validate(
    resolver: &TokioAsyncResolver,
    identifier: &Identifier,
    key_authorization: &str,
) -> Result<(), ValidationError> {
    let name = format!("_acme-challenge.{}.", identifier.base_domain());
    let expected = dns_txt_value(key_authorization);

    let lookup = resolver.txt_lookup(name.as_str()).await.map_err(|err| {
        ValidationError::Dns(match err.kind() {
            ResolveErrorKind::NoRecordsFound {
                response_code: ResponseCode::NXDomain,
                ..
            } => format!("NXDOMAIN looking up TXT for {name}"),
            ResolveErrorKind::NoRecordsFound { .. } => format!("no TXT records found for {name}"),
            ResolveErrorKind::Timeout => format!("timeout looking up TXT for {name}"),
            _ => format!("DNS problem looking up TXT for {name}: {err}"),
        })
    })?;

    let mut found = 0;

    for txt in lookup.iter() {
        let value = txt.txt_data().concat();
        if value == expected.as_bytes() {
            return Ok(());
        }
        found += 1;
    }

    Err(ValidationError::Unauthorized(format!(
        "correct value not found for DNS challenge: expected {expected:?} among {found} TXT \
         record(s) for {name}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::spawn_dns_responder;

    #[tokio::test]
    async fn finds_matching_record() {
        let key_auth = "tok.thumb";
        let dns = spawn_dns_responder(vec![
            ("_acme-challenge.example.test.", "unrelated".to_owned()),
            ("_acme-challenge.example.test.", dns_txt_value(key_auth)),
        ])
        .await;
        let resolver = resolver(Some(dns.addr)).unwrap();

        validate(&resolver, &Identifier::dns("example.test"), key_auth)
            .await
            .unwrap();

        // wildcard identifiers are validated at their base domain
        validate(&resolver, &Identifier::dns("*.example.test"), key_auth)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wrong_value_is_unauthorized() {
        let dns = spawn_dns_responder(vec![(
            "_acme-challenge.example.test.",
            dns_txt_value("tok.other"),
        )])
        .await;
        let resolver = resolver(Some(dns.addr)).unwrap();

        let err = validate(&resolver, &Identifier::dns("example.test"), "tok.thumb")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Unauthorized(_)), "{err:?}");
    }

    #[tokio::test]
    async fn nxdomain_is_a_dns_error() {
        let dns = spawn_dns_responder(vec![]).await;
        let resolver = resolver(Some(dns.addr)).unwrap();

        let err = validate(&resolver, &Identifier::dns("missing.test"), "tok.thumb")
            .await
            .unwrap_err();

        match err {
            ValidationError::Dns(detail) => assert!(detail.contains("NXDOMAIN"), "{detail}"),
            err => panic!("unexpected error: {err:?}"),
        }
    }
}
