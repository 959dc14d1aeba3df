//! HTTP-01, see [RFC 8555 §8.3](https://datatracker.ietf.org/doc/html/rfc8555#section-8.3).

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use hickory_resolver::TokioAsyncResolver;
use reqwest::{
    dns::{Addrs, Name, Resolve, Resolving},
    redirect::Policy,
    StatusCode,
};

use super::{error_chain, ValidationError};
use crate::api::Identifier;

/// Responses larger than this are not key authorizations.
const MAX_BODY_LEN: usize = 64 * 1024;

/// Routes reqwest's host lookups through a configured DNS server.
struct HickoryResolve(TokioAsyncResolver);

impl Resolve for HickoryResolve {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.0.clone();

        Box::pin(async move {
            let lookup = resolver.lookup_ip(name.as_str()).await?;

            let addrs: Addrs = Box::new(
                lookup
                    .iter()
                    .map(|addr| SocketAddr::new(addr, 0))
                    .collect::<Vec<_>>()
                    .into_iter(),
            );

            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

pub(super) fn client(
    max_redirects: usize,
    resolver: Option<TokioAsyncResolver>,
) -> eyre::Result<reqwest::Client> {
    let policy = Policy::custom(move |attempt| {
        // `previous` includes the original request
        if attempt.previous().len() > max_redirects {
            attempt.error(format!("too many redirects (limit is {max_redirects})"))
        } else if !matches!(attempt.url().scheme(), "http" | "https") {
            let scheme = attempt.url().scheme().to_owned();
            attempt.error(format!("redirect to unsupported scheme {scheme:?}"))
        } else {
            attempt.follow()
        }
    });

    let mut builder = reqwest::Client::builder()
        .redirect(policy)
        .no_proxy()
        .danger_accept_invalid_certs(true)
        .user_agent(concat!("acme-testsrv/", env!("CARGO_PKG_VERSION")));

    if let Some(resolver) = resolver {
        builder = builder.dns_resolver(Arc::new(HickoryResolve(resolver)));
    }

    Ok(builder.build()?)
}

pub(super) async fn validate(
    client: &reqwest::Client,
    identifier: &Identifier,
    port: u16,
    token: &str,
    key_authorization: &str,
) -> Result<(), ValidationError> {
    let host = match identifier.ip_addr() {
        Some(IpAddr::V6(addr)) => format!("[{addr}]"),
        _ => identifier.value.clone(),
    };
    let url = format!("http://{host}:{port}/.well-known/acme-challenge/{token}");

    let mut res = client
        .get(&url)
        .send()
        .await
        .map_err(|err| {
            ValidationError::Connection(format!("fetching {url}: {}", error_chain(&err)))
        })?;

    if res.status() != StatusCode::OK {
        return Err(ValidationError::Unauthorized(format!(
            "invalid response from {url}: status {}",
            res.status()
        )));
    }

    let too_large = || {
        ValidationError::IncorrectResponse(format!(
            "response from {url} is larger than {MAX_BODY_LEN} bytes"
        ))
    };

    if res
        .content_length()
        .is_some_and(|len| len > MAX_BODY_LEN as u64)
    {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = res.chunk().await.map_err(|err| {
        ValidationError::Connection(format!("reading {url}: {}", error_chain(&err)))
    })? {
        if body.len() + chunk.len() > MAX_BODY_LEN {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }

    let body = std::str::from_utf8(&body).map_err(|_| {
        ValidationError::IncorrectResponse(format!("response from {url} is not UTF-8"))
    })?;

    if body.trim() != key_authorization {
        return Err(ValidationError::Unauthorized(format!(
            "the key authorization file from the server did not match this challenge: \
             expected {key_authorization:?}, got {:?}",
            body.trim()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test::{spawn_endless_http_responder, spawn_http_responder};

    fn localhost() -> Identifier {
        Identifier::ip("127.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn serves_matching_key_authorization() {
        let responder = spawn_http_responder("tok", "tok.thumb").await;
        let client = client(3, None).unwrap();

        validate(&client, &localhost(), responder.port, "tok", "tok.thumb")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn body_mismatch_is_unauthorized() {
        let responder = spawn_http_responder("tok", "tok.someone-else").await;
        let client = client(3, None).unwrap();

        let err = validate(&client, &localhost(), responder.port, "tok", "tok.thumb")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Unauthorized(_)), "{err:?}");
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let responder = spawn_http_responder("tok", "tok.thumb").await;
        let client = client(3, None).unwrap();

        let err = validate(&client, &localhost(), responder.port, "other", "other.thumb")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Unauthorized(_)), "{err:?}");
    }

    #[tokio::test]
    async fn redirect_loops_are_bounded() {
        let responder = spawn_http_responder("tok", "tok.thumb").await;
        let client = client(2, None).unwrap();

        let err = validate(&client, &localhost(), responder.port, "loop", "loop.thumb")
            .await
            .unwrap_err();

        match err {
            ValidationError::Connection(detail) => {
                assert!(detail.contains("too many redirects"), "{detail}")
            }
            err => panic!("unexpected error: {err:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let body = "a".repeat(MAX_BODY_LEN + 1);
        let responder = spawn_http_responder("tok", &body).await;
        let client = client(3, None).unwrap();

        let err = validate(&client, &localhost(), responder.port, "tok", "tok.thumb")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::IncorrectResponse(_)), "{err:?}");
    }

    #[tokio::test]
    async fn endless_body_is_cut_off() {
        let responder = spawn_endless_http_responder().await;
        let client = client(3, None).unwrap();

        let res = tokio::time::timeout(
            Duration::from_secs(10),
            validate(&client, &localhost(), responder.port, "tok", "tok.thumb"),
        )
        .await
        .unwrap();

        let err = res.unwrap_err();
        assert!(matches!(err, ValidationError::IncorrectResponse(_)), "{err:?}");
    }
}
