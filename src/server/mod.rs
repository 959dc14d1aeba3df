//! HTTP surface of the protocol engine.
//!
//! Listeners speak plain HTTP; resource URLs are derived from the scheme and host each request
//! arrives with, so the server works behind a TLS-terminating proxy as well as directly.

use std::{io, net::TcpListener, sync::Arc};

use actix_web::{
    dev::{Server, Service as _},
    http::{
        header::{self, HeaderName, HeaderValue},
        StatusCode,
    },
    web, App, HttpRequest, HttpResponse, HttpServer,
};

use crate::{
    api::Problem,
    protocol::{Protocol, Urls},
};

mod management;

pub use self::management::{run_management, ROOT_CERT_PATH};

const REPLAY_NONCE: &str = "replay-nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

/// Starts serving the ACME endpoints on `listener`.
///
/// The returned server must be awaited (or spawned) to make progress.
pub fn run(proto: Arc<Protocol>, listener: TcpListener) -> io::Result<Server> {
    let data = web::Data::from(proto);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap_fn(|req, srv| {
                let nonce = req
                    .app_data::<web::Data<Protocol>>()
                    .map(|proto| proto.new_nonce());
                let index = format!("<{}>;rel=\"index\"", urls(req.request()).directory());

                let res = srv.call(req);

                async move {
                    let mut res = res.await?;
                    let headers = res.headers_mut();

                    if let Some(nonce) = nonce.and_then(|n| HeaderValue::from_str(&n).ok()) {
                        headers.insert(HeaderName::from_static(REPLAY_NONCE), nonce);
                    }
                    if let Ok(index) = HeaderValue::from_str(&index) {
                        headers.append(header::LINK, index);
                    }

                    Ok(res)
                }
            })
            .configure(routes)
            .default_service(web::to(|| async {
                Err::<HttpResponse, _>(Problem::not_found("no such resource"))
            }))
    })
    .listen(listener)?
    .shutdown_timeout(0);

    Ok(server.run())
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/directory", web::get().to(directory))
        .service(
            web::resource("/acme/new-nonce")
                .route(web::head().to(new_nonce))
                .route(web::get().to(new_nonce)),
        )
        .route("/acme/new-acct", web::post().to(new_account))
        .route("/acme/new-order", web::post().to(new_order))
        .route("/acme/key-change", web::post().to(key_change))
        .route("/acme/revoke-cert", web::post().to(revoke_cert))
        .route("/acme/acct/{id}", web::post().to(account))
        .route("/acme/acct/{id}/orders", web::post().to(account_orders))
        .service(
            web::resource("/acme/order/{id}")
                .route(web::get().to(order))
                .route(web::post().to(order)),
        )
        .route("/acme/finalize/{id}", web::post().to(finalize))
        .service(
            web::resource("/acme/authz/{id}")
                .route(web::get().to(authorization))
                .route(web::post().to(authorization)),
        )
        .service(
            web::resource("/acme/chall/{id}")
                .route(web::get().to(challenge))
                .route(web::post().to(challenge)),
        )
        .service(
            web::resource("/acme/cert/{id}")
                .route(web::get().to(certificate))
                .route(web::post().to(certificate)),
        )
        .service(
            web::resource("/acme/cert/{id}/{index}")
                .route(web::get().to(certificate))
                .route(web::post().to(certificate)),
        );
}

fn urls(req: &HttpRequest) -> Urls {
    let info = req.connection_info();
    Urls::new(format!("{}://{}", info.scheme(), info.host()))
}

/// Request body of a POST, `None` for a GET.
///
/// In strict mode a POST must be labelled `application/jose+json`.
fn jws_body<'a>(
    proto: &Protocol,
    req: &HttpRequest,
    body: &'a web::Bytes,
) -> Result<Option<&'a [u8]>, Problem> {
    if req.method() != actix_web::http::Method::POST {
        return Ok(None);
    }

    if proto.is_strict() {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        if content_type != JOSE_JSON {
            return Err(Problem::malformed(format!(
                "expected Content-Type {JOSE_JSON}, got {content_type:?}"
            ))
            .with_status(415));
        }
    }

    Ok(Some(body))
}

/// Like [`jws_body`], for endpoints that only accept POST.
fn post_body<'a>(
    proto: &Protocol,
    req: &HttpRequest,
    body: &'a web::Bytes,
) -> Result<&'a [u8], Problem> {
    jws_body(proto, req, body)?
        .ok_or_else(|| Problem::malformed("method not allowed").with_status(405))
}

async fn directory(proto: web::Data<Protocol>, req: HttpRequest) -> HttpResponse {
    HttpResponse::Ok().json(proto.directory(&urls(&req)))
}

async fn new_nonce(req: HttpRequest) -> HttpResponse {
    let status = if req.method() == actix_web::http::Method::GET {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    };

    HttpResponse::build(status)
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .finish()
}

async fn new_account(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let body = post_body(&proto, &req, &body)?;
    let (account, location, created) = proto.new_account(&urls(&req), body)?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok(HttpResponse::build(status)
        .insert_header((header::LOCATION, location))
        .json(account))
}

async fn account(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    id: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let body = post_body(&proto, &req, &body)?;
    let account = proto.account(&urls(&req), &id, body)?;
    Ok(HttpResponse::Ok().json(account))
}

async fn account_orders(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    id: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let body = post_body(&proto, &req, &body)?;
    let orders = proto.account_orders(&urls(&req), &id, body)?;
    Ok(HttpResponse::Ok().json(orders))
}

async fn key_change(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let body = post_body(&proto, &req, &body)?;
    let account = proto.key_change(&urls(&req), body)?;
    Ok(HttpResponse::Ok().json(account))
}

async fn new_order(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let body = post_body(&proto, &req, &body)?;
    let (order, location) = proto.new_order(&urls(&req), body)?;

    Ok(HttpResponse::Created()
        .insert_header((header::LOCATION, location))
        .json(order))
}

async fn order(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    id: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let body = jws_body(&proto, &req, &body)?;
    let order = proto.order(&urls(&req), &id, body)?;
    Ok(HttpResponse::Ok().json(order))
}

async fn finalize(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    id: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    post_body(&proto, &req, &body)?;
    let urls = urls(&req);
    let id = id.into_inner();

    // certificate signing runs off the worker thread
    let order = web::block({
        let urls = urls.clone();
        let id = id.clone();
        move || proto.finalize(&urls, &id, &body)
    })
    .await
    .map_err(|err| Problem::server_internal(format!("finalize did not complete: {err}")))??;

    Ok(HttpResponse::Ok()
        .insert_header((header::LOCATION, urls.order(&id)))
        .json(order))
}

async fn authorization(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    id: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let body = jws_body(&proto, &req, &body)?;
    let authz = proto.authorization(&urls(&req), &id, body)?;
    Ok(HttpResponse::Ok().json(authz))
}

async fn challenge(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    id: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let body = jws_body(&proto, &req, &body)?;
    let proto = proto.into_inner();
    let (chall, up) = proto.challenge(&urls(&req), &id, body)?;

    Ok(HttpResponse::Ok()
        .append_header((header::LINK, format!("<{up}>;rel=\"up\"")))
        .json(chall))
}

async fn certificate(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let id = req.match_info().query("id");
    let index = match req.match_info().get("index") {
        Some(index) => index
            .parse::<usize>()
            .map_err(|_| Problem::not_found(format!("no certificate chain with index {index}")))?,
        None => 0,
    };

    let body = jws_body(&proto, &req, &body)?;
    let download = proto.certificate(&urls(&req), id, index, body)?;

    let mut res = HttpResponse::Ok();
    res.content_type(PEM_CHAIN);

    for alternate in &download.alternates {
        res.append_header((header::LINK, format!("<{alternate}>;rel=\"alternate\"")));
    }

    Ok(res.body(download.pem))
}

async fn revoke_cert(
    proto: web::Data<Protocol>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, Problem> {
    let body = post_body(&proto, &req, &body)?;
    proto.revoke_certificate(&urls(&req), body)?;
    Ok(HttpResponse::Ok().finish())
}
