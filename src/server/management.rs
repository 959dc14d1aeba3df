use std::{io, net::TcpListener, sync::Arc};

use actix_web::{dev::Server, web, App, HttpResponse, HttpServer};

use crate::{api::Problem, issuance::CertificateAuthority};

/// Path prefix the root certificate of chain `n` is served under, e.g. `/roots/0`.
pub const ROOT_CERT_PATH: &str = "/roots/";

/// Starts the management interface on `listener`.
///
/// Serves the trust anchors of every chain, their leaf-issuing intermediates, and certificate
/// status lookups by hex serial number.
pub fn run_management(ca: Arc<CertificateAuthority>, listener: TcpListener) -> io::Result<Server> {
    let data = web::Data::from(ca);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/roots/{index}", web::get().to(root))
            .route("/intermediates/{index}", web::get().to(intermediate))
            .route("/cert-status-by-serial/{serial}", web::get().to(status))
    })
    .listen(listener)?
    .workers(1)
    .shutdown_timeout(0);

    Ok(server.run())
}

fn pem(pem: Option<&str>, what: &str, index: usize) -> Result<HttpResponse, Problem> {
    let pem = pem.ok_or_else(|| Problem::not_found(format!("no {what} with index {index}")))?;

    Ok(HttpResponse::Ok()
        .content_type("application/x-pem-file")
        .body(pem.to_owned()))
}

async fn root(
    ca: web::Data<CertificateAuthority>,
    index: web::Path<usize>,
) -> Result<HttpResponse, Problem> {
    pem(ca.root_pem(*index), "root", *index)
}

async fn intermediate(
    ca: web::Data<CertificateAuthority>,
    index: web::Path<usize>,
) -> Result<HttpResponse, Problem> {
    pem(ca.intermediate_pem(*index), "intermediate", *index)
}

async fn status(
    ca: web::Data<CertificateAuthority>,
    serial: web::Path<String>,
) -> Result<HttpResponse, Problem> {
    let status = ca
        .status(&serial)
        .ok_or_else(|| Problem::not_found(format!("unknown serial number {serial}")))?;

    Ok(HttpResponse::Ok().json(status))
}
