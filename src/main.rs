//! ACME test server bootstrap.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use acme_testsrv::{
    config::{self, Config},
    issuance::{CertificateAuthority, ExternalCa},
    server, Protocol, ValidationEngine,
};
use clap::Parser;
use eyre::WrapErr as _;
use zeroize::Zeroizing;

/// Self-contained ACME (RFC 8555) server for testing ACME clients
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(long, env = "ACME_CONFIG", default_value = "test/config/acme-config.json")]
    config: PathBuf,

    /// Reject request shapes that are tolerated for compatibility
    #[arg(long, env = "ACME_STRICT")]
    strict: bool,

    /// DNS server used for every validation lookup (ex: 127.0.0.1:8053)
    #[arg(long = "dns-server", env = "ACME_DNS_SERVER")]
    dns_server: Option<SocketAddr>,

    /// Chains offered besides the default one, each with its own root
    #[arg(long, env = "ACME_ALTERNATE_ROOTS", default_value_t = 0)]
    alternate_roots: usize,

    /// Intermediates between each root and issued certificates (default 1)
    #[arg(long, env = "ACME_CHAIN_LENGTH")]
    chain_length: Option<String>,

    /// Treat every challenge attempt as successful
    #[arg(long, env = "ACME_VA_ALWAYS_VALID")]
    always_valid: bool,

    /// Sign with an externally supplied root and intermediate instead of generated ones
    #[arg(long, env = "ACME_EXTERNAL_CA")]
    external_ca: bool,

    /// Directory holding the external CA files
    #[arg(long, env = "ACME_EXTERNAL_CA_PATH", default_value = "/x-ca")]
    external_ca_path: PathBuf,

    /// Read the `-des3` key files (legacy OpenSSL PEM encrypted with DES-EDE3-CBC)
    #[arg(long, env = "ACME_EXTERNAL_CA_DES3")]
    external_ca_des3: bool,

    #[arg(long, env = "ACME_EXTERNAL_CA_ROOT_PASSWORD", hide_env_values = true)]
    external_ca_root_password: Option<String>,

    #[arg(long, env = "ACME_EXTERNAL_CA_INTERMEDIATE_PASSWORD", hide_env_values = true)]
    external_ca_intermediate_password: Option<String>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut cli = Cli::parse();

    log::info!("starting ACME test server");

    let config = Config::load(&cli.config)?;

    let store = Arc::new(config.store()?);
    let chain_length = config::chain_length(cli.chain_length.as_deref());
    let issuance = config.issuance_config(cli.alternate_roots, chain_length);

    log::info!("external CA: {}", cli.external_ca);

    let ca = if cli.external_ca {
        let base = &cli.external_ca_path;
        let suffix = if cli.external_ca_des3 { "-des3" } else { "" };

        log::info!("external CA path: {}", base.display());

        let root_password = cli.external_ca_root_password.take().map(Zeroizing::new);
        let intermediate_password = cli
            .external_ca_intermediate_password
            .take()
            .map(Zeroizing::new);

        let root_key = base.join(format!("ca/root-ca/private/root-ca{suffix}.key"));
        let intermediate_key = base.join(format!("ca/tls-ca/private/tls-ca{suffix}.key"));
        let root_cert = base.join("ca/root-ca.crt");
        let intermediate_cert = base.join("ca/tls-ca.crt");

        let external = ExternalCa {
            root_cert: &root_cert,
            root_key: &root_key,
            root_password: root_password.as_ref().map(|pw| pw.as_str()),
            intermediate_cert: &intermediate_cert,
            intermediate_key: &intermediate_key,
            intermediate_password: intermediate_password.as_ref().map(|pw| pw.as_str()),
        };

        CertificateAuthority::load(Arc::clone(&store), &issuance, &external)?
    } else {
        CertificateAuthority::generate(Arc::clone(&store), &issuance)?
    };
    let ca = Arc::new(ca);

    let va = ValidationEngine::new(config.validation_config(cli.dns_server, cli.always_valid))?;

    let proto = Arc::new(Protocol::new(
        store,
        Arc::clone(&ca),
        va,
        config.protocol_config(cli.strict)?,
    ));

    let management = match config.management_address()? {
        Some(addr) => {
            let listener = std::net::TcpListener::bind(addr)
                .with_context(|| format!("bind management interface to {addr}"))?;

            log::info!("management interface listening on {addr}");
            for index in 0..ca.chain_count() {
                log::info!(
                    "root CA certificate {index} available at http://{addr}{}{index}",
                    server::ROOT_CERT_PATH
                );
            }

            Some(server::run_management(Arc::clone(&ca), listener)?)
        }
        None => {
            log::info!("management interface is disabled");
            None
        }
    };

    let addr = config.listen_address()?;
    let listener =
        std::net::TcpListener::bind(addr).with_context(|| format!("bind listener to {addr}"))?;
    let acme = server::run(proto, listener)?;

    log::info!("listening on {addr}");
    log::info!("ACME directory available at http://{addr}/directory");

    match management {
        Some(management) => {
            tokio::try_join!(acme, management)?;
        }
        None => acme.await?,
    }

    Ok(())
}
