//! Authenticated upload proxy (C6): accepts bearer-token uploads from
//! outside the cluster and forwards them, over a freshly-minted mTLS
//! connection, to the in-cluster upload server for the target PVC.

mod handlers;
mod mtls;

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use kube::Client;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::token::TokenValidator;

pub use handlers::{extract_bearer_token, AppState};

/// Build the app state shared across workers from CLI configuration.
pub fn build_state(client: Client, config: &ProxyConfig, metrics: Arc<Metrics>) -> std::io::Result<AppState> {
    let public_key = std::fs::read(&config.upload_validator_public_key_path)?;
    let validator = TokenValidator::new(
        crate::token::UPLOAD_ISSUER,
        &public_key,
        config.token_leeway(),
    )
    .map_err(|e| std::io::Error::other(e.to_string()))?;

    let upstream_ca_bundle = std::fs::read(&config.upstream_ca_bundle_path)?;

    Ok(AppState {
        validator,
        kube_client: client,
        client_cert_dir: PathBuf::from(&config.client_cert_dir),
        upstream_ca_bundle,
        metrics,
        readiness_poll_interval: config.readiness_poll_interval(),
        readiness_poll_timeout: config.readiness_poll_timeout(),
    })
}

/// Re-reads and re-parses the serving certificate and key from disk on
/// every TLS handshake, so a rotated cert (e.g. cert-manager rewriting
/// the mounted secret) takes effect without a process restart — the
/// server-side counterpart of the per-request mTLS client in
/// [`super::mtls`].
struct ReloadingCertResolver {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl ReloadingCertResolver {
    fn load(&self) -> std::io::Result<CertifiedKey> {
        load_certified_key(&self.cert_path, &self.key_path)
    }
}

impl std::fmt::Debug for ReloadingCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadingCertResolver").finish()
    }
}

impl ResolvesServerCert for ReloadingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.load() {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                warn!(error = %e, "failed to reload serving certificate");
                None
            }
        }
    }
}

fn load_certified_key(cert_path: &std::path::Path, key_path: &std::path::Path) -> std::io::Result<CertifiedKey> {
    let cert_bytes = std::fs::read(cert_path)?;
    let key_bytes = std::fs::read(key_path)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())?
        .ok_or_else(|| std::io::Error::other("no private key found in PEM file"))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

fn build_rustls_server_config(cert_path: &str, key_path: &str) -> std::io::Result<ServerConfig> {
    let resolver = ReloadingCertResolver {
        cert_path: PathBuf::from(cert_path),
        key_path: PathBuf::from(key_path),
    };
    // Fail fast on a broken cert/key pair at startup rather than on the
    // first handshake.
    resolver.load()?;

    Ok(ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver)))
}

/// Run the proxy, blocking until shutdown. TLS-terminated when both
/// `tls_cert_path` and `tls_key_path` are set in config; otherwise plain
/// HTTP (test mode only).
pub async fn run(state: AppState, config: ProxyConfig) -> std::io::Result<()> {
    let state = web::Data::new(state);

    let server = HttpServer::new({
        let state = state.clone();
        move || {
            App::new()
                .app_data(state.clone())
                .wrap(actix_web::middleware::Logger::default().exclude("/healthz"))
                .service(handlers::healthz)
                .service(handlers::metrics)
                .service(handlers::upload_sync)
                .service(handlers::upload_async)
        }
    });

    let server = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => {
            let tls_config = build_rustls_server_config(cert, key)?;
            info!(addr = %config.bind_addr, "starting upload proxy over TLS");
            server.bind_rustls_0_23(config.bind_addr.clone(), tls_config)?
        }
        _ => {
            info!(addr = %config.bind_addr, "starting upload proxy over plain HTTP (test mode)");
            server.bind(config.bind_addr.clone())?
        }
    };

    server.run().await
}
