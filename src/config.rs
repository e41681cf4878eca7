//! Binary configuration (C7): a single `clap::Parser` struct per binary,
//! each field backed by an `env` fallback.

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ReconcilerConfig {
    /// PEM path for the RSA private key used to sign upload tokens handed
    /// to source pods (unused directly by the reconciler beyond passing
    /// the public counterpart's path through to workers).
    #[arg(long, env = "CLONE_ISSUER_PRIVATE_KEY_PATH")]
    pub clone_issuer_private_key_path: String,

    /// PEM path for the RSA public key used to validate incoming clone
    /// tokens on target PVCs.
    #[arg(long, env = "CLONE_VALIDATOR_PUBLIC_KEY_PATH")]
    pub clone_validator_public_key_path: String,

    /// Clock leeway applied to token `nbf`/`exp`, in seconds.
    #[arg(long, env = "TOKEN_LEEWAY_SECS", default_value_t = 10)]
    pub token_leeway_secs: u64,

    /// Fallback normal requeue interval in seconds.
    #[arg(long, env = "RECONCILE_REQUEUE_SECS", default_value_t = 120)]
    pub reconcile_requeue_secs: u64,

    /// Metrics/health HTTP bind address.
    #[arg(long, env = "METRICS_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_bind_addr: String,

    /// Name of the ConfigMap (in the source pod's namespace) holding the
    /// server CA bundle the source pod trusts when dialing the upload
    /// proxy.
    #[arg(long, env = "CA_BUNDLE_CONFIGMAP", default_value = "pvc-clone-upload-ca")]
    pub ca_bundle_configmap: String,

    /// DNS name of the upload proxy service, used to build each source
    /// pod's `UPLOAD_URL`.
    #[arg(
        long,
        env = "UPLOAD_PROXY_SERVICE",
        default_value = "upload-proxy.{namespace}.svc.cluster.local:8443"
    )]
    pub upload_proxy_service_template: String,
}

impl ReconcilerConfig {
    pub fn token_leeway(&self) -> Duration {
        Duration::from_secs(self.token_leeway_secs)
    }

    pub fn reconcile_requeue(&self) -> Duration {
        Duration::from_secs(self.reconcile_requeue_secs)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ProxyConfig {
    /// Address the proxy listens on.
    #[arg(long, env = "PROXY_BIND_ADDR", default_value = "0.0.0.0:8443")]
    pub bind_addr: String,

    /// PEM path for the RSA public key used to validate upload tokens.
    #[arg(long, env = "UPLOAD_VALIDATOR_PUBLIC_KEY_PATH")]
    pub upload_validator_public_key_path: String,

    /// Clock leeway applied to token `nbf`/`exp`, in seconds.
    #[arg(long, env = "TOKEN_LEEWAY_SECS", default_value_t = 10)]
    pub token_leeway_secs: u64,

    /// Path to the server's own TLS certificate. When unset (together with
    /// `tls_key_path`) the proxy serves plain HTTP — test mode only.
    #[arg(long, env = "PROXY_TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Path to the server's own TLS private key.
    #[arg(long, env = "PROXY_TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    /// Directory holding `<namespace>/<name>/tls.crt`, `tls.key` for the
    /// per-request mTLS client identity used to dial upstream source pods.
    #[arg(long, env = "CLIENT_CERT_DIR", default_value = "/etc/pvc-clone-upload/client-certs")]
    pub client_cert_dir: String,

    /// PEM bundle of CA certificates trusted when dialing upstream.
    #[arg(long, env = "UPSTREAM_CA_BUNDLE_PATH")]
    pub upstream_ca_bundle_path: String,

    /// Readiness poll cadence in milliseconds.
    #[arg(long, env = "READINESS_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub readiness_poll_interval_ms: u64,

    /// Total readiness poll budget in seconds.
    #[arg(long, env = "READINESS_POLL_TIMEOUT_SECS", default_value_t = 10)]
    pub readiness_poll_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn token_leeway(&self) -> Duration {
        Duration::from_secs(self.token_leeway_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    pub fn readiness_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_timeout_secs)
    }
}
