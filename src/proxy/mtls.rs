//! Per-request mutually-authenticated TLS client construction.
//!
//! Rebuilt fresh for every request (never cached) so a rotated client
//! certificate takes effect without a process restart.

use std::time::Duration;

use reqwest::{Certificate, Client, Identity};

use crate::error::{Error, Result};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Build an HTTP client presenting `client_cert_pem`/`client_key_pem` as
/// its TLS identity and trusting only `ca_bundle_pem`.
pub fn build_client(client_cert_pem: &[u8], client_key_pem: &[u8], ca_bundle_pem: &[u8]) -> Result<Client> {
    let mut identity_pem = Vec::with_capacity(client_cert_pem.len() + client_key_pem.len());
    identity_pem.extend_from_slice(client_cert_pem);
    identity_pem.extend_from_slice(client_key_pem);
    let identity = Identity::from_pem(&identity_pem).map_err(|e| Error::Tls(e.to_string()))?;
    let ca_cert = Certificate::from_pem(ca_bundle_pem).map_err(|e| Error::Tls(e.to_string()))?;

    Client::builder()
        .identity(identity)
        .add_root_certificate(ca_cert)
        .tls_built_in_root_certs(false)
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .map_err(|e| Error::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_pem_is_rejected() {
        let result = build_client(b"not a cert", b"not a key", b"not a ca");
        assert!(result.is_err());
    }
}
