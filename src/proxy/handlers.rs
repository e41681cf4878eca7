//! HTTP handlers for the upload proxy (C6): bearer-token validation,
//! PVC readiness polling, and a streaming mTLS reverse proxy to the
//! in-cluster upload server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{get, post, web, HttpRequest, HttpResponse};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::Api;
use kube::Client;
use regex::Regex;
use tracing::warn;

use crate::annotations;
use crate::metrics::Metrics;
use crate::token::{Operation, TokenValidator};

use super::mtls;

pub struct AppState {
    pub validator: TokenValidator,
    pub kube_client: Client,
    pub client_cert_dir: PathBuf,
    pub upstream_ca_bundle: Vec<u8>,
    pub metrics: Arc<Metrics>,
    pub readiness_poll_interval: Duration,
    pub readiness_poll_timeout: Duration,
}

#[get("/healthz")]
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

#[get("/metrics")]
pub async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.metrics.encode())
}

#[post("/upload/sync")]
pub async fn upload_sync(req: HttpRequest, body: web::Bytes, state: web::Data<AppState>) -> HttpResponse {
    handle_upload(&req, body, &state, "/upload/sync").await
}

#[post("/upload/async")]
pub async fn upload_async(req: HttpRequest, body: web::Bytes, state: web::Data<AppState>) -> HttpResponse {
    handle_upload(&req, body, &state, "/upload/async").await
}

fn bearer_regex() -> Regex {
    Regex::new(r"(?i)^Bearer\s+([A-Za-z0-9\-._~+/]+)$").expect("static regex is valid")
}

/// Extract the bearer token from an `Authorization` header value, per the
/// exact grammar the reconciler and proxy share.
pub fn extract_bearer_token(header_value: &str) -> Option<String> {
    bearer_regex()
        .captures(header_value.trim())
        .map(|c| c[1].to_string())
}

async fn handle_upload(req: &HttpRequest, body: web::Bytes, state: &AppState, path: &str) -> HttpResponse {
    let response = handle_upload_inner(req, body, state, path).await;
    let status = match &response {
        Ok(resp) => resp.status(),
        Err(status) => *status,
    };
    state.metrics.proxy_request(path, status_class_of(status.as_u16()));

    match response {
        Ok(resp) => resp,
        Err(status) => HttpResponse::new(status),
    }
}

fn status_class_of(code: u16) -> &'static str {
    match code {
        200..=299 => "2xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

async fn handle_upload_inner(
    req: &HttpRequest,
    body: web::Bytes,
    state: &AppState,
    path: &str,
) -> Result<HttpResponse, actix_web::http::StatusCode> {
    use actix_web::http::StatusCode;

    let auth = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let token = extract_bearer_token(auth).ok_or(StatusCode::BAD_REQUEST)?;

    let claims = state
        .validator
        .validate(&token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    if claims.operation != Operation::Upload
        || claims.name.is_empty()
        || claims.namespace.is_empty()
        || claims.resource.resource != "persistentvolumeclaims"
    {
        return Err(StatusCode::BAD_REQUEST);
    }

    poll_readiness(&state.kube_client, &claims.namespace, &claims.name, state).await?;

    let cert_dir = state.client_cert_dir.join(&claims.namespace).join(&claims.name);
    let cert = std::fs::read(cert_dir.join("tls.crt")).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let key = std::fs::read(cert_dir.join("tls.key")).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let client = mtls::build_client(&cert, &key, &state.upstream_ca_bundle)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let url = resolve_upstream(&claims.namespace, &claims.name, path);
    let upstream = client
        .post(&url)
        .header("Content-Length", body.len().to_string())
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!(error = %e, %url, "upstream request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let bytes = upstream.bytes().await.unwrap_or_default();
    Ok(HttpResponse::build(status).body(bytes))
}

/// Poll the target PVC's mirrored pod-status annotations until the
/// upload server is ready, or give up after the configured budget.
async fn poll_readiness(
    client: &Client,
    namespace: &str,
    name: &str,
    state: &AppState,
) -> Result<(), actix_web::http::StatusCode> {
    use actix_web::http::StatusCode;

    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let deadline = tokio::time::Instant::now() + state.readiness_poll_timeout;

    loop {
        let pvc = match api.get(name).await {
            Ok(pvc) => pvc,
            Err(kube::Error::Api(e)) if e.code == 404 => return Err(StatusCode::SERVICE_UNAVAILABLE),
            Err(_) => return Err(StatusCode::SERVICE_UNAVAILABLE),
        };

        if annotations::is_pod_succeeded(&pvc) {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
        if annotations::pod_ready(&pvc) {
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
        tokio::time::sleep(state.readiness_poll_interval).await;
    }
}

/// Resolve the in-cluster upload server for a target PVC. Follows the
/// `cdi-upload-<name>` service-naming convention the source pod's own
/// `UPLOAD_URL` is built from.
fn resolve_upstream(namespace: &str, name: &str, path: &str) -> String {
    format!("https://cdi-upload-{name}.{namespace}.svc.cluster.local:8443{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_token_case_insensitively() {
        assert_eq!(
            extract_bearer_token("Bearer abc.def-123"),
            Some("abc.def-123".to_string())
        );
        assert_eq!(
            extract_bearer_token("bearer abc.def-123"),
            Some("abc.def-123".to_string())
        );
        assert_eq!(
            extract_bearer_token("BEARER abc.def-123"),
            Some("abc.def-123".to_string())
        );
    }

    #[test]
    fn rejects_non_bearer_and_malformed_headers() {
        assert_eq!(extract_bearer_token("Basic dXNlcjpwYXNz"), None);
        assert_eq!(extract_bearer_token("Bearer"), None);
        assert_eq!(extract_bearer_token("Bearer  "), None);
        assert_eq!(extract_bearer_token("Bearer a b"), None);
    }

    #[test]
    fn status_class_buckets_match_spec_ranges() {
        assert_eq!(status_class_of(200), "2xx");
        assert_eq!(status_class_of(404), "4xx");
        assert_eq!(status_class_of(503), "5xx");
    }

    #[test]
    fn resolves_upstream_by_cdi_upload_convention() {
        assert_eq!(
            resolve_upstream("prod", "pvc-dst", "/upload/sync"),
            "https://cdi-upload-pvc-dst.prod.svc.cluster.local:8443/upload/sync"
        );
    }
}
