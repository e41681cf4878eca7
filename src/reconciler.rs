//! Clone reconciler (C5): a level-triggered control loop over target PVC
//! annotations, coordinating a single source worker pod per target and
//! owning its lifecycle via a finalizer.
//!
//! Relevance/cleanup decisions are factored into small, pure functions
//! kept separate from the async API-calling shell so they're unit
//! testable without a mock API server.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use rand::Rng;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::annotations;
use crate::clone_request::{self, SourceRef};
use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::source_pod::{self, SourcePodSpec};
use crate::token::TokenValidator;

pub const FINALIZER: &str = annotations::CLONE_SOURCE_FINALIZER;

pub struct Context {
    pub client: Client,
    pub validator: TokenValidator,
    pub metrics: Arc<Metrics>,
    pub requeue: Duration,
    pub reporter: Reporter,
    pub ca_bundle_configmap: String,
    pub upload_proxy_service_template: String,
}

impl Context {
    /// Build a `Context` from CLI configuration and an already-connected
    /// client, loading the clone-token public key from disk.
    pub fn new(client: Client, config: &ReconcilerConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let public_key = std::fs::read(&config.clone_validator_public_key_path)
            .map_err(|_| crate::error::TokenError::Malformed.opaque())?;
        let validator =
            TokenValidator::new(crate::token::CLONE_ISSUER, &public_key, config.token_leeway())?;
        Ok(Self {
            client,
            validator,
            metrics,
            requeue: config.reconcile_requeue(),
            reporter: "pvc-clone-upload".into(),
            ca_bundle_configmap: config.ca_bundle_configmap.clone(),
            upload_proxy_service_template: config.upload_proxy_service_template.clone(),
        })
    }

    fn recorder(&self, pvc: &PersistentVolumeClaim) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone(), pvc.object_ref(&()))
    }

    /// Build a `Context` straight from an already-validated public key,
    /// bypassing CLI config and file I/O. Exercised by the integration
    /// test, which runs against a real API server but doesn't carry a
    /// `ReconcilerConfig`.
    pub fn for_test(client: Client, clone_validator_public_key_pem: &[u8], metrics: Arc<Metrics>) -> Result<Self> {
        let validator = TokenValidator::new(
            crate::token::CLONE_ISSUER,
            clone_validator_public_key_pem,
            Duration::from_secs(10),
        )?;
        Ok(Self {
            client,
            validator,
            metrics,
            requeue: Duration::from_secs(120),
            reporter: "pvc-clone-upload".into(),
            ca_bundle_configmap: "pvc-clone-upload-ca".into(),
            upload_proxy_service_template: "upload-proxy.{namespace}.svc.cluster.local:8443".into(),
        })
    }
}

/// PVC is relevant iff it carries a clone request and hasn't finished.
fn is_relevant(pvc: &PersistentVolumeClaim) -> bool {
    annotations::clone_request(pvc).is_some() && !annotations::is_clone_of(pvc)
}

fn has_finalizer(pvc: &PersistentVolumeClaim) -> bool {
    pvc.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
}

#[instrument(skip(pvc, ctx), fields(pvc = %pvc.name_any()))]
pub async fn reconcile(pvc: Arc<PersistentVolumeClaim>, ctx: Arc<Context>) -> Result<Action> {
    ctx.metrics.reconcile_runs.inc();

    let namespace = pvc.namespace().ok_or_else(|| {
        Error::MissingAnnotation(String::new(), pvc.name_any(), "metadata.namespace")
    })?;
    let api: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);

    if !is_relevant(&pvc) && !has_finalizer(&pvc) {
        return Ok(Action::await_change());
    }

    // `kube::runtime::finalizer`'s Cleanup event only fires once
    // `metadata.deletionTimestamp` is set. A PVC that finished cloning
    // (`CloneOf=true`) is never deleted, so that event never comes; strip
    // the finalizer ourselves as soon as the PVC stops being relevant
    // instead of waiting on a deletion that will never happen.
    if !is_relevant(&pvc) && has_finalizer(&pvc) && pvc.metadata.deletion_timestamp.is_none() {
        return match cleanup(&pvc, &ctx).await? {
            CleanupOutcome::Waiting(action) => Ok(action),
            CleanupOutcome::Finished => {
                remove_finalizer(&api, &pvc).await?;
                Ok(Action::await_change())
            }
        };
    }

    finalizer(&api, FINALIZER, pvc, |event| async {
        match event {
            FinalizerEvent::Apply(pvc) => apply(pvc, ctx.clone()).await,
            FinalizerEvent::Cleanup(pvc) => match cleanup(&pvc, &ctx).await? {
                CleanupOutcome::Waiting(action) => Ok(action),
                CleanupOutcome::Finished => Ok(Action::await_change()),
            },
        }
    })
    .await
    .map_err(Error::from)
}

pub fn error_policy(_pvc: Arc<PersistentVolumeClaim>, err: &Error, ctx: Arc<Context>) -> Action {
    warn!(error = %err, "reconcile failed");
    ctx.metrics.reconcile_failure(err.metric_reason());

    if err.is_validation() {
        // Already surfaced as a Warning event from `apply`; the PVC needs
        // an edit, not endless retries.
        return Action::await_change();
    }

    let jitter = rand::thread_rng().gen_range(0..10);
    Action::requeue(Duration::from_secs(30 + jitter))
}

async fn apply(pvc: Arc<PersistentVolumeClaim>, ctx: Arc<Context>) -> Result<Action> {
    match apply_inner(&pvc, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) if e.is_validation() => {
            publish_validation_failure(&pvc, &ctx, &e).await;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

async fn apply_inner(pvc: &PersistentVolumeClaim, ctx: &Context) -> Result<Action> {
    if !is_relevant(pvc) {
        return Ok(Action::await_change());
    }

    if annotations::is_pod_succeeded(pvc) {
        return finish_success(pvc, ctx).await;
    }

    if !annotations::pod_ready(pvc) {
        return Ok(Action::await_change());
    }

    let target_namespace = pvc.namespace().expect("namespaced object");
    let target_name = pvc.name_any();
    let target_uid = pvc
        .uid()
        .ok_or_else(|| Error::MissingAnnotation(target_namespace.clone(), target_name.clone(), "metadata.uid"))?;

    let source = clone_request::source_ref(pvc)?;

    let existing = find_source_pod(&ctx.client, &source.namespace, &target_uid).await?;

    match existing {
        Some(pod) => update_pod_restarts(pvc, &pod, ctx).await?,
        None => create_source_pod(pvc, &source, &target_namespace, &target_name, &target_uid, ctx).await?,
    }

    Ok(Action::requeue(ctx.requeue))
}

/// Emit a Warning event recording why the clone request failed
/// validation. Validation errors are not retried, so the event is the
/// only operator-visible record of the stuck PVC.
async fn publish_validation_failure(pvc: &PersistentVolumeClaim, ctx: &Context, err: &Error) {
    let recorder = ctx.recorder(pvc);
    let _ = recorder
        .publish(KubeEvent {
            type_: EventType::Warning,
            reason: "CloneValidationFailed".into(),
            note: Some(err.to_string()),
            action: "Clone".into(),
            secondary: None,
        })
        .await;
}

/// Update the `PodRestarts` annotation to `max(existing, observed)`,
/// patching only when the value actually changes.
async fn update_pod_restarts(pvc: &PersistentVolumeClaim, pod: &Pod, ctx: &Context) -> Result<()> {
    let observed = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .map(|status| status.restart_count)
        .unwrap_or(0);
    let existing = annotations::pod_restarts(pvc).unwrap_or(0);
    let updated = existing.max(observed);
    if updated == existing {
        return Ok(());
    }

    let namespace = pvc.namespace().expect("namespaced object");
    let api: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = json!({
        "metadata": {
            "annotations": { annotations::POD_RESTARTS: updated.to_string() }
        }
    });
    api.patch(&pvc.name_any(), &PatchParams::apply("pvc-clone-upload"), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn create_source_pod(
    target: &PersistentVolumeClaim,
    source: &SourceRef,
    target_namespace: &str,
    target_name: &str,
    target_uid: &str,
    ctx: &Context,
) -> Result<()> {
    let source_api: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &source.namespace);
    let source_pvc = source_api
        .get(&source.name)
        .await
        .map_err(|_| Error::NotFound(source.namespace.clone(), source.name.clone()))?;

    let token = annotations::clone_token(target).ok_or_else(|| {
        Error::MissingAnnotation(target_namespace.to_string(), target_name.to_string(), annotations::CLONE_TOKEN)
    })?;
    let claims = ctx.validator.validate(token)?;
    clone_request::check_token_binding(&claims, source, target_namespace, target_name)?;
    clone_request::check_spec_compatible(&source_pvc, target)?;

    let client_name = annotations::upload_client_name(target).ok_or_else(|| {
        Error::MissingAnnotation(
            target_namespace.to_string(),
            target_name.to_string(),
            annotations::UPLOAD_CLIENT_NAME,
        )
    })?;

    let volume_mode = source_pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .unwrap_or("Filesystem");

    let upload_host = ctx
        .upload_proxy_service_template
        .replace("{namespace}", target_namespace);
    let upload_url = format!("https://{upload_host}/upload/sync");

    let client_secret = format!("{target_name}-client-tls");
    let spec = SourcePodSpec {
        target_namespace,
        target_pvc_name: target_name,
        target_pvc_uid: target_uid,
        source_namespace: &source.namespace,
        source_pvc_name: &source.name,
        upload_url: &upload_url,
        client_tls_secret: &client_secret,
        server_ca_configmap: &ctx.ca_bundle_configmap,
        volume_mode,
    };
    let pod = source_pod::build(&spec);

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &source.namespace);
    match pods.create(&Default::default(), &pod).await {
        Ok(_) => {
            info!(client = %client_name, pod = %pod.name_any(), "created source pod");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

async fn finish_success(pvc: &PersistentVolumeClaim, ctx: &Context) -> Result<Action> {
    let namespace = pvc.namespace().expect("namespaced object");
    let target_uid = pvc.uid().unwrap_or_default();
    let api: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);

    if !annotations::is_clone_of(pvc) {
        let patch = json!({
            "metadata": {
                "annotations": { annotations::CLONE_OF: "true" }
            }
        });
        api.patch(&pvc.name_any(), &PatchParams::apply("pvc-clone-upload"), &Patch::Merge(&patch))
            .await?;

        let recorder = ctx.recorder(pvc);
        recorder
            .publish(KubeEvent {
                type_: EventType::Normal,
                reason: "CloneSucceeded".into(),
                note: Some(format!("clone of {} completed", pvc.name_any())),
                action: "Clone".into(),
                secondary: None,
            })
            .await
            .ok();
    }

    if let Ok(source) = clone_request::source_ref(pvc) {
        if let Some(pod) = find_source_pod(&ctx.client, &source.namespace, &target_uid).await? {
            update_pod_restarts(pvc, &pod, ctx).await?;
            delete_pod_ignore_not_found(&ctx.client, &source.namespace, &pod.name_any()).await?;
        }
    }

    Ok(Action::requeue(ctx.requeue))
}

/// What `cleanup` did and whether it's safe to drop the finalizer.
enum CleanupOutcome {
    /// The source pod is still finishing up; recheck later.
    Waiting(Action),
    /// Nothing left to clean up.
    Finished,
}

async fn cleanup(pvc: &PersistentVolumeClaim, ctx: &Context) -> Result<CleanupOutcome> {
    let target_uid = pvc.uid().unwrap_or_default();
    let source = clone_request::source_ref(pvc).ok();

    if let Some(source) = &source {
        if let Some(pod) = find_source_pod(&ctx.client, &source.namespace, &target_uid).await? {
            let still_running = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running");
            let just_succeeded = annotations::is_pod_succeeded(pvc);
            if just_succeeded && still_running {
                return Ok(CleanupOutcome::Waiting(Action::requeue(Duration::from_secs(5))));
            }
            delete_pod_ignore_not_found(&ctx.client, &source.namespace, &pod.name_any()).await?;
        }
    }

    Ok(CleanupOutcome::Finished)
}

/// Remove `FINALIZER` from the PVC's finalizer list via a JSON patch,
/// independent of `kube::runtime::finalizer`'s deletion-gated helper.
async fn remove_finalizer(api: &Api<PersistentVolumeClaim>, pvc: &PersistentVolumeClaim) -> Result<()> {
    let Some(idx) = pvc
        .metadata
        .finalizers
        .as_ref()
        .and_then(|f| f.iter().position(|x| x == FINALIZER))
    else {
        return Ok(());
    };

    let finalizer_path = format!("/metadata/finalizers/{idx}");
    let patch: json_patch::Patch = serde_json::from_value(json!([
        { "op": "remove", "path": finalizer_path }
    ]))
    .expect("static patch document is valid");

    api.patch(&pvc.name_any(), &PatchParams::default(), &Patch::<json_patch::Patch>::Json(patch))
        .await?;
    Ok(())
}

async fn find_source_pod(client: &Client, source_namespace: &str, target_uid: &str) -> Result<Option<Pod>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), source_namespace);
    let unique_id = annotations::unique_id_label(target_uid);
    let selector = format!("{}={}", annotations::CLONE_UNIQUE_ID_LABEL, unique_id);
    let pods = api.list(&ListParams::default().labels(&selector)).await?;
    match pods.items.len() {
        0 => Ok(None),
        1 => Ok(pods.items.into_iter().next()),
        n => Err(Error::MultipleSourcePods(n, unique_id)),
    }
}

async fn delete_pod_ignore_not_found(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

pub async fn run(ctx: Context) {
    let client = ctx.client.clone();
    let pvcs = Api::<PersistentVolumeClaim>::all(client.clone());
    if let Err(e) = pvcs.list(&ListParams::default().limit(1)).await {
        tracing::error!(error = %e, "PersistentVolumeClaim not queryable; check RBAC");
        std::process::exit(1);
    }

    let ctx = Arc::new(ctx);
    Controller::new(pvcs, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pvc_with(annos: &[(&str, &str)], finalizers: &[&str]) -> PersistentVolumeClaim {
        let map: BTreeMap<String, String> =
            annos.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                annotations: Some(map),
                finalizers: Some(finalizers.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn relevant_requires_request_and_lacks_clone_of() {
        let fresh = pvc_with(&[(annotations::CLONE_REQUEST, "stage/pvc-src")], &[]);
        assert!(is_relevant(&fresh));

        let done = pvc_with(
            &[
                (annotations::CLONE_REQUEST, "stage/pvc-src"),
                (annotations::CLONE_OF, "true"),
            ],
            &[],
        );
        assert!(!is_relevant(&done));

        let not_a_clone = pvc_with(&[], &[]);
        assert!(!is_relevant(&not_a_clone));
    }

    #[test]
    fn finalizer_detection_matches_exact_name() {
        let with = pvc_with(&[], &[FINALIZER]);
        let without = pvc_with(&[], &["some.other/finalizer"]);
        assert!(has_finalizer(&with));
        assert!(!has_finalizer(&without));
    }

    #[test]
    fn irrelevant_and_unfinalized_pvc_is_ignored() {
        let pvc = pvc_with(&[], &[]);
        assert!(!is_relevant(&pvc) && !has_finalizer(&pvc));
    }
}
