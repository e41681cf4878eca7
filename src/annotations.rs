//! PVC control annotation vocabulary (C2).
//!
//! Named string keys on `PersistentVolumeClaim` metadata used as durable
//! control state, each paired with a small typed accessor.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;

pub const CLONE_REQUEST: &str = "cdi.kubevirt.io/storage.import.requestedSource";
pub const CLONE_TOKEN: &str = "cdi.kubevirt.io/storage.import.clone-token";
pub const CLONE_OF: &str = "k8s.io/CloneOf";
pub const UPLOAD_CLIENT_NAME: &str = "cdi.kubevirt.io/storage.upload.clientName";
pub const POD_PHASE: &str = "cdi.kubevirt.io/storage.pod.phase";
pub const POD_READY: &str = "cdi.kubevirt.io/storage.pod.ready";
pub const POD_RESTARTS: &str = "cdi.kubevirt.io/storage.pod.restarts";

/// `PersistentVolumeClaim` finalizer placed while a source pod exists or
/// may exist.
pub const CLONE_SOURCE_FINALIZER: &str = "cloneSource";

/// Label used to find the (at most one) source pod for a given target PVC.
pub const CLONE_UNIQUE_ID_LABEL: &str = "cdi.kubevirt.io/storage.clone.uniqueid";

/// Annotation carried by the source pod recording the target PVC's
/// namespaced name, standing in for a native owner reference: the
/// orchestrator forbids owner references across namespaces, and the
/// source pod lives in the *source* PVC's namespace while its logical
/// owner is the *target* PVC in another namespace.
pub const OWNER_REF: &str = "cdi.kubevirt.io/storage.clone.ownerRef";

fn get<'a>(pvc: &'a PersistentVolumeClaim, key: &str) -> Option<&'a str> {
    pvc.metadata.annotations.as_ref()?.get(key).map(String::as_str)
}

pub fn clone_request(pvc: &PersistentVolumeClaim) -> Option<&str> {
    get(pvc, CLONE_REQUEST)
}

pub fn clone_token(pvc: &PersistentVolumeClaim) -> Option<&str> {
    get(pvc, CLONE_TOKEN)
}

pub fn is_clone_of(pvc: &PersistentVolumeClaim) -> bool {
    get(pvc, CLONE_OF) == Some("true")
}

pub fn upload_client_name(pvc: &PersistentVolumeClaim) -> Option<&str> {
    get(pvc, UPLOAD_CLIENT_NAME)
}

pub fn pod_phase(pvc: &PersistentVolumeClaim) -> Option<&str> {
    get(pvc, POD_PHASE)
}

pub fn pod_ready(pvc: &PersistentVolumeClaim) -> bool {
    get(pvc, POD_READY) == Some("true")
}

pub fn pod_restarts(pvc: &PersistentVolumeClaim) -> Option<i32> {
    get(pvc, POD_RESTARTS)?.parse().ok()
}

pub fn is_pod_succeeded(pvc: &PersistentVolumeClaim) -> bool {
    pod_phase(pvc) == Some("Succeeded")
}

pub fn unique_id_label(target_pvc_uid: &str) -> String {
    format!("{target_pvc_uid}-source-pod")
}

/// Set an annotation, creating the annotation map if absent. Returns
/// `true` if the value actually changed (mirrors the reconciler's
/// "persist only if the PVC actually changed" rule).
pub fn set(pvc: &mut PersistentVolumeClaim, key: &str, value: impl Into<String>) -> bool {
    let value = value.into();
    let annotations = pvc.metadata.annotations.get_or_insert_with(Default::default);
    if annotations.get(key) == Some(&value) {
        return false;
    }
    annotations.insert(key.to_string(), value);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pvc_with(annotations: &[(&str, &str)]) -> PersistentVolumeClaim {
        let map: BTreeMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                annotations: Some(map),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn reads_clone_request() {
        let pvc = pvc_with(&[(CLONE_REQUEST, "stage/pvc-src")]);
        assert_eq!(clone_request(&pvc), Some("stage/pvc-src"));
    }

    #[test]
    fn pod_ready_requires_exact_true() {
        let ready = pvc_with(&[(POD_READY, "true")]);
        let not_ready = pvc_with(&[(POD_READY, "false")]);
        let absent = pvc_with(&[]);
        assert!(pod_ready(&ready));
        assert!(!pod_ready(&not_ready));
        assert!(!pod_ready(&absent));
    }

    #[test]
    fn set_reports_whether_value_changed() {
        let mut pvc = pvc_with(&[(CLONE_OF, "true")]);
        assert!(!set(&mut pvc, CLONE_OF, "true"));
        assert!(set(&mut pvc, CLONE_OF, "false"));
    }

    #[test]
    fn unique_id_label_matches_spec_pattern() {
        assert_eq!(unique_id_label("abc-123"), "abc-123-source-pod");
    }
}
