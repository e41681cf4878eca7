//! Source worker pod construction (C4): a single-container, `OnFailure`
//! pod assembled field-by-field.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSecurityContext, PodSpec, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::annotations;

pub const DEFAULT_IMAGE: &str = "pvc-clone-upload/source-pod:latest";

/// The only port the source pod exposes. It never listens for inbound
/// traffic (it pushes to the upload proxy); this is purely a scrape
/// target for its own metrics.
pub const METRICS_PORT: i32 = 8443;

/// Filesystem-mode mount point for the source volume.
const FS_MOUNT_POINT: &str = "/var/run/pvc-clone-upload/source";
/// Block-mode device path for the source volume.
const BLOCK_DEVICE_PATH: &str = "/dev/pvc-clone-upload/source";

/// Everything the reconciler knows that the source pod needs to be told.
pub struct SourcePodSpec<'a> {
    pub target_namespace: &'a str,
    pub target_pvc_name: &'a str,
    pub target_pvc_uid: &'a str,
    pub source_namespace: &'a str,
    pub source_pvc_name: &'a str,
    pub upload_url: &'a str,
    pub client_tls_secret: &'a str,
    pub server_ca_configmap: &'a str,
    pub volume_mode: &'a str,
}

fn pod_name(target_pvc_uid: &str) -> String {
    format!("{target_pvc_uid}-source-pod")
}

/// Build the source pod spec. The pod mounts the source PVC read-only,
/// reads its TLS client identity from the secrets named in `spec`, and is
/// told where to push the stream via `UPLOAD_URL`.
pub fn build(spec: &SourcePodSpec<'_>) -> Pod {
    use k8s_openapi::api::core::v1::{
        KeyToPath, PersistentVolumeClaimVolumeSource, SecretVolumeSource, Volume, VolumeDevice,
        VolumeMount,
    };

    let name = pod_name(spec.target_pvc_uid);
    let mut labels = BTreeMap::new();
    labels.insert(
        annotations::CLONE_UNIQUE_ID_LABEL.to_string(),
        annotations::unique_id_label(spec.target_pvc_uid),
    );
    let mut pod_annotations = BTreeMap::new();
    pod_annotations.insert(
        annotations::OWNER_REF.to_string(),
        format!("{}/{}", spec.target_namespace, spec.target_pvc_name),
    );

    let is_block = spec.volume_mode == "Block";
    let mount_point = if is_block { BLOCK_DEVICE_PATH } else { FS_MOUNT_POINT };

    let env = vec![
        EnvVar {
            name: "CLIENT_KEY".into(),
            value: Some("/etc/pvc-clone-upload/tls/tls.key".into()),
            ..Default::default()
        },
        EnvVar {
            name: "CLIENT_CERT".into(),
            value: Some("/etc/pvc-clone-upload/tls/tls.crt".into()),
            ..Default::default()
        },
        EnvVar {
            name: "SERVER_CA_CERT".into(),
            value: Some("/etc/pvc-clone-upload/ca/ca.crt".into()),
            ..Default::default()
        },
        EnvVar {
            name: "UPLOAD_URL".into(),
            value: Some(spec.upload_url.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "OWNER_UID".into(),
            value: Some(spec.target_pvc_uid.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "VOLUME_MODE".into(),
            value: Some(spec.volume_mode.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "MOUNT_POINT".into(),
            value: Some(mount_point.to_string()),
            ..Default::default()
        },
    ];

    let volumes = vec![
        Volume {
            name: "source".into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: spec.source_pvc_name.to_string(),
                read_only: Some(true),
            }),
            ..Default::default()
        },
        Volume {
            name: "client-tls".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(spec.client_tls_secret.to_string()),
                items: Some(vec![
                    KeyToPath {
                        key: "tls.key".into(),
                        path: "tls.key".into(),
                        ..Default::default()
                    },
                    KeyToPath {
                        key: "tls.crt".into(),
                        path: "tls.crt".into(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "server-ca".into(),
            config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                name: spec.server_ca_configmap.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let mut volume_mounts = vec![
        VolumeMount {
            name: "client-tls".into(),
            mount_path: "/etc/pvc-clone-upload/tls".into(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "server-ca".into(),
            mount_path: "/etc/pvc-clone-upload/ca".into(),
            read_only: Some(true),
            ..Default::default()
        },
    ];

    let mut volume_devices = Vec::new();
    if is_block {
        volume_devices.push(VolumeDevice {
            name: "source".into(),
            device_path: mount_point.to_string(),
        });
    } else {
        volume_mounts.push(VolumeMount {
            name: "source".into(),
            mount_path: mount_point.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(spec.source_namespace.to_string()),
            labels: Some(labels),
            annotations: Some(pod_annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("OnFailure".into()),
            security_context: Some(PodSecurityContext {
                run_as_user: Some(0),
                ..Default::default()
            }),
            containers: vec![Container {
                name: "source".into(),
                image: Some(DEFAULT_IMAGE.into()),
                image_pull_policy: Some("IfNotPresent".into()),
                env: Some(env),
                ports: Some(vec![ContainerPort {
                    name: Some("metrics".into()),
                    container_port: METRICS_PORT,
                    ..Default::default()
                }]),
                security_context: Some(SecurityContext {
                    run_as_user: Some(0),
                    ..Default::default()
                }),
                volume_mounts: Some(volume_mounts),
                volume_devices: if volume_devices.is_empty() { None } else { Some(volume_devices) },
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn name_for(target_pvc_uid: &str) -> String {
    pod_name(target_pvc_uid)
}
