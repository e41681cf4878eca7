//! Clone request parsing and validation (C3).

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::annotations;
use crate::error::{Error, Result};
use crate::token::Claims;

/// A parsed `CloneRequest` annotation value: `<namespace>/<name>` of the
/// source PVC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub namespace: String,
    pub name: String,
}

/// Split `CloneRequest` on `/`. Exactly two non-empty parts yields a
/// [`SourceRef`]; anything else is [`Error::NotACloneRequest`].
pub fn parse_clone_request(value: &str) -> Result<SourceRef> {
    let mut parts = value.splitn(2, '/');
    let namespace = parts.next().unwrap_or("");
    let name = parts.next().unwrap_or("");
    if namespace.is_empty() || name.is_empty() || value.matches('/').count() != 1 {
        return Err(Error::NotACloneRequest);
    }
    Ok(SourceRef {
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}

/// Check that a clone token's claims bind it to exactly this
/// (source, target) pair. All six fields must match; any single mismatch
/// rejects.
pub fn check_token_binding(
    claims: &Claims,
    source: &SourceRef,
    target_namespace: &str,
    target_name: &str,
) -> Result<()> {
    use crate::token::Operation;

    let target_ns = claims.params.get("targetNamespace").map(String::as_str);
    let target_nm = claims.params.get("targetName").map(String::as_str);

    let matches = claims.operation == Operation::Clone
        && claims.name == source.name
        && claims.namespace == source.namespace
        && claims.resource.resource == "persistentvolumeclaims"
        && target_ns == Some(target_namespace)
        && target_nm == Some(target_name);

    if matches {
        Ok(())
    } else {
        Err(Error::InvalidToken(format!(
            "token does not bind source {}/{} to target {}/{}",
            source.namespace, source.name, target_namespace, target_name
        )))
    }
}

fn storage_request(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec.as_ref()?.resources.as_ref()?.requests.as_ref()?.get("storage")
}

fn volume_mode(pvc: &PersistentVolumeClaim) -> &str {
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .unwrap_or("Filesystem")
}

/// Parse a Kubernetes resource `Quantity` string into a comparable byte
/// count. Supports the binary (`Ki`/`Mi`/`Gi`/`Ti`) and decimal
/// (`k`/`M`/`G`/`T`) SI suffixes used by storage requests; a bare integer
/// is bytes.
pub fn quantity_bytes(q: &Quantity) -> Option<u128> {
    let s = q.0.trim();
    let (num, mult): (&str, u128) = if let Some(n) = s.strip_suffix("Ki") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix("Mi") {
        (n, 1024u128.pow(2))
    } else if let Some(n) = s.strip_suffix("Gi") {
        (n, 1024u128.pow(3))
    } else if let Some(n) = s.strip_suffix("Ti") {
        (n, 1024u128.pow(4))
    } else if let Some(n) = s.strip_suffix('k') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1_000_000)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1_000_000_000)
    } else if let Some(n) = s.strip_suffix('T') {
        (n, 1_000_000_000_000)
    } else {
        (s, 1)
    };
    let value: f64 = num.parse().ok()?;
    Some((value * mult as f64).round() as u128)
}

/// Spec compatibility: `target.storageRequest >= source.storageRequest`
/// (byte-exact) and both volume modes equal (absent mode treated as
/// `Filesystem`).
pub fn check_spec_compatible(
    source: &PersistentVolumeClaim,
    target: &PersistentVolumeClaim,
) -> Result<()> {
    let source_mode = volume_mode(source);
    let target_mode = volume_mode(target);
    if source_mode != target_mode {
        return Err(Error::IncompatiblePvc(format!(
            "source volumeMode ({source_mode}) and target volumeMode ({target_mode}) do not match"
        )));
    }

    let source_bytes = storage_request(source).and_then(quantity_bytes);
    let target_bytes = storage_request(target).and_then(quantity_bytes);
    match (source_bytes, target_bytes) {
        (Some(src), Some(dst)) if dst >= src => Ok(()),
        (Some(src), Some(dst)) => Err(Error::IncompatiblePvc(format!(
            "target storage request ({dst} bytes) is smaller than source ({src} bytes)"
        ))),
        _ => Err(Error::IncompatiblePvc(
            "source or target is missing a storage request".to_string(),
        )),
    }
}

pub fn source_ref(pvc: &PersistentVolumeClaim) -> Result<SourceRef> {
    let raw = annotations::clone_request(pvc).ok_or(Error::NotACloneRequest)?;
    parse_clone_request(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use std::collections::BTreeMap;

    fn pvc(storage: &str, mode: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                volume_mode: mode.map(str::to_string),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(storage.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn parses_two_part_request() {
        let r = parse_clone_request("stage/pvc-src").unwrap();
        assert_eq!(r.namespace, "stage");
        assert_eq!(r.name, "pvc-src");
    }

    #[test]
    fn rejects_malformed_requests() {
        assert!(parse_clone_request("no-slash").is_err());
        assert!(parse_clone_request("/missing-ns").is_err());
        assert!(parse_clone_request("missing-name/").is_err());
    }

    #[test]
    fn quantity_parses_binary_and_decimal_suffixes() {
        assert_eq!(quantity_bytes(&Quantity("1Gi".into())), Some(1024u128.pow(3)));
        assert_eq!(quantity_bytes(&Quantity("5Gi".into())), Some(5 * 1024u128.pow(3)));
        assert_eq!(quantity_bytes(&Quantity("100".into())), Some(100));
        assert_eq!(quantity_bytes(&Quantity("2k".into())), Some(2000));
    }

    #[test]
    fn size_mismatch_rejected() {
        let source = pvc("10Gi", None);
        let target = pvc("5Gi", None);
        assert!(check_spec_compatible(&source, &target).is_err());
    }

    #[test]
    fn equal_size_accepted() {
        let source = pvc("5Gi", None);
        let target = pvc("5Gi", None);
        assert!(check_spec_compatible(&source, &target).is_ok());
    }

    #[test]
    fn volume_mode_mismatch_rejected_with_message() {
        let source = pvc("5Gi", None); // absent => Filesystem
        let target = pvc("5Gi", Some("Block"));
        let err = check_spec_compatible(&source, &target).unwrap_err();
        assert!(err
            .to_string()
            .contains("source volumeMode (Filesystem) and target volumeMode (Block) do not match"));
    }

    fn claims_for(source: &SourceRef, target_ns: &str, target_name: &str) -> Claims {
        use crate::token::{Operation, ResourceRef};
        use std::collections::HashMap;
        Claims {
            operation: Operation::Clone,
            name: source.name.clone(),
            namespace: source.namespace.clone(),
            resource: ResourceRef {
                group: String::new(),
                version: "v1".into(),
                resource: "persistentvolumeclaims".into(),
            },
            params: HashMap::from([
                ("targetNamespace".to_string(), target_ns.to_string()),
                ("targetName".to_string(), target_name.to_string()),
            ]),
        }
    }

    #[test]
    fn token_binding_accepts_exact_match() {
        let source = SourceRef {
            namespace: "stage".into(),
            name: "pvc-src".into(),
        };
        let claims = claims_for(&source, "prod", "pvc-dst");
        assert!(check_token_binding(&claims, &source, "prod", "pvc-dst").is_ok());
    }

    #[test]
    fn token_binding_rejects_any_single_field_mutation() {
        let source = SourceRef {
            namespace: "stage".into(),
            name: "pvc-src".into(),
        };
        let claims = claims_for(&source, "prod", "pvc-dst");

        assert!(check_token_binding(&claims, &source, "prod", "wrong-name").is_err());
        assert!(check_token_binding(&claims, &source, "wrong-ns", "pvc-dst").is_err());

        let other_source = SourceRef {
            namespace: "stage".into(),
            name: "other-pvc".into(),
        };
        assert!(check_token_binding(&claims, &other_source, "prod", "pvc-dst").is_err());
    }
}
