/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2023. All rights reserved.
 * CDI is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

//! Smart (snapshot-backed) and CSI-native clone orchestration: strategy
//! resolution, preconditions with host-assisted fallback, the snapshot /
//! restore / transfer / expansion sequence and its recovery rules.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, ObjectMeta};
use kube::core::ErrorResponse;
use kube::{Client, Resource, ResourceExt};
use log::debug;

use common::apiclient::data_volume_owner_reference;
use common::crd::{
    CdiCloneStrategy, DataVolume, DataVolumeSourcePvc, ObjectTransfer, ObjectTransferSpec,
    StorageProfile, TransferSource, TransferTarget, VolumeSnapshot, VolumeSnapshotClass,
    VolumeSnapshotSource, VolumeSnapshotSpec, CDI,
};
use common::utils::parse_quantity;
use common::values::{
    ANN_CLONE_OF, APP_KUBERNETES_PART_OF_LABEL, CDI_CR_NAME, CDI_LABEL_VALUE,
    OBJECT_TRANSFER_PREFIX,
};

use super::datavolume::reconciler_error::Error;

/// How the target PVC of this clone gets its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneKind {
    NoClone,
    HostAssisted,
    Snapshot,
    CsiClone,
}

/// Resolve the clone source declared on the DataVolume, following a
/// SourceRef through its DataSource when needed.
pub async fn resolved_clone_source(
    client: &Client,
    dv: &DataVolume,
) -> Result<Option<DataVolumeSourcePvc>, Error> {
    if let Some(source) = &dv.spec.source {
        if let Some(pvc) = &source.pvc {
            return Ok(Some(normalized_source(dv, pvc)));
        }
        return Ok(None);
    }
    if let Some(source_ref) = &dv.spec.source_ref {
        if source_ref.kind != common::crd::DATA_VOLUME_DATA_SOURCE {
            return Ok(None);
        }
        let namespace = source_ref
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| dv.namespace())
            .unwrap_or_default();
        let ds_api: Api<common::crd::DataSource> = Api::namespaced(client.clone(), &namespace);
        let data_source = ds_api.get(&source_ref.name).await?;
        if let Some(pvc) = &data_source.spec.source.pvc {
            let source = DataVolumeSourcePvc {
                namespace: if pvc.namespace.is_empty() {
                    namespace
                } else {
                    pvc.namespace.clone()
                },
                name: pvc.name.clone(),
            };
            return Ok(Some(source));
        }
    }
    Ok(None)
}

fn normalized_source(dv: &DataVolume, pvc: &DataVolumeSourcePvc) -> DataVolumeSourcePvc {
    DataVolumeSourcePvc {
        namespace: if pvc.namespace.is_empty() {
            dv.namespace().unwrap_or_default()
        } else {
            pvc.namespace.clone()
        },
        name: pvc.name.clone(),
    }
}

/// The cluster-wide strategy override on the CDI resource, if any.
pub async fn get_global_clone_strategy_override(
    client: &Client,
) -> Result<Option<CdiCloneStrategy>, Error> {
    let cdi_api: Api<CDI> = Api::all(client.clone());
    match cdi_api.get(CDI_CR_NAME).await {
        Ok(cdi) => Ok(cdi.spec.clone_strategy_override),
        Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => Ok(None),
        Err(err) => Err(Error::KubeClient { source: err }),
    }
}

/// Strategy precedence, first rule wins: cluster-wide override, then the
/// target storage class profile's preference, then snapshot.
pub fn resolve_strategy(
    global_override: Option<CdiCloneStrategy>,
    profile_preference: Option<CdiCloneStrategy>,
) -> CdiCloneStrategy {
    global_override.or(profile_preference).unwrap_or(CdiCloneStrategy::Snapshot)
}

pub async fn get_clone_strategy(
    client: &Client,
    target_sc_name: Option<&str>,
) -> Result<CdiCloneStrategy, Error> {
    let global_override = get_global_clone_strategy_override(client).await?;
    let mut profile_preference = None;
    if let Some(sc_name) = target_sc_name {
        let profile_api: Api<StorageProfile> = Api::all(client.clone());
        match profile_api.get(sc_name).await {
            Ok(profile) => {
                profile_preference = profile.status.and_then(|s| s.clone_strategy);
            }
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => {}
            Err(err) => return Err(Error::KubeClient { source: err }),
        }
    }
    Ok(resolve_strategy(global_override, profile_preference))
}

/// The VolumeSnapshotClass to use for a smart clone: the target storage
/// class must exist and a snapshot class must match its provisioner.
/// `None` means smart cloning is not possible and the caller falls back.
pub async fn get_snapshot_class_for_smart_clone(
    client: &Client,
    target_sc_name: Option<&str>,
) -> Result<Option<String>, Error> {
    let sc_name = match target_sc_name {
        Some(name) => name,
        None => return Ok(None),
    };
    let sc_api: Api<StorageClass> = Api::all(client.clone());
    let sc = match sc_api.get(sc_name).await {
        Ok(sc) => sc,
        Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => {
            return Err(Error::Operation {
                value: format!("unable to retrieve storage class {}", sc_name),
            })
        }
        Err(err) => return Err(Error::KubeClient { source: err }),
    };
    let class_api: Api<VolumeSnapshotClass> = Api::all(client.clone());
    let classes = match class_api.list(&ListParams::default()).await {
        Ok(classes) => classes,
        // snapshot API not installed
        Err(_) => return Ok(None),
    };
    for class in classes.items {
        if class.driver == sc.provisioner {
            return Ok(Some(class.name()));
        }
    }
    Ok(None)
}

/// Snapshot-based and CSI clones need source and target on the same
/// storage class. The source PVC must exist.
pub async fn advanced_clone_possible(
    client: &Client,
    source: &DataVolumeSourcePvc,
    target_sc_name: Option<&str>,
) -> Result<bool, Error> {
    let pvc_api: Api<PersistentVolumeClaim> =
        Api::namespaced(client.clone(), &source.namespace);
    let source_pvc = match pvc_api.get(&source.name).await {
        Ok(pvc) => pvc,
        Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => {
            return Err(Error::CloneSourceMissing {
                namespace: source.namespace.clone(),
                name: source.name.clone(),
            })
        }
        Err(err) => return Err(Error::KubeClient { source: err }),
    };
    let target_sc_name = match target_sc_name {
        Some(name) => name,
        None => return Ok(false),
    };
    let source_sc = source_pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref());
    Ok(source_sc == Some(target_sc_name))
}

/// Any pod mounting the source PVC (read-only or read-write) blocks the
/// snapshot. Returns the first offending pod name.
pub async fn source_in_use(
    client: &Client,
    source: &DataVolumeSourcePvc,
) -> Result<Option<String>, Error> {
    let pod_api: Api<Pod> = Api::namespaced(client.clone(), &source.namespace);
    let pods = pod_api.list(&ListParams::default()).await?;
    for pod in pods.items {
        let volumes = pod.spec.as_ref().and_then(|s| s.volumes.as_ref());
        let mounts_source = volumes
            .map(|vols| {
                vols.iter().any(|v| {
                    v.persistent_volume_claim
                        .as_ref()
                        .map(|c| c.claim_name == source.name)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        if mounts_source {
            return Ok(Some(pod.name()));
        }
    }
    Ok(None)
}

/// Snapshot for a smart clone, named after the DataVolume and owned by it
/// when it lives in the DataVolume's namespace.
pub fn new_snapshot_for_clone(
    dv: &DataVolume,
    source: &DataVolumeSourcePvc,
    snapshot_namespace: &str,
    snapshot_class: &str,
) -> VolumeSnapshot {
    let same_namespace = dv.namespace().as_deref() == Some(snapshot_namespace);
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(APP_KUBERNETES_PART_OF_LABEL.to_string(), CDI_LABEL_VALUE.to_string());
    VolumeSnapshot {
        metadata: ObjectMeta {
            name: Some(dv.name()),
            namespace: Some(snapshot_namespace.to_string()),
            labels: Some(labels),
            owner_references: if same_namespace {
                Some(vec![data_volume_owner_reference(dv)])
            } else {
                None
            },
            ..ObjectMeta::default()
        },
        spec: VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(source.name.clone()),
                volume_snapshot_content_name: None,
            },
            volume_snapshot_class_name: Some(snapshot_class.to_string()),
        },
        status: None,
    }
}

pub fn snapshot_ready(snapshot: &VolumeSnapshot) -> bool {
    snapshot.status.as_ref().and_then(|s| s.ready_to_use).unwrap_or(false)
}

/// The transfer record that moves a restored PVC from the clone source
/// namespace into the DataVolume's namespace.
pub fn new_object_transfer(
    dv: &DataVolume,
    source_namespace: &str,
    source_name: &str,
) -> ObjectTransfer {
    ObjectTransfer {
        metadata: ObjectMeta {
            name: Some(transfer_name(dv)),
            ..ObjectMeta::default()
        },
        spec: ObjectTransferSpec {
            source: TransferSource {
                kind: "PersistentVolumeClaim".to_string(),
                namespace: source_namespace.to_string(),
                name: source_name.to_string(),
            },
            target: TransferTarget { namespace: dv.namespace(), name: Some(dv.name()) },
        },
        status: None,
    }
}

pub fn transfer_name(dv: &DataVolume) -> String {
    format!("{}-{}", OBJECT_TRANSFER_PREFIX, dv.meta().uid.clone().unwrap_or_default())
}

/// Name of the intermediate restored PVC for a cross-namespace clone.
pub fn restored_pvc_name(dv: &DataVolume) -> String {
    transfer_name(dv)
}

/// Whether the bound clone target still needs its capacity raised to the
/// requested size; `Some` carries the size to set on the PVC spec when the
/// current request is short.
pub fn expansion_state(
    pvc: &PersistentVolumeClaim,
    requested: &str,
) -> Result<ExpansionState, Error> {
    let requested_bytes = parse_quantity(requested)
        .map_err(|_| Error::Operation { value: format!("cannot parse size {}", requested) })?;
    let spec_bytes = pvc
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .and_then(|q| parse_quantity(&q.0).ok())
        .unwrap_or(0);
    let capacity_bytes = pvc
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .and_then(|q| parse_quantity(&q.0).ok())
        .unwrap_or(0);

    if spec_bytes < requested_bytes {
        return Ok(ExpansionState::GrowRequest);
    }
    if capacity_bytes < requested_bytes {
        debug!("waiting for capacity to reach {}", requested);
        return Ok(ExpansionState::WaitForCapacity);
    }
    Ok(ExpansionState::Complete)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionState {
    /// PVC spec still requests less than the clone wants; grow it.
    GrowRequest,
    /// Spec already raised, capacity not caught up yet.
    WaitForCapacity,
    /// Capacity satisfies the request.
    Complete,
}

pub fn is_clone_target(pvc: &PersistentVolumeClaim) -> Option<CloneKind> {
    let annotations = pvc.metadata.annotations.as_ref()?;
    if annotations.contains_key(common::values::ANN_SMART_CLONE_REQUEST) {
        Some(CloneKind::Snapshot)
    } else if annotations.contains_key(common::values::ANN_CSI_CLONE_REQUEST) {
        Some(CloneKind::CsiClone)
    } else if annotations.contains_key(common::values::ANN_CLONE_REQUEST) {
        Some(CloneKind::HostAssisted)
    } else {
        None
    }
}

pub fn clone_of(pvc: &PersistentVolumeClaim) -> bool {
    pvc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANN_CLONE_OF))
        .map(|v| v == "true")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use common::crd::{DataVolumeSource, DataVolumeSpec};

    use super::*;

    fn clone_dv(name: &str) -> DataVolume {
        let mut dv = DataVolume::new(
            name,
            DataVolumeSpec {
                source: Some(DataVolumeSource {
                    pvc: Some(DataVolumeSourcePvc {
                        namespace: "".to_string(),
                        name: "test".to_string(),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        dv.meta_mut().namespace = Some("default".to_string());
        dv.meta_mut().uid = Some("uid".to_string());
        dv
    }

    fn sized_pvc(spec_size: &str, capacity: &str) -> PersistentVolumeClaim {
        let mut requests = std::collections::BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(spec_size.to_string()));
        let mut cap = std::collections::BTreeMap::new();
        cap.insert("storage".to_string(), Quantity(capacity.to_string()));
        PersistentVolumeClaim {
            metadata: ObjectMeta::default(),
            spec: Some(PersistentVolumeClaimSpec {
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                capacity: Some(cap),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_expansion_state() {
        assert_eq!(expansion_state(&sized_pvc("500M", "500M"), "1G").unwrap(), ExpansionState::GrowRequest);
        assert_eq!(expansion_state(&sized_pvc("500M", "2G"), "1G").unwrap(), ExpansionState::GrowRequest);
        assert_eq!(expansion_state(&sized_pvc("1G", "500M"), "1G").unwrap(), ExpansionState::WaitForCapacity);
        assert_eq!(expansion_state(&sized_pvc("1G", "1G"), "1G").unwrap(), ExpansionState::Complete);
        assert!(expansion_state(&sized_pvc("1G", "1G"), "one gig").is_err());
    }

    #[test]
    fn test_new_snapshot_same_namespace_is_owned() {
        let dv = clone_dv("test-dv");
        let source = DataVolumeSourcePvc { namespace: "default".into(), name: "test".into() };
        let snap = new_snapshot_for_clone(&dv, &source, "default", "snap-class");
        assert_eq!(snap.metadata.name.as_deref(), Some("test-dv"));
        assert!(snap.metadata.owner_references.is_some());
        assert_eq!(
            snap.metadata.labels.as_ref().unwrap().get(APP_KUBERNETES_PART_OF_LABEL).map(String::as_str),
            Some(CDI_LABEL_VALUE)
        );
        assert_eq!(
            snap.spec.source.persistent_volume_claim_name.as_deref(),
            Some("test")
        );
        assert_eq!(snap.spec.volume_snapshot_class_name.as_deref(), Some("snap-class"));
    }

    #[test]
    fn test_new_snapshot_cross_namespace_is_unowned() {
        let dv = clone_dv("test-dv");
        let source = DataVolumeSourcePvc { namespace: "other".into(), name: "test".into() };
        let snap = new_snapshot_for_clone(&dv, &source, "other", "snap-class");
        assert!(snap.metadata.owner_references.is_none());
        assert_eq!(snap.metadata.namespace.as_deref(), Some("other"));
    }

    #[test]
    fn test_object_transfer_names_the_moved_pvc() {
        let dv = clone_dv("test-dv");
        let transfer = new_object_transfer(&dv, "other", "cdi-tmp-uid");
        assert_eq!(transfer.metadata.name.as_deref(), Some("cdi-tmp-uid"));
        assert_eq!(transfer.spec.source.kind, "PersistentVolumeClaim");
        assert_eq!(transfer.spec.source.namespace, "other");
        assert_eq!(transfer.spec.target.namespace.as_deref(), Some("default"));
        assert_eq!(transfer.spec.target.name.as_deref(), Some("test-dv"));
    }

    #[test]
    fn test_strategy_precedence() {
        use CdiCloneStrategy::*;
        // the cluster-wide override always wins
        assert_eq!(resolve_strategy(Some(HostAssisted), Some(Snapshot)), HostAssisted);
        assert_eq!(resolve_strategy(Some(HostAssisted), Some(CsiClone)), HostAssisted);
        assert_eq!(resolve_strategy(Some(Snapshot), Some(HostAssisted)), Snapshot);
        assert_eq!(resolve_strategy(Some(Snapshot), None), Snapshot);
        // then the profile preference
        assert_eq!(resolve_strategy(None, Some(CsiClone)), CsiClone);
        assert_eq!(resolve_strategy(None, Some(HostAssisted)), HostAssisted);
        // snapshot is the default
        assert_eq!(resolve_strategy(None, None), Snapshot);
    }

    #[test]
    fn test_is_clone_target() {
        let mut pvc = sized_pvc("1G", "1G");
        assert_eq!(is_clone_target(&pvc), None);
        let mut anns = std::collections::BTreeMap::new();
        anns.insert(common::values::ANN_SMART_CLONE_REQUEST.to_string(), "true".to_string());
        pvc.metadata.annotations = Some(anns.clone());
        assert_eq!(is_clone_target(&pvc), Some(CloneKind::Snapshot));
        anns.clear();
        anns.insert(common::values::ANN_CSI_CLONE_REQUEST.to_string(), "true".to_string());
        pvc.metadata.annotations = Some(anns.clone());
        assert_eq!(is_clone_target(&pvc), Some(CloneKind::CsiClone));
        anns.clear();
        anns.insert(common::values::ANN_CLONE_REQUEST.to_string(), "default/test".to_string());
        pvc.metadata.annotations = Some(anns);
        assert_eq!(is_clone_target(&pvc), Some(CloneKind::HostAssisted));
    }
}
