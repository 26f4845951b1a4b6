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

//! The DataVolume state machine. Level-triggered: every reconcile reads
//! the DataVolume, its PVC and the worker pod state mirrored onto the PVC
//! annotations, computes the next observable state and performs one
//! idempotent mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, ObjectMeta};
use kube::core::ErrorResponse;
use kube::runtime::controller::{Context, ReconcilerAction};
use kube::{Client, Resource, ResourceExt};
use log::{debug, error, info, warn};
use reconciler_error::Error;

use common::apiclient::{data_volume_owner_reference, data_volume_ref, ApplyApi};
use common::crd::{
    CdiCloneStrategy, DataVolume, DataVolumeCondition, DataVolumeConditionType,
    DataVolumeContentType, DataVolumePhase, DataVolumeSourcePvc, DataVolumeStatus, CDIConfig,
    StorageProfile, VolumeSnapshot,
};
use common::utils::{
    merge_labels, parse_quantity, quantity, resolve_volume_mode, set_recommended_labels,
    CLAIM_BOUND, CLAIM_LOST, CLAIM_PENDING, POD_FAILED, POD_PENDING, POD_RUNNING, POD_SUCCEEDED,
    VOLUME_MODE_BLOCK, VOLUME_MODE_FILESYSTEM,
};
use common::values::*;

use super::checkpoint;
use super::clone::{self, CloneKind, ExpansionState};
use super::pod;
use super::token::{payload_matches_clone, TokenValidator};

pub struct DataVolumeController<T: ApplyApi> {
    pub k8s_client: Client,
    pub controller_client: T,
    pub token_validator: Arc<dyn TokenValidator>,
    pub installer_labels: BTreeMap<String, String>,
}

impl<T: ApplyApi> DataVolumeController<T> {
    pub fn new(
        k8s_client: Client,
        controller_client: T,
        token_validator: Arc<dyn TokenValidator>,
        installer_labels: BTreeMap<String, String>,
    ) -> Self {
        DataVolumeController { k8s_client, controller_client, token_validator, installer_labels }
    }
}

#[derive(Debug, Clone, Default)]
struct StatusOverride {
    phase: Option<DataVolumePhase>,
    progress: Option<String>,
}

pub async fn reconcile<T: ApplyApi>(
    dv: DataVolume,
    ctx: Context<DataVolumeController<T>>,
) -> Result<ReconcilerAction, Error> {
    debug!("start reconcile DataVolume");
    let controller = ctx.get_ref();
    let namespace = dv.namespace().ok_or(Error::MissingObjectKey {
        resource: "datavolume".to_string(),
        value: "namespace".to_string(),
    })?;
    let name = dv.name();

    if let Some(action) = controller.maybe_garbage_collect(&dv).await? {
        return Ok(action);
    }

    match controller.get_pvc(&namespace, &name).await? {
        Some(pvc) => controller.reconcile_with_pvc(&dv, pvc).await,
        None => controller.reconcile_absent_pvc(&dv).await,
    }
}

pub fn error_policy<T: ApplyApi>(
    error: &Error,
    _ctx: Context<DataVolumeController<T>>,
) -> ReconcilerAction {
    error!("DataVolume reconciliation error: {}", error);
    REQUEUE_ERROR
}

impl<T: ApplyApi> DataVolumeController<T> {
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let pvc_api: Api<PersistentVolumeClaim> = Api::namespaced(self.k8s_client.clone(), namespace);
        match pvc_api.get(name).await {
            Ok(pvc) => Ok(Some(pvc)),
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => Ok(None),
            Err(err) => Err(Error::KubeClient { source: err }),
        }
    }

    /// Succeeded DataVolumes that opted into TTL cleanup are deleted once
    /// their time is up. A manual `deleteAfterCompletion=false` wins; the
    /// conflict with a configured TTL is surfaced, never overwritten.
    async fn maybe_garbage_collect(&self, dv: &DataVolume) -> Result<Option<ReconcilerAction>, Error> {
        let phase = dv.status.as_ref().map(|s| s.phase).unwrap_or_default();
        if phase != DataVolumePhase::Succeeded {
            return Ok(None);
        }
        let opt_in = dv.annotations().get(ANN_DELETE_AFTER_COMPLETION).map(String::as_str);
        if opt_in.is_none() {
            return Ok(None);
        }
        let config_api: Api<CDIConfig> = Api::all(self.k8s_client.clone());
        let ttl = match config_api.get(CONFIG_NAME).await {
            Ok(config) => config.spec.data_volume_ttl_seconds,
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => None,
            Err(err) => return Err(Error::KubeClient { source: err }),
        };
        let ttl = match ttl {
            Some(ttl) => ttl,
            None => return Ok(None),
        };
        if opt_in == Some("false") {
            warn!("DataVolume {} opted out of the configured TTL cleanup", dv.name());
            self.controller_client
                .publish_event(
                    data_volume_ref(dv),
                    EVENT_TYPE_WARNING,
                    REASON_DELETE_AFTER_COMPLETION_CONFLICT,
                    "DataVolumeTTLSeconds is configured but deleteAfterCompletion is false; leaving the DataVolume in place",
                )
                .await?;
            return Ok(Some(NO_REQUEUE));
        }
        let age = dv
            .meta()
            .creation_timestamp
            .as_ref()
            .map(|created| (chrono::Utc::now() - created.0).num_seconds())
            .unwrap_or(0);
        if age >= ttl {
            info!("garbage collecting completed DataVolume {}", dv.name());
            let namespace = dv.namespace().unwrap_or_default();
            self.controller_client.delete_data_volume(&dv.name(), &namespace).await?;
            return Ok(Some(NO_REQUEUE));
        }
        let remaining = (ttl - age).max(1) as u64;
        Ok(Some(ReconcilerAction {
            requeue_after: Some(std::time::Duration::from_secs(remaining)),
        }))
    }

    async fn reconcile_with_pvc(
        &self,
        dv: &DataVolume,
        pvc: PersistentVolumeClaim,
    ) -> Result<ReconcilerAction, Error> {
        let name = dv.name();
        if !is_pvc_owned_by(&pvc, dv) {
            if pvc_annotation(&pvc, ANN_POPULATED_FOR) == Some(name.as_str()) {
                return self.adopt_prepopulated_pvc(dv, pvc).await;
            }
            if pvc_annotation(&pvc, ANN_SMART_CLONE_REQUEST).is_some()
                && dv.status.as_ref().map(|s| s.phase)
                    == Some(DataVolumePhase::NamespaceTransferInProgress)
            {
                // the transfer landed the restored PVC in our namespace
                return self.adopt_transferred_clone(dv, pvc).await;
            }
            let message =
                format!("Resource \"{}\" already exists and is not managed by DataVolume", name);
            self.controller_client
                .publish_event(
                    data_volume_ref(dv),
                    EVENT_TYPE_WARNING,
                    REASON_ERR_RESOURCE_EXISTS,
                    &message,
                )
                .await?;
            return Err(Error::ResourceExists { name });
        }

        self.sync_vddk_annotations(dv, &pvc).await?;

        let mut state_override = StatusOverride::default();
        match clone::is_clone_target(&pvc) {
            Some(kind @ (CloneKind::Snapshot | CloneKind::CsiClone)) => {
                state_override.phase = self.sync_clone_target(dv, &pvc, kind).await?;
            }
            _ => {
                self.sync_checkpoints(dv, &pvc).await?;
            }
        }

        self.reconcile_status(dv, Some(&pvc), state_override).await?;
        Ok(REQUEUE_NORMAL)
    }

    /// A PVC that was populated ahead of the DataVolume: adopt it and jump
    /// straight to Succeeded with no progress to report.
    async fn adopt_prepopulated_pvc(
        &self,
        dv: &DataVolume,
        pvc: PersistentVolumeClaim,
    ) -> Result<ReconcilerAction, Error> {
        let name = dv.name();
        info!("adopting pre-populated PVC {}", name);
        let mut owned = pvc.clone();
        owned
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(data_volume_owner_reference(dv));
        self.controller_client.replace_pvc(&owned).await?;

        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_PRE_POPULATED.to_string(), name.clone());
        let namespace = dv.namespace().unwrap_or_default();
        self.controller_client
            .merge_data_volume_annotations(&name, &namespace, &annotations)
            .await?;

        let state_override = StatusOverride {
            phase: Some(DataVolumePhase::Succeeded),
            progress: Some(PROGRESS_NOT_AVAILABLE.to_string()),
        };
        self.reconcile_status(dv, Some(&owned), state_override).await?;
        Ok(REQUEUE_NORMAL)
    }

    /// Cross-namespace smart clone: the object transfer recreated the
    /// restored PVC here without an owner; tie its lifecycle to the
    /// DataVolume and let the normal clone progression pick it up.
    async fn adopt_transferred_clone(
        &self,
        dv: &DataVolume,
        pvc: PersistentVolumeClaim,
    ) -> Result<ReconcilerAction, Error> {
        info!("adopting transferred clone PVC {}", pvc.name());
        let mut owned = pvc;
        owned
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(data_volume_owner_reference(dv));
        self.controller_client.replace_pvc(&owned).await?;
        Ok(REQUEUE_NORMAL)
    }

    /// VDDK import details reported on the PVC round-trip to the
    /// DataVolume for consumers to read.
    async fn sync_vddk_annotations(
        &self,
        dv: &DataVolume,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        let mut annotations = BTreeMap::new();
        for key in [ANN_VDDK_HOST_CONNECTION, ANN_VDDK_VERSION] {
            if let Some(value) = pvc_annotation(pvc, key) {
                if dv.annotations().get(key).map(String::as_str) != Some(value) {
                    annotations.insert(key.to_string(), value.to_string());
                }
            }
        }
        if annotations.is_empty() {
            return Ok(());
        }
        let namespace = dv.namespace().unwrap_or_default();
        self.controller_client
            .merge_data_volume_annotations(&dv.name(), &namespace, &annotations)
            .await
            .map_err(Error::from)
    }

    /// Stamp missing checkpoint annotations; advance the protocol after a
    /// completed delta copy. Existing annotations are never overwritten.
    async fn sync_checkpoints(
        &self,
        dv: &DataVolume,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        if dv.spec.checkpoints.is_empty() {
            return Ok(());
        }
        let namespace = dv.namespace().unwrap_or_default();
        let annotations = pvc.metadata.annotations.clone().unwrap_or_default();

        let initial = checkpoint::initial_annotations(dv, &annotations);
        if !initial.is_empty() {
            let patch: BTreeMap<String, Option<String>> =
                initial.into_iter().map(|(k, v)| (k, Some(v))).collect();
            self.controller_client
                .merge_pvc_annotations(&pvc.name(), &namespace, &patch)
                .await?;
            return Ok(());
        }

        if let Some(patch) = checkpoint::advance_on_pod_success(dv, &annotations) {
            let patch = prune_annotation_patch(patch, &annotations);
            if !patch.is_empty() {
                self.controller_client
                    .merge_pvc_annotations(&pvc.name(), &namespace, &patch)
                    .await?;
            }
        }
        Ok(())
    }

    /// Progression of an owned smart/CSI clone target. Returns the phase
    /// the DataVolume should report.
    async fn sync_clone_target(
        &self,
        dv: &DataVolume,
        pvc: &PersistentVolumeClaim,
        kind: CloneKind,
    ) -> Result<Option<DataVolumePhase>, Error> {
        let pvc_phase = claim_phase(pvc);
        match pvc_phase {
            CLAIM_PENDING => Ok(Some(match kind {
                CloneKind::CsiClone => DataVolumePhase::CSICloneInProgress,
                _ => DataVolumePhase::SmartClonePVCInProgress,
            })),
            CLAIM_LOST => Ok(Some(DataVolumePhase::Failed)),
            CLAIM_BOUND => {
                let namespace = dv.namespace().unwrap_or_default();
                if !clone::clone_of(pvc) {
                    let mut patch = BTreeMap::new();
                    patch.insert(ANN_CLONE_OF.to_string(), Some("true".to_string()));
                    self.controller_client
                        .merge_pvc_annotations(&pvc.name(), &namespace, &patch)
                        .await?;
                }
                let requested = requested_size(dv)?;
                match clone::expansion_state(pvc, &requested)? {
                    ExpansionState::GrowRequest => {
                        info!("expanding clone target {} to {}", pvc.name(), requested);
                        self.controller_client
                            .patch_pvc_requested_size(&pvc.name(), &namespace, &quantity(&requested))
                            .await?;
                        Ok(Some(DataVolumePhase::ExpansionInProgress))
                    }
                    ExpansionState::WaitForCapacity => {
                        Ok(Some(DataVolumePhase::ExpansionInProgress))
                    }
                    ExpansionState::Complete => {
                        if kind == CloneKind::Snapshot {
                            // consumed; delete the snapshot if it is still
                            // around, and never bring it back
                            self.delete_snapshot_if_exists(&namespace, &dv.name()).await?;
                        }
                        Ok(Some(DataVolumePhase::Succeeded))
                    }
                }
            }
            _ => Ok(None),
        }
    }

    async fn delete_snapshot_if_exists(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let snap_api: Api<VolumeSnapshot> = Api::namespaced(self.k8s_client.clone(), namespace);
        match snap_api.get(name).await {
            Ok(_) => {
                info!("deleting consumed snapshot {}/{}", namespace, name);
                self.controller_client.delete_volume_snapshot(name, namespace).await?;
                Ok(())
            }
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => Ok(()),
            Err(err) => Err(Error::KubeClient { source: err }),
        }
    }

    async fn reconcile_absent_pvc(&self, dv: &DataVolume) -> Result<ReconcilerAction, Error> {
        if let Some(source) = clone::resolved_clone_source(&self.k8s_client, dv).await? {
            return self.reconcile_clone_absent_target(dv, source).await;
        }
        let pvc = self.render_pvc(dv, None).await?;
        self.controller_client.create_pvc(&pvc).await?;
        self.reconcile_status(dv, Some(&pvc), StatusOverride::default()).await?;
        Ok(REQUEUE_NORMAL)
    }

    async fn reconcile_clone_absent_target(
        &self,
        dv: &DataVolume,
        source: DataVolumeSourcePvc,
    ) -> Result<ReconcilerAction, Error> {
        let namespace = dv.namespace().unwrap_or_default();
        if source.namespace != namespace {
            self.validate_clone_token(dv, &source).await?;
        }
        if dv.status.as_ref().map(|s| s.phase) == Some(DataVolumePhase::NamespaceTransferInProgress)
        {
            // the transfer executor owns the next step; the PVC appearing
            // in our namespace retriggers us
            debug!("waiting for namespace transfer of clone target");
            return Ok(REQUEUE_NORMAL);
        }

        let target_sc_name = self.resolve_target_storage_class(dv).await?;
        let strategy = clone::get_clone_strategy(&self.k8s_client, target_sc_name.as_deref()).await?;

        let mut kind = match strategy {
            CdiCloneStrategy::HostAssisted => CloneKind::HostAssisted,
            CdiCloneStrategy::Snapshot => CloneKind::Snapshot,
            CdiCloneStrategy::CsiClone => CloneKind::CsiClone,
        };
        let mut snapshot_class = None;
        if kind == CloneKind::Snapshot {
            snapshot_class = clone::get_snapshot_class_for_smart_clone(
                &self.k8s_client,
                target_sc_name.as_deref(),
            )
            .await?;
            if snapshot_class.is_none() {
                debug!("no matching VolumeSnapshotClass, falling back to host-assisted clone");
                kind = CloneKind::HostAssisted;
            }
        }
        if kind != CloneKind::HostAssisted
            && !clone::advanced_clone_possible(&self.k8s_client, &source, target_sc_name.as_deref())
                .await?
        {
            debug!("source and target storage do not line up, falling back to host-assisted clone");
            kind = CloneKind::HostAssisted;
        }

        if kind == CloneKind::HostAssisted {
            let pvc = self.render_pvc(dv, Some(&source)).await?;
            self.controller_client.create_pvc(&pvc).await?;
            self.reconcile_status(dv, Some(&pvc), StatusOverride::default()).await?;
            return Ok(REQUEUE_NORMAL);
        }

        if let Some(pod_name) = clone::source_in_use(&self.k8s_client, &source).await? {
            self.controller_client
                .publish_event(
                    data_volume_ref(dv),
                    EVENT_TYPE_WARNING,
                    REASON_SMART_CLONE_SOURCE_IN_USE,
                    &format!(
                        "pod {} is using PersistentVolumeClaim {}/{}",
                        pod_name, source.namespace, source.name
                    ),
                )
                .await?;
            return Ok(REQUEUE_ERROR);
        }

        match kind {
            CloneKind::Snapshot => {
                let snapshot_class = snapshot_class.unwrap_or_default();
                self.reconcile_smart_clone(dv, &source, &snapshot_class).await
            }
            CloneKind::CsiClone => self.start_csi_clone(dv, &source).await,
            _ => unreachable!(),
        }
    }

    async fn validate_clone_token(
        &self,
        dv: &DataVolume,
        source: &DataVolumeSourcePvc,
    ) -> Result<(), Error> {
        let namespace = dv.namespace().unwrap_or_default();
        let token = dv.annotations().get(ANN_CLONE_TOKEN).cloned().unwrap_or_default();
        let rejected = |reason: String| Error::CloneToken { reason };
        let payload = self
            .token_validator
            .validate(&token)
            .map_err(|e| rejected(e.to_string()))?;
        if !payload_matches_clone(&payload, &source.namespace, &source.name, &namespace, &dv.name())
        {
            let err = rejected("token does not match the requested clone".to_string());
            self.controller_client
                .publish_event(
                    data_volume_ref(dv),
                    EVENT_TYPE_WARNING,
                    REASON_ERR_CLAIM_NOT_VALID,
                    &err.to_string(),
                )
                .await?;
            return Err(err);
        }
        Ok(())
    }

    async fn reconcile_smart_clone(
        &self,
        dv: &DataVolume,
        source: &DataVolumeSourcePvc,
        snapshot_class: &str,
    ) -> Result<ReconcilerAction, Error> {
        let namespace = dv.namespace().unwrap_or_default();
        let same_namespace = source.namespace == namespace;
        let snapshot_namespace =
            if same_namespace { namespace.clone() } else { source.namespace.clone() };

        let snap_api: Api<VolumeSnapshot> =
            Api::namespaced(self.k8s_client.clone(), &snapshot_namespace);
        let snapshot = match snap_api.get(&dv.name()).await {
            Ok(snapshot) => Some(snapshot),
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => None,
            Err(err) => return Err(Error::KubeClient { source: err }),
        };

        match snapshot {
            None => {
                info!("creating snapshot for smart clone of {}/{}", source.namespace, source.name);
                let snapshot =
                    clone::new_snapshot_for_clone(dv, source, &snapshot_namespace, snapshot_class);
                self.controller_client.create_volume_snapshot(&snapshot).await?;
                let state_override = StatusOverride {
                    phase: Some(DataVolumePhase::SnapshotForSmartCloneInProgress),
                    progress: None,
                };
                self.reconcile_status(dv, None, state_override).await?;
            }
            Some(snapshot) if !clone::snapshot_ready(&snapshot) => {
                let state_override = StatusOverride {
                    phase: Some(DataVolumePhase::SnapshotForSmartCloneInProgress),
                    progress: None,
                };
                self.reconcile_status(dv, None, state_override).await?;
            }
            Some(_) if same_namespace => {
                let mut pvc = self.render_pvc(dv, Some(source)).await?;
                smart_clone_pvc_from_snapshot(&mut pvc, &dv.name());
                self.controller_client.create_pvc(&pvc).await?;
                let state_override = StatusOverride {
                    phase: Some(DataVolumePhase::SmartClonePVCInProgress),
                    progress: None,
                };
                self.reconcile_status(dv, Some(&pvc), state_override).await?;
            }
            Some(_) => {
                self.advance_cross_namespace_clone(dv, source).await?;
            }
        }
        Ok(REQUEUE_NORMAL)
    }

    /// Cross-namespace smart clone: restore next to the snapshot, then
    /// hand the restored PVC over with an ObjectTransfer.
    async fn advance_cross_namespace_clone(
        &self,
        dv: &DataVolume,
        source: &DataVolumeSourcePvc,
    ) -> Result<(), Error> {
        let restored_name = clone::restored_pvc_name(dv);
        let pvc_api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.k8s_client.clone(), &source.namespace);
        let restored = match pvc_api.get(&restored_name).await {
            Ok(pvc) => Some(pvc),
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => None,
            Err(err) => return Err(Error::KubeClient { source: err }),
        };
        match restored {
            None => {
                info!("restoring snapshot into {}/{}", source.namespace, restored_name);
                let mut pvc = self.render_pvc(dv, Some(source)).await?;
                smart_clone_pvc_from_snapshot(&mut pvc, &dv.name());
                pvc.metadata.name = Some(restored_name);
                pvc.metadata.namespace = Some(source.namespace.clone());
                // ownership cannot span namespaces; the transfer endpoint
                // adopts the PVC once it arrives
                pvc.metadata.owner_references = None;
                self.controller_client.create_pvc(&pvc).await?;
                let state_override = StatusOverride {
                    phase: Some(DataVolumePhase::SmartClonePVCInProgress),
                    progress: None,
                };
                self.reconcile_status(dv, None, state_override).await?;
            }
            Some(restored) if claim_phase(&restored) == CLAIM_BOUND => {
                info!("transferring restored clone into {}", dv.namespace().unwrap_or_default());
                let transfer = clone::new_object_transfer(dv, &source.namespace, &restored.name());
                self.controller_client.create_object_transfer(&transfer).await?;
                let state_override = StatusOverride {
                    phase: Some(DataVolumePhase::NamespaceTransferInProgress),
                    progress: None,
                };
                self.reconcile_status(dv, None, state_override).await?;
            }
            Some(_) => {
                let state_override = StatusOverride {
                    phase: Some(DataVolumePhase::SmartClonePVCInProgress),
                    progress: None,
                };
                self.reconcile_status(dv, None, state_override).await?;
            }
        }
        Ok(())
    }

    async fn start_csi_clone(
        &self,
        dv: &DataVolume,
        source: &DataVolumeSourcePvc,
    ) -> Result<ReconcilerAction, Error> {
        info!("starting CSI clone of {}/{}", source.namespace, source.name);
        let mut pvc = self.render_pvc(dv, Some(source)).await?;
        let annotations = pvc.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.remove(ANN_CLONE_REQUEST);
        annotations.insert(ANN_CSI_CLONE_REQUEST.to_string(), "true".to_string());
        if let Some(spec) = pvc.spec.as_mut() {
            spec.data_source = Some(k8s_openapi::api::core::v1::TypedLocalObjectReference {
                api_group: None,
                kind: "PersistentVolumeClaim".to_string(),
                name: source.name.clone(),
            });
        }
        self.controller_client.create_pvc(&pvc).await?;
        let state_override =
            StatusOverride { phase: Some(DataVolumePhase::CSICloneInProgress), progress: None };
        self.reconcile_status(dv, Some(&pvc), state_override).await?;
        Ok(REQUEUE_NORMAL)
    }

    /// Explicit storage class of the DataVolume, else the cluster default.
    async fn resolve_target_storage_class(&self, dv: &DataVolume) -> Result<Option<String>, Error> {
        let explicit = dv
            .spec
            .pvc
            .as_ref()
            .and_then(|pvc| pvc.storage_class_name.clone())
            .or_else(|| dv.spec.storage.as_ref().and_then(|s| s.storage_class_name.clone()));
        if explicit.is_some() {
            return Ok(explicit);
        }
        let sc_api: Api<StorageClass> = Api::all(self.k8s_client.clone());
        let classes = sc_api.list(&ListParams::default()).await?;
        for sc in classes.items {
            let is_default = sc
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANN_DEFAULT_STORAGE_CLASS))
                .map(|v| v == "true")
                .unwrap_or(false);
            if is_default {
                return Ok(Some(sc.name()));
            }
        }
        Ok(None)
    }

    /// Render the PVC for this DataVolume: resolved spec, propagated and
    /// computed annotations, recommended labels, owner reference.
    async fn render_pvc(
        &self,
        dv: &DataVolume,
        clone_source: Option<&DataVolumeSourcePvc>,
    ) -> Result<PersistentVolumeClaim, Error> {
        let spec = self.resolve_pvc_spec(dv).await?;
        let annotations = self.build_pvc_annotations(dv, clone_source);

        let mut labels = BTreeMap::new();
        labels.insert(CDI_LABEL_KEY.to_string(), CDI_LABEL_VALUE.to_string());
        labels.insert(
            PV_FILLING_UP_SUPPRESS_LABEL_KEY.to_string(),
            PV_FILLING_UP_SUPPRESS_LABEL_VALUE.to_string(),
        );
        merge_labels(&self.installer_labels, &mut labels);
        set_recommended_labels(&mut labels, &self.installer_labels, "cdi-controller");

        Ok(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(dv.name()),
                namespace: dv.namespace(),
                labels: Some(labels),
                annotations: Some(annotations),
                owner_references: Some(vec![data_volume_owner_reference(dv)]),
                ..ObjectMeta::default()
            },
            spec: Some(spec),
            status: None,
        })
    }

    /// The effective PVC spec. A legacy `spec.pvc` is taken as-is; the
    /// newer `spec.storage` is completed from the storage profile of the
    /// target class.
    async fn resolve_pvc_spec(&self, dv: &DataVolume) -> Result<PersistentVolumeClaimSpec, Error> {
        if let Some(pvc_spec) = &dv.spec.pvc {
            return Ok(pvc_spec.clone());
        }
        let storage = dv.spec.storage.clone().unwrap_or_default();
        let mut spec = PersistentVolumeClaimSpec {
            access_modes: storage.access_modes.clone(),
            volume_mode: storage.volume_mode.clone(),
            resources: storage.resources.clone(),
            storage_class_name: storage.storage_class_name.clone(),
            ..PersistentVolumeClaimSpec::default()
        };

        let requested = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .cloned()
            .ok_or(Error::MissingStorageSize)?;

        let is_archive = dv.spec.content_type == Some(DataVolumeContentType::Archive);
        if is_archive && spec.volume_mode.as_deref() == Some(VOLUME_MODE_BLOCK) {
            self.controller_client
                .publish_event(
                    data_volume_ref(dv),
                    EVENT_TYPE_WARNING,
                    REASON_ERR_CLAIM_NOT_VALID,
                    MESSAGE_ERR_ARCHIVE_BLOCK,
                )
                .await?;
            return Err(Error::ArchiveBlockVolumeMode);
        }

        if spec.access_modes.is_none() || spec.volume_mode.is_none() || is_archive {
            let sc_name = match spec.storage_class_name.clone() {
                Some(name) => name,
                None => self
                    .resolve_target_storage_class(dv)
                    .await?
                    .ok_or(Error::MissingStorageClass)?,
            };
            spec.storage_class_name = Some(sc_name.clone());
            let resolved = self.resolve_from_profile(dv, &sc_name, &spec, is_archive).await?;
            spec.access_modes = Some(resolved.0);
            spec.volume_mode = Some(resolved.1);
        }

        if is_archive && spec.volume_mode.as_deref() == Some(VOLUME_MODE_BLOCK) {
            self.controller_client
                .publish_event(
                    data_volume_ref(dv),
                    EVENT_TYPE_WARNING,
                    REASON_ERR_CLAIM_NOT_VALID,
                    MESSAGE_ERR_ARCHIVE_BLOCK,
                )
                .await?;
            return Err(Error::ArchiveBlockVolumeMode);
        }

        // a filesystem eats part of the volume; request enough to fit the
        // image after the overhead
        if spec.volume_mode.as_deref() != Some(VOLUME_MODE_BLOCK) {
            let overhead = self
                .filesystem_overhead(spec.storage_class_name.as_deref())
                .await?;
            if let Ok(size) = parse_quantity(&requested.0) {
                let required = common::utils::get_required_space(overhead, size);
                if required > size {
                    if let Some(resources) = spec.resources.as_mut() {
                        if let Some(requests) = resources.requests.as_mut() {
                            requests
                                .insert("storage".to_string(), quantity(&required.to_string()));
                        }
                    }
                }
            }
        }
        Ok(spec)
    }

    async fn resolve_from_profile(
        &self,
        dv: &DataVolume,
        sc_name: &str,
        spec: &PersistentVolumeClaimSpec,
        is_archive: bool,
    ) -> Result<(Vec<String>, String), Error> {
        let profile_api: Api<StorageProfile> = Api::all(self.k8s_client.clone());
        let profile = match profile_api.get(sc_name).await {
            Ok(profile) => profile,
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => {
                // no profile: whatever the user gave has to be enough
                return match (&spec.access_modes, &spec.volume_mode) {
                    (Some(modes), mode) if !modes.is_empty() => Ok((
                        modes.clone(),
                        mode.clone().unwrap_or_else(|| VOLUME_MODE_FILESYSTEM.to_string()),
                    )),
                    _ => Err(Error::IncompleteProfile { storage_class: sc_name.to_string() }),
                };
            }
            Err(err) => return Err(Error::KubeClient { source: err }),
        };
        let sets = profile.status.map(|s| s.claim_property_sets).unwrap_or_default();
        let wanted_access = spec.access_modes.as_ref().and_then(|m| m.first()).cloned();
        let wanted_mode = spec.volume_mode.clone();
        select_property_set(&sets, wanted_access, wanted_mode, is_archive)
            .ok_or(Error::IncompleteProfile { storage_class: sc_name.to_string() })
    }

    async fn filesystem_overhead(&self, sc_name: Option<&str>) -> Result<f64, Error> {
        let config_api: Api<CDIConfig> = Api::all(self.k8s_client.clone());
        let config = match config_api.get(CONFIG_NAME).await {
            Ok(config) => config,
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => {
                return Ok(0.0)
            }
            Err(err) => return Err(Error::KubeClient { source: err }),
        };
        let overhead = config
            .status
            .as_ref()
            .and_then(|s| s.filesystem_overhead.clone())
            .or(config.spec.filesystem_overhead);
        let overhead = match overhead {
            Some(overhead) => overhead,
            None => return Ok(0.0),
        };
        let percent = sc_name
            .and_then(|name| overhead.storage_class.get(name).cloned())
            .unwrap_or(overhead.global);
        Ok(percent.parse::<f64>().unwrap_or(0.0))
    }

    /// Annotations stamped on a created PVC: the user's own (outside the
    /// reserved namespace), the computed source tag and endpoint material,
    /// and the per-source worker pod request.
    fn build_pvc_annotations(
        &self,
        dv: &DataVolume,
        clone_source: Option<&DataVolumeSourcePvc>,
    ) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        for (key, value) in dv.annotations() {
            if key.starts_with(CDI_STORAGE_ANN_PREFIX) {
                continue;
            }
            annotations.insert(key.clone(), value.clone());
        }

        if let Some(source) = clone_source {
            annotations.insert(
                ANN_CLONE_REQUEST.to_string(),
                format!("{}/{}", source.namespace, source.name),
            );
        } else if let Some(source) = &dv.spec.source {
            if let Some(http) = &source.http {
                annotations.insert(ANN_SOURCE.to_string(), SOURCE_HTTP.to_string());
                annotations.insert(ANN_ENDPOINT.to_string(), http.url.clone());
                stamp_credentials(&mut annotations, &http.secret_ref, &http.cert_config_map);
            } else if let Some(s3) = &source.s3 {
                annotations.insert(ANN_SOURCE.to_string(), SOURCE_S3.to_string());
                annotations.insert(ANN_ENDPOINT.to_string(), s3.url.clone());
                stamp_credentials(&mut annotations, &s3.secret_ref, &s3.cert_config_map);
            } else if let Some(registry) = &source.registry {
                annotations.insert(ANN_SOURCE.to_string(), SOURCE_REGISTRY.to_string());
                annotations.insert(ANN_ENDPOINT.to_string(), registry.url.clone());
                stamp_credentials(&mut annotations, &registry.secret_ref, &registry.cert_config_map);
            } else if source.upload.is_some() {
                annotations.insert(ANN_UPLOAD_REQUEST.to_string(), String::new());
            } else if source.blank.is_some() {
                annotations.insert(ANN_SOURCE.to_string(), SOURCE_NONE.to_string());
                annotations.insert(ANN_CONTENT_TYPE.to_string(), CONTENT_TYPE_KUBEVIRT.to_string());
            } else if let Some(vddk) = &source.vddk {
                annotations.insert(ANN_SOURCE.to_string(), SOURCE_VDDK.to_string());
                annotations.insert(ANN_ENDPOINT.to_string(), vddk.url.clone());
                stamp_credentials(&mut annotations, &vddk.secret_ref, "");
                if !vddk.backing_file.is_empty() {
                    annotations.insert(ANN_BACKING_FILE.to_string(), vddk.backing_file.clone());
                }
                if !vddk.uuid.is_empty() {
                    annotations.insert(ANN_UUID.to_string(), vddk.uuid.clone());
                }
                if !vddk.thumbprint.is_empty() {
                    annotations.insert(ANN_THUMBPRINT.to_string(), vddk.thumbprint.clone());
                }
                if !vddk.init_image_url.is_empty() {
                    annotations
                        .insert(ANN_VDDK_INIT_IMAGE_URL.to_string(), vddk.init_image_url.clone());
                }
            } else if let Some(imageio) = &source.imageio {
                annotations.insert(ANN_SOURCE.to_string(), SOURCE_IMAGEIO.to_string());
                annotations.insert(ANN_ENDPOINT.to_string(), imageio.url.clone());
                stamp_credentials(&mut annotations, &imageio.secret_ref, &imageio.cert_config_map);
                if !imageio.disk_id.is_empty() {
                    annotations.insert(ANN_DISK_ID.to_string(), imageio.disk_id.clone());
                }
            }
        }

        if let Some(content_type) = dv.spec.content_type {
            let value = match content_type {
                DataVolumeContentType::KubeVirt => CONTENT_TYPE_KUBEVIRT,
                DataVolumeContentType::Archive => CONTENT_TYPE_ARCHIVE,
            };
            annotations.insert(ANN_CONTENT_TYPE.to_string(), value.to_string());
        }
        if let Some(preallocation) = dv.spec.preallocation {
            annotations
                .insert(ANN_PREALLOCATION_REQUESTED.to_string(), preallocation.to_string());
        }
        if !dv.spec.priority_class_name.is_empty() {
            annotations
                .insert(ANN_PRIORITY_CLASS_NAME.to_string(), dv.spec.priority_class_name.clone());
        }

        for (key, value) in checkpoint::initial_annotations(dv, &annotations) {
            annotations.insert(key, value);
        }
        annotations
    }

    /// Compute and record the DataVolume status: phase, conditions,
    /// restart count, progress. Only writes when something changed; every
    /// observable transition is mirrored as an event.
    async fn reconcile_status(
        &self,
        dv: &DataVolume,
        pvc: Option<&PersistentVolumeClaim>,
        state_override: StatusOverride,
    ) -> Result<(), Error> {
        let name = dv.name();
        let namespace = dv.namespace().unwrap_or_default();
        let mut status = dv.status.clone().unwrap_or_default();
        let old_status = status.clone();

        let annotations =
            pvc.and_then(|p| p.metadata.annotations.clone()).unwrap_or_default();
        let pod_phase = annotations.get(ANN_POD_PHASE).map(String::as_str);
        let request = request_kind(dv, &annotations);

        let phase = match state_override.phase {
            Some(phase) => phase,
            None => self.compute_phase(dv, pvc, &status, pod_phase, &annotations).await?,
        };
        status.phase = phase;

        if let Some(progress) = state_override.progress {
            status.progress = progress;
        } else if pod_phase == Some(POD_RUNNING)
            && matches!(
                phase,
                DataVolumePhase::ImportInProgress | DataVolumePhase::CloneInProgress
            )
        {
            if let Some(pvc) = pvc {
                let metric = match request {
                    RequestKind::Clone => CLONE_PROGRESS_METRIC,
                    _ => IMPORT_PROGRESS_METRIC,
                };
                if let Ok(worker) = pod::get_pod_from_pvc(&self.k8s_client, &namespace, pvc).await {
                    let uid = dv.meta().uid.clone().unwrap_or_default();
                    match pod::update_progress_using_pod(&mut status, &uid, &worker, metric).await {
                        Err(pod::pod_error::Error::MetricsPortNotFound) => {
                            return Err(Error::Operation {
                                value: "Metrics port not found in pod".to_string(),
                            })
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Some(restarts) = annotations.get(ANN_POD_RESTARTS) {
            if let Ok(count) = restarts.parse::<i32>() {
                status.restart_count = count;
            }
        }

        let bound_changed = update_bound_condition(&mut status.conditions, pvc, &name);
        update_ready_condition(&mut status.conditions, phase);
        update_running_condition(&mut status.conditions, &annotations);

        if status != old_status {
            self.controller_client.update_data_volume_status(&name, &namespace, &status).await?;
        }

        if bound_changed {
            if let Some((event_type, reason, message)) = bound_event(pvc, &name) {
                self.controller_client
                    .publish_event(data_volume_ref(dv), event_type, reason, &message)
                    .await?;
            }
        }
        if status.phase != old_status.phase {
            if let Some((event_type, reason, message)) =
                phase_event(dv, status.phase, request, &annotations)
            {
                self.controller_client
                    .publish_event(data_volume_ref(dv), event_type, reason, &message)
                    .await?;
            }
        }
        Ok(())
    }

    async fn compute_phase(
        &self,
        dv: &DataVolume,
        pvc: Option<&PersistentVolumeClaim>,
        status: &DataVolumeStatus,
        pod_phase: Option<&str>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<DataVolumePhase, Error> {
        let pvc = match pvc {
            Some(pvc) => pvc,
            None => return Ok(status.phase),
        };
        let claim = claim_phase(pvc);
        let phase = match claim {
            CLAIM_PENDING => {
                if pod_phase == Some(POD_SUCCEEDED) {
                    succeeded_or_paused(annotations)
                } else if self.should_wait_for_first_consumer(pvc).await? {
                    DataVolumePhase::WaitForFirstConsumer
                } else {
                    DataVolumePhase::Pending
                }
            }
            CLAIM_BOUND => {
                let request = request_kind(dv, annotations);
                match pod_phase {
                    Some(POD_PENDING) => match request {
                        RequestKind::Clone => DataVolumePhase::CloneScheduled,
                        RequestKind::Upload => DataVolumePhase::UploadScheduled,
                        RequestKind::Import => DataVolumePhase::ImportScheduled,
                    },
                    Some(POD_RUNNING) => match request {
                        RequestKind::Clone => DataVolumePhase::CloneInProgress,
                        RequestKind::Upload => {
                            if annotations.get(ANN_POD_READY).map(String::as_str) == Some("true") {
                                DataVolumePhase::UploadReady
                            } else {
                                DataVolumePhase::UploadScheduled
                            }
                        }
                        RequestKind::Import => DataVolumePhase::ImportInProgress,
                    },
                    Some(POD_SUCCEEDED) => succeeded_or_paused(annotations),
                    Some(POD_FAILED) => DataVolumePhase::Failed,
                    _ => match status.phase {
                        DataVolumePhase::PhaseUnset
                        | DataVolumePhase::Pending
                        | DataVolumePhase::WaitForFirstConsumer
                        | DataVolumePhase::Unknown => DataVolumePhase::PVCBound,
                        current => current,
                    },
                }
            }
            CLAIM_LOST => DataVolumePhase::Failed,
            _ => status.phase,
        };
        Ok(phase)
    }

    /// WaitForFirstConsumer applies when the feature gate is on, the
    /// resolved storage class binds on first consumer, and no immediate
    /// binding was requested.
    async fn should_wait_for_first_consumer(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<bool, Error> {
        if pvc_annotation(pvc, ANN_IMMEDIATE_BINDING).is_some() {
            return Ok(false);
        }
        let config_api: Api<CDIConfig> = Api::all(self.k8s_client.clone());
        let gated = match config_api.get(CONFIG_NAME).await {
            Ok(config) => {
                config.spec.feature_gates.iter().any(|g| g == HONOR_WAIT_FOR_FIRST_CONSUMER)
            }
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => false,
            Err(err) => return Err(Error::KubeClient { source: err }),
        };
        if !gated {
            return Ok(false);
        }
        let sc_name = pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone());
        let sc_api: Api<StorageClass> = Api::all(self.k8s_client.clone());
        let binding_mode = match sc_name {
            Some(name) => match sc_api.get(&name).await {
                Ok(sc) => sc.volume_binding_mode,
                Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => None,
                Err(err) => return Err(Error::KubeClient { source: err }),
            },
            None => {
                let classes = sc_api.list(&ListParams::default()).await?;
                classes
                    .items
                    .into_iter()
                    .find(|sc| {
                        sc.metadata
                            .annotations
                            .as_ref()
                            .and_then(|a| a.get(ANN_DEFAULT_STORAGE_CLASS))
                            .map(|v| v == "true")
                            .unwrap_or(false)
                    })
                    .and_then(|sc| sc.volume_binding_mode)
            }
        };
        Ok(binding_mode.as_deref() == Some("WaitForFirstConsumer"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Import,
    Upload,
    Clone,
}

fn request_kind(dv: &DataVolume, annotations: &BTreeMap<String, String>) -> RequestKind {
    if annotations.contains_key(ANN_CLONE_REQUEST)
        || annotations.contains_key(ANN_SMART_CLONE_REQUEST)
        || annotations.contains_key(ANN_CSI_CLONE_REQUEST)
        || dv.spec.source.as_ref().map(|s| s.pvc.is_some()).unwrap_or(false)
    {
        RequestKind::Clone
    } else if annotations.contains_key(ANN_UPLOAD_REQUEST)
        || dv.spec.source.as_ref().map(|s| s.upload.is_some()).unwrap_or(false)
    {
        RequestKind::Upload
    } else {
        RequestKind::Import
    }
}

fn succeeded_or_paused(annotations: &BTreeMap<String, String>) -> DataVolumePhase {
    if annotations.contains_key(ANN_CURRENT_CHECKPOINT) {
        DataVolumePhase::Paused
    } else {
        DataVolumePhase::Succeeded
    }
}

fn claim_phase(pvc: &PersistentVolumeClaim) -> &str {
    pvc.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or_default()
}

fn pvc_annotation<'a>(pvc: &'a PersistentVolumeClaim, key: &str) -> Option<&'a str> {
    pvc.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
}

fn is_pvc_owned_by(pvc: &PersistentVolumeClaim, dv: &DataVolume) -> bool {
    let dv_uid = dv.meta().uid.clone().unwrap_or_default();
    pvc.metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter().any(|r| {
                r.kind == DATA_VOLUME_KIND
                    && r.controller == Some(true)
                    && (r.uid == dv_uid || (dv_uid.is_empty() && r.name == dv.name()))
            })
        })
        .unwrap_or(false)
}

fn stamp_credentials(
    annotations: &mut BTreeMap<String, String>,
    secret_ref: &str,
    cert_config_map: &str,
) {
    if !secret_ref.is_empty() {
        annotations.insert(ANN_SECRET.to_string(), secret_ref.to_string());
    }
    if !cert_config_map.is_empty() {
        annotations.insert(ANN_CERT_CONFIG_MAP.to_string(), cert_config_map.to_string());
    }
}

fn requested_size(dv: &DataVolume) -> Result<String, Error> {
    let from_pvc = dv
        .spec
        .pvc
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.clone());
    let from_storage = dv
        .spec
        .storage
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.clone());
    from_pvc.or(from_storage).ok_or(Error::MissingStorageSize)
}

/// Pick the `{accessModes, volumeMode}` pair from the profile's ordered
/// property sets. Archive content always resolves to a filesystem set; a
/// DataVolume giving only one of the two is matched on the one it gave;
/// otherwise the first (most preferred) set wins.
fn select_property_set(
    sets: &[common::crd::ClaimPropertySet],
    wanted_access: Option<String>,
    wanted_mode: Option<String>,
    is_archive: bool,
) -> Option<(Vec<String>, String)> {
    let selected = sets.iter().find(|set| {
        if is_archive {
            return resolve_volume_mode(set.volume_mode.as_ref()) == VOLUME_MODE_FILESYSTEM;
        }
        if let Some(access) = &wanted_access {
            return set.access_modes.contains(access);
        }
        if let Some(mode) = &wanted_mode {
            return set.volume_mode.as_ref() == Some(mode);
        }
        true
    })?;
    if selected.access_modes.is_empty() {
        return None;
    }
    let volume_mode = wanted_mode
        .filter(|_| !is_archive)
        .unwrap_or_else(|| resolve_volume_mode(selected.volume_mode.as_ref()).to_string());
    let access_modes = match wanted_access {
        Some(access) if selected.access_modes.contains(&access) => vec![access],
        _ => vec![selected.access_modes[0].clone()],
    };
    Some((access_modes, volume_mode))
}

/// Drop patch entries that would not change the current annotations.
fn prune_annotation_patch(
    patch: BTreeMap<String, Option<String>>,
    current: &BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    patch
        .into_iter()
        .filter(|(key, value)| match value {
            Some(value) => current.get(key) != Some(value),
            None => current.contains_key(key),
        })
        .collect()
}

/// Mark the rendered target PVC as a smart clone restored from the named
/// snapshot.
fn smart_clone_pvc_from_snapshot(pvc: &mut PersistentVolumeClaim, snapshot_name: &str) {
    let annotations = pvc.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.remove(ANN_CLONE_REQUEST);
    annotations.insert(ANN_SMART_CLONE_REQUEST.to_string(), "true".to_string());
    if let Some(spec) = pvc.spec.as_mut() {
        spec.data_source = Some(k8s_openapi::api::core::v1::TypedLocalObjectReference {
            api_group: Some("snapshot.storage.k8s.io".to_string()),
            kind: "VolumeSnapshot".to_string(),
            name: snapshot_name.to_string(),
        });
    }
}

fn condition_status(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn update_condition(
    conditions: &mut Vec<DataVolumeCondition>,
    type_: DataVolumeConditionType,
    status: &str,
    reason: &str,
    message: &str,
) -> bool {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status == status && existing.reason == reason && existing.message == message {
            return false;
        }
        let status_changed = existing.status != status;
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        if status_changed {
            existing.last_transition_time = Some(Time(chrono::Utc::now()));
        }
        return true;
    }
    conditions.push(DataVolumeCondition {
        type_,
        status: status.to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        last_transition_time: Some(Time(chrono::Utc::now())),
    });
    true
}

fn update_bound_condition(
    conditions: &mut Vec<DataVolumeCondition>,
    pvc: Option<&PersistentVolumeClaim>,
    name: &str,
) -> bool {
    let (status, reason, message) = match pvc.map(claim_phase) {
        Some(CLAIM_BOUND) => ("True", REASON_BOUND, format!("PVC {} Bound", name)),
        Some(CLAIM_PENDING) => ("False", REASON_PENDING, format!("PVC {} Pending", name)),
        Some(CLAIM_LOST) => ("False", REASON_ERR_CLAIM_LOST, "Claim Lost".to_string()),
        _ => ("Unknown", REASON_NOT_FOUND, "No PVC found".to_string()),
    };
    update_condition(conditions, DataVolumeConditionType::Bound, status, reason, &message)
}

fn update_ready_condition(conditions: &mut Vec<DataVolumeCondition>, phase: DataVolumePhase) {
    let status = match phase {
        DataVolumePhase::Succeeded => "True",
        DataVolumePhase::Unknown => "Unknown",
        _ => "False",
    };
    update_condition(conditions, DataVolumeConditionType::Ready, status, "", "");
}

fn update_running_condition(
    conditions: &mut Vec<DataVolumeCondition>,
    annotations: &BTreeMap<String, String>,
) {
    let status = match annotations.get(ANN_RUNNING_CONDITION).map(String::as_str) {
        Some("true") => "True",
        _ => "False",
    };
    let reason = annotations.get(ANN_RUNNING_CONDITION_REASON).cloned().unwrap_or_default();
    let message = annotations.get(ANN_RUNNING_CONDITION_MESSAGE).cloned().unwrap_or_default();
    update_condition(conditions, DataVolumeConditionType::Running, status, &reason, &message);
}

fn bound_event(
    pvc: Option<&PersistentVolumeClaim>,
    name: &str,
) -> Option<(&'static str, &'static str, String)> {
    match pvc.map(claim_phase) {
        Some(CLAIM_BOUND) => {
            Some((EVENT_TYPE_NORMAL, REASON_BOUND, format!("PVC {} Bound", name)))
        }
        Some(CLAIM_PENDING) => {
            Some((EVENT_TYPE_NORMAL, REASON_PENDING, format!("PVC {} Pending", name)))
        }
        Some(CLAIM_LOST) => {
            Some((EVENT_TYPE_WARNING, REASON_ERR_CLAIM_LOST, format!("PVC {} lost", name)))
        }
        _ => None,
    }
}

fn clone_source_for_messages(
    dv: &DataVolume,
    annotations: &BTreeMap<String, String>,
) -> (String, String) {
    if let Some(source) = dv.spec.source.as_ref().and_then(|s| s.pvc.as_ref()) {
        let namespace = if source.namespace.is_empty() {
            dv.namespace().unwrap_or_default()
        } else {
            source.namespace.clone()
        };
        return (namespace, source.name.clone());
    }
    if let Some(request) = annotations.get(ANN_CLONE_REQUEST) {
        if let Some((namespace, name)) = request.split_once('/') {
            return (namespace.to_string(), name.to_string());
        }
    }
    (String::new(), String::new())
}

fn phase_event(
    dv: &DataVolume,
    phase: DataVolumePhase,
    request: RequestKind,
    annotations: &BTreeMap<String, String>,
) -> Option<(&'static str, &'static str, String)> {
    let name = dv.name();
    let namespace = dv.namespace().unwrap_or_default();
    let (source_ns, source_name) = clone_source_for_messages(dv, annotations);
    let event = match phase {
        DataVolumePhase::ImportScheduled => {
            (EVENT_TYPE_NORMAL, REASON_IMPORT_SCHEDULED, format!("Import into {} scheduled", name))
        }
        DataVolumePhase::ImportInProgress => (
            EVENT_TYPE_NORMAL,
            REASON_IMPORT_IN_PROGRESS,
            format!("Import into {} in progress", name),
        ),
        DataVolumePhase::CloneScheduled => (
            EVENT_TYPE_NORMAL,
            REASON_CLONE_SCHEDULED,
            format!(
                "Cloning from {}/{} into {}/{} scheduled",
                source_ns, source_name, namespace, name
            ),
        ),
        DataVolumePhase::CloneInProgress => (
            EVENT_TYPE_NORMAL,
            REASON_CLONE_IN_PROGRESS,
            format!(
                "Cloning from {}/{} into {}/{} in progress",
                source_ns, source_name, namespace, name
            ),
        ),
        DataVolumePhase::UploadScheduled => {
            (EVENT_TYPE_NORMAL, REASON_UPLOAD_SCHEDULED, format!("Upload into {} scheduled", name))
        }
        DataVolumePhase::UploadReady => {
            (EVENT_TYPE_NORMAL, REASON_UPLOAD_READY, format!("Upload into {} ready", name))
        }
        DataVolumePhase::Paused => (
            EVENT_TYPE_NORMAL,
            REASON_IMPORT_PAUSED,
            format!("Multistage import into PVC {} is paused", name),
        ),
        DataVolumePhase::SnapshotForSmartCloneInProgress => (
            EVENT_TYPE_NORMAL,
            REASON_SNAPSHOT_FOR_SMART_CLONE_IN_PROGRESS,
            format!("Creating snapshot for smart-clone is in progress (for pvc {}/{})", source_ns, source_name),
        ),
        DataVolumePhase::NamespaceTransferInProgress => (
            EVENT_TYPE_NORMAL,
            REASON_NAMESPACE_TRANSFER_IN_PROGRESS,
            format!("Transferring cloned PVC into {}/{}", namespace, name),
        ),
        DataVolumePhase::ExpansionInProgress => (
            EVENT_TYPE_NORMAL,
            REASON_EXPANSION_IN_PROGRESS,
            format!("Expanding PersistentVolumeClaim for DataVolume {}/{}", namespace, name),
        ),
        DataVolumePhase::CSICloneInProgress => (
            EVENT_TYPE_NORMAL,
            REASON_CSI_CLONE_IN_PROGRESS,
            format!("CSI Volume clone in progress (for pvc {}/{})", source_ns, source_name),
        ),
        DataVolumePhase::Succeeded => match request {
            RequestKind::Clone => (
                EVENT_TYPE_NORMAL,
                REASON_CLONE_SUCCEEDED,
                format!(
                    "Successfully cloned from {}/{} into {}/{}",
                    source_ns, source_name, namespace, name
                ),
            ),
            RequestKind::Upload => (
                EVENT_TYPE_NORMAL,
                REASON_UPLOAD_SUCCEEDED,
                format!("Successfully uploaded into {}", name),
            ),
            RequestKind::Import => (
                EVENT_TYPE_NORMAL,
                REASON_IMPORT_SUCCEEDED,
                format!("Successfully imported into PVC {}", name),
            ),
        },
        DataVolumePhase::Failed => match request {
            RequestKind::Clone => (
                EVENT_TYPE_WARNING,
                REASON_CLONE_FAILED,
                format!(
                    "Cloning from {}/{} into {}/{} failed",
                    source_ns, source_name, namespace, name
                ),
            ),
            RequestKind::Upload => {
                (EVENT_TYPE_WARNING, REASON_UPLOAD_FAILED, format!("Upload into {} failed", name))
            }
            RequestKind::Import => (
                EVENT_TYPE_WARNING,
                REASON_IMPORT_FAILED,
                format!("Failed to import into PVC {}", name),
            ),
        },
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
mod test {
    use kube::runtime::controller::Context;

    use common::apiclient::ControllerClient;

    use super::super::apiserver_mock::{
        checkpointed_dv, clone_dv, http_import_dv, test_pvc, timeout_after_5s, Testcases,
    };
    use super::reconciler_error::Error;
    use super::*;
    use common::values::*;

    #[tokio::test]
    async fn test_http_import_creates_pvc() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = http_import_dv("test-dv");
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::HttpImportCreatesPvc);
        reconcile(dv, context).await.expect("reconciler");
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_http_import_scheduled() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = http_import_dv("test-dv");
        let pvc = test_pvc(
            "test-dv",
            "Bound",
            &[(ANN_IMPORT_POD, "importer-test-dv"), (ANN_POD_PHASE, "Pending")],
            Some(&dv),
        );
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::HttpImportScheduled(pvc));
        reconcile(dv, context).await.expect("reconciler");
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_http_import_in_progress() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = http_import_dv("test-dv");
        let pvc = test_pvc(
            "test-dv",
            "Bound",
            &[(ANN_IMPORT_POD, "importer-test-dv"), (ANN_POD_PHASE, "Running")],
            Some(&dv),
        );
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::HttpImportInProgress(pvc));
        reconcile(dv, context).await.expect("reconciler");
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_http_import_succeeded() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = http_import_dv("test-dv");
        let pvc = test_pvc(
            "test-dv",
            "Bound",
            &[(ANN_IMPORT_POD, "importer-test-dv"), (ANN_POD_PHASE, "Succeeded")],
            Some(&dv),
        );
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::HttpImportSucceeded(pvc));
        reconcile(dv, context).await.expect("reconciler");
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_prepopulated_pvc_adopted_in_one_pass() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = http_import_dv("test-dv");
        let pvc = test_pvc("test-dv", "Bound", &[(ANN_POPULATED_FOR, "test-dv")], None);
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::PrePopulatedAdoption(pvc));
        reconcile(dv, context).await.expect("reconciler");
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_unmanaged_pvc_is_rejected() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = http_import_dv("test-dv");
        let pvc = test_pvc("test-dv", "Bound", &[], None);
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::OwnershipConflict(pvc));
        let err = reconcile(dv, context).await.expect_err("conflicting PVC is an error");
        assert_eq!(
            err.to_string(),
            "Resource \"test-dv\" already exists and is not managed by DataVolume"
        );
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_checkpoint_advances_one_step_and_pauses() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = checkpointed_dv("test-dv", false);
        let copied_first = format!("{}.first", ANN_CHECKPOINTS_COPIED);
        let copied_second = format!("{}.second", ANN_CHECKPOINTS_COPIED);
        let pvc = test_pvc(
            "test-dv",
            "Bound",
            &[
                (ANN_POD_PHASE, "Succeeded"),
                (ANN_PREVIOUS_CHECKPOINT, "second"),
                (ANN_CURRENT_CHECKPOINT, "previous"),
                (ANN_FINAL_CHECKPOINT, "false"),
                (ANN_CURRENT_POD_ID, "1234567"),
                (&copied_first, "12345"),
                (&copied_second, "123456"),
            ],
            Some(&dv),
        );
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::CheckpointAdvance(pvc));
        reconcile(dv, context).await.expect("reconciler");
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_checkpoint_records_are_not_rewritten() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = checkpointed_dv("test-dv", false);
        let copied: Vec<(String, &str)> = vec![
            (format!("{}.first", ANN_CHECKPOINTS_COPIED), "12345"),
            (format!("{}.second", ANN_CHECKPOINTS_COPIED), "123456"),
            (format!("{}.previous", ANN_CHECKPOINTS_COPIED), "1234567"),
            (format!("{}.current", ANN_CHECKPOINTS_COPIED), "12345678"),
        ];
        let mut annotations: Vec<(&str, &str)> = vec![
            (ANN_POD_PHASE, "Succeeded"),
            (ANN_PREVIOUS_CHECKPOINT, "previous"),
            (ANN_CURRENT_CHECKPOINT, "current"),
            (ANN_FINAL_CHECKPOINT, "false"),
            (ANN_CURRENT_POD_ID, "12345678"),
        ];
        for (key, value) in &copied {
            annotations.push((key.as_str(), value));
        }
        let pvc = test_pvc("test-dv", "Bound", &annotations, Some(&dv));
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::CheckpointPauseNoRewrite(pvc));
        reconcile(dv, context).await.expect("reconciler");
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_smart_clone_source_in_use_blocks_snapshot() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = clone_dv("test-dv");
        let source_pvc = test_pvc("test", "Bound", &[], None);
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::SmartCloneSourceInUse(source_pvc));
        let action = reconcile(dv, context).await.expect("reconciler");
        assert_eq!(action.requeue_after, REQUEUE_ERROR.requeue_after);
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_smart_clone_creates_snapshot() {
        let (controller, fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = clone_dv("test-dv");
        let source_pvc = test_pvc("test", "Bound", &[], None);
        let context = Context::new(controller);
        let mocksrv = fakeserver.run(Testcases::SmartCloneCreatesSnapshot(source_pvc));
        reconcile(dv, context).await.expect("reconciler");
        timeout_after_5s(mocksrv).await;
    }

    #[test]
    fn test_select_property_set() {
        use common::crd::ClaimPropertySet;
        let block = |access: &str| ClaimPropertySet {
            access_modes: vec![access.to_string()],
            volume_mode: Some("Block".to_string()),
        };
        let filesystem = |access: &str| ClaimPropertySet {
            access_modes: vec![access.to_string()],
            volume_mode: Some("Filesystem".to_string()),
        };
        let sets = vec![block("ReadOnlyMany"), filesystem("ReadWriteOnce")];

        // neither given: first (most preferred) set wins
        let (access, mode) = select_property_set(&sets, None, None, false).unwrap();
        assert_eq!(access, vec!["ReadOnlyMany".to_string()]);
        assert_eq!(mode, "Block");

        // only the volume mode given: match it
        let (access, mode) =
            select_property_set(&sets, None, Some("Filesystem".to_string()), false).unwrap();
        assert_eq!(access, vec!["ReadWriteOnce".to_string()]);
        assert_eq!(mode, "Filesystem");

        // only the access mode given: match it
        let (access, mode) =
            select_property_set(&sets, Some("ReadWriteOnce".to_string()), None, false).unwrap();
        assert_eq!(access, vec!["ReadWriteOnce".to_string()]);
        assert_eq!(mode, "Filesystem");

        // archive is always resolved to a filesystem set, regardless of
        // preference order
        let archive_sets =
            vec![block("ReadWriteMany"), block("ReadWriteOnce"), filesystem("ReadWriteOnce")];
        let (access, mode) = select_property_set(&archive_sets, None, None, true).unwrap();
        assert_eq!(access, vec!["ReadWriteOnce".to_string()]);
        assert_eq!(mode, "Filesystem");

        // archive with only block sets available cannot be satisfied
        assert!(select_property_set(&[block("ReadWriteOnce")], None, None, true).is_none());

        // empty profile is incomplete
        assert!(select_property_set(&[], None, None, false).is_none());

        // a set without access modes is incomplete
        let incomplete =
            vec![ClaimPropertySet { access_modes: vec![], volume_mode: Some("Block".to_string()) }];
        assert!(select_property_set(&incomplete, None, None, false).is_none());
    }

    #[test]
    fn test_prune_annotation_patch() {
        let mut current = BTreeMap::new();
        current.insert("same".to_string(), "value".to_string());
        current.insert("stale".to_string(), "old".to_string());
        let mut patch: BTreeMap<String, Option<String>> = BTreeMap::new();
        patch.insert("same".to_string(), Some("value".to_string()));
        patch.insert("stale".to_string(), Some("new".to_string()));
        patch.insert("absent-delete".to_string(), None);
        patch.insert("stale-delete".to_string(), None);
        current.insert("stale-delete".to_string(), "x".to_string());

        let pruned = prune_annotation_patch(patch, &current);
        assert!(!pruned.contains_key("same"));
        assert_eq!(pruned.get("stale").unwrap(), &Some("new".to_string()));
        assert!(!pruned.contains_key("absent-delete"));
        assert_eq!(pruned.get("stale-delete").unwrap(), &None);
    }

    #[test]
    fn test_requested_size_precedence() {
        let mut dv = http_import_dv("test-dv");
        assert_eq!(requested_size(&dv).unwrap(), "1G");
        dv.spec.pvc = None;
        assert!(matches!(requested_size(&dv), Err(Error::MissingStorageSize)));
    }

    #[test]
    fn test_is_pvc_owned_by() {
        let dv = http_import_dv("test-dv");
        assert!(is_pvc_owned_by(&test_pvc("test-dv", "Bound", &[], Some(&dv)), &dv));
        assert!(!is_pvc_owned_by(&test_pvc("test-dv", "Bound", &[], None), &dv));
    }

    #[tokio::test]
    async fn test_build_pvc_annotations_reserved_namespace() {
        let (controller, _fakeserver) = DataVolumeController::<ControllerClient>::test();
        let mut dv = http_import_dv("test-dv");
        let mut annotations = BTreeMap::new();
        annotations.insert("test-ann-1".to_string(), "test-value-1".to_string());
        annotations
            .insert(ANN_SOURCE.to_string(), "invalid phase should not copy".to_string());
        annotations.insert(ANN_POD_NETWORK.to_string(), "data-network".to_string());
        annotations.insert(ANN_POD_SIDECAR_INJECTION.to_string(), "false".to_string());
        dv.metadata.annotations = Some(annotations);

        let result = controller.build_pvc_annotations(&dv, None);
        assert_eq!(result.get("test-ann-1").map(String::as_str), Some("test-value-1"));
        // the reserved source annotation is recomputed, never copied
        assert_eq!(result.get(ANN_SOURCE).map(String::as_str), Some(SOURCE_HTTP));
        assert_eq!(result.get(ANN_ENDPOINT).map(String::as_str), Some("http://example.com/data"));
        assert_eq!(result.get(ANN_POD_NETWORK).map(String::as_str), Some("data-network"));
        assert_eq!(result.get(ANN_POD_SIDECAR_INJECTION).map(String::as_str), Some("false"));
        assert_eq!(result.get(ANN_PRIORITY_CLASS_NAME).map(String::as_str), Some("p0"));
    }

    #[tokio::test]
    async fn test_checkpoint_annotations_stamped_at_creation() {
        let (controller, _fakeserver) = DataVolumeController::<ControllerClient>::test();
        let dv = checkpointed_dv("test-dv", false);
        let result = controller.build_pvc_annotations(&dv, None);
        assert_eq!(result.get(ANN_PREVIOUS_CHECKPOINT).map(String::as_str), Some(""));
        assert_eq!(result.get(ANN_CURRENT_CHECKPOINT).map(String::as_str), Some("first"));
        assert_eq!(result.get(ANN_FINAL_CHECKPOINT).map(String::as_str), Some("false"));
    }
}

pub mod reconciler_error {
    use common::apiclient::apiclient_error;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Kubernetes reported error: {source}")]
        KubeClient {
            #[from]
            source: kube::Error,
        },

        #[error("Create/Patch reported error: {source}")]
        ApplyApi {
            #[from]
            source: apiclient_error::Error,
        },

        #[error("{resource}.metadata.{value} is not exist")]
        MissingObjectKey { resource: String, value: String },

        #[error("Resource \"{name}\" already exists and is not managed by DataVolume")]
        ResourceExists { name: String },

        #[error("missing storage class")]
        MissingStorageClass,

        #[error("missing storage size")]
        MissingStorageSize,

        #[error("DataVolume with ContentType Archive cannot have block volumeMode")]
        ArchiveBlockVolumeMode,

        #[error("no accessMode defined on DataVolume nor on StorageProfile for {storage_class}")]
        IncompleteProfile { storage_class: String },

        #[error("source PVC {namespace}/{name} not found")]
        CloneSourceMissing { namespace: String, name: String },

        #[error("invalid clone token: {reason}")]
        CloneToken { reason: String },

        #[error("operation {value} cannot be completed")]
        Operation { value: String },
    }
}
