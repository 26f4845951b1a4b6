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

//! The PVC-side worker pod manager. A bound PVC carrying a population
//! request annotation gets exactly one worker pod; the pod's state is
//! mirrored back onto the PVC annotations which are the ground truth the
//! DataVolume state machine reads.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, SecretKeySelector, Volume, VolumeDevice,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, ObjectMeta};
use kube::core::ErrorResponse;
use kube::runtime::controller::{Context, ReconcilerAction};
use kube::{Client, ResourceExt};
use log::{debug, error, info};
use pod_error::Error;
use regex::Regex;

use common::apiclient::ApplyApi;
use common::crd::CDIConfig;
use common::utils::{
    get_requested_image_size, resolve_volume_mode, CLAIM_BOUND, POD_FAILED, POD_SUCCEEDED,
    VOLUME_MODE_BLOCK,
};
use common::values::{
    ANN_CERT_CONFIG_MAP, ANN_CLONE_REQUEST, ANN_CONTENT_TYPE, ANN_CURRENT_CHECKPOINT,
    ANN_CURRENT_POD_ID, ANN_ENDPOINT, ANN_FINAL_CHECKPOINT, ANN_IMPORT_POD, ANN_POD_PHASE,
    ANN_POD_READY, ANN_POD_RESTARTS, ANN_POD_RETAIN_AFTER_COMPLETION, ANN_PREALLOCATION_APPLIED,
    ANN_PREALLOCATION_REQUESTED, ANN_PREVIOUS_CHECKPOINT, ANN_PRIORITY_CLASS_NAME,
    ANN_RUNNING_CONDITION, ANN_RUNNING_CONDITION_MESSAGE, ANN_RUNNING_CONDITION_REASON, ANN_SECRET,
    ANN_SOURCE, ANN_UPLOAD_REQUEST, CDI_LABEL_KEY, CDI_LABEL_VALUE, CLONE_SOURCE_POD_SUFFIX,
    CLONE_UNIQUE_ID_LABEL, CONFIG_NAME, CONTENT_TYPE_KUBEVIRT, HTTPS_PROXY, HTTP_PROXY,
    IMPORTER_ACCESS_KEY_ID, IMPORTER_CERT_DIR, IMPORTER_CERT_MOUNT_PATH, IMPORTER_CONTENT_TYPE,
    IMPORTER_CURRENT_CHECKPOINT, IMPORTER_DATA_DIR, IMPORTER_ENDPOINT, IMPORTER_FINAL_CHECKPOINT,
    IMPORTER_IMAGE_SIZE, IMPORTER_METRICS_PORT, IMPORTER_METRICS_PORT_NAME,
    IMPORTER_POD_NAME_PREFIX, IMPORTER_PREALLOCATION, IMPORTER_PREVIOUS_CHECKPOINT,
    IMPORTER_SECRET_KEY, IMPORTER_SOURCE, IMPORTER_WRITE_BLOCK_PATH, NO_PROXY,
    PREALLOCATION_APPLIED_MESSAGE, PROMETHEUS_LABEL_KEY, PROMETHEUS_LABEL_VALUE, NO_REQUEUE,
    OWNER_UID, REQUEUE_ERROR, REQUEUE_NORMAL, UPLOAD_POD_NAME_PREFIX,
};

use super::config::{get_import_proxy_config, ImportProxyField};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodKind {
    Import,
    Upload,
    Clone,
}

/// Which kind of worker pod the PVC annotations request, if any.
pub fn requested_pod_kind(pvc: &PersistentVolumeClaim) -> Option<PodKind> {
    let annotations = pvc.metadata.annotations.as_ref()?;
    if annotations.contains_key(ANN_CLONE_REQUEST) {
        Some(PodKind::Clone)
    } else if annotations.contains_key(ANN_UPLOAD_REQUEST) {
        Some(PodKind::Upload)
    } else if annotations.contains_key(ANN_ENDPOINT) || annotations.contains_key(ANN_SOURCE) {
        Some(PodKind::Import)
    } else {
        None
    }
}

pub struct PvcPodController<T: ApplyApi> {
    k8s_client: Client,
    controller_client: T,
    importer_image: String,
    uploadserver_image: String,
}

impl<T: ApplyApi> PvcPodController<T> {
    pub fn new(
        k8s_client: Client,
        controller_client: T,
        importer_image: String,
        uploadserver_image: String,
    ) -> Self {
        PvcPodController { k8s_client, controller_client, importer_image, uploadserver_image }
    }

    pub async fn get_pod_from_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<Pod, Error> {
        get_pod_from_pvc(&self.k8s_client, namespace, pvc).await
    }

    async fn get_cdi_config(&self) -> Result<CDIConfig, Error> {
        let config_api: Api<CDIConfig> = Api::all(self.k8s_client.clone());
        Ok(config_api.get(CONFIG_NAME).await?)
    }

    async fn create_worker_pod(
        &self,
        pvc: &PersistentVolumeClaim,
        kind: PodKind,
    ) -> Result<(), Error> {
        let config = self.get_cdi_config().await?;
        let pod = match kind {
            PodKind::Import => make_importer_pod(pvc, &self.importer_image, &config),
            PodKind::Upload => make_upload_pod(pvc, &self.uploadserver_image),
            PodKind::Clone => {
                match make_clone_pod(pvc, &self.importer_image) {
                    Some(pod) => pod,
                    // cross-namespace host-assisted clones are handled by
                    // the smart clone path; nothing to start here
                    None => return Ok(()),
                }
            }
        };
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        info!("creating {:?} pod {} for PVC {}", kind, pod_name, pvc.name());
        self.controller_client.create_pod(&pod).await?;

        let mut annotations: BTreeMap<String, Option<String>> = BTreeMap::new();
        if kind == PodKind::Import {
            annotations.insert(ANN_IMPORT_POD.to_string(), Some(pod_name.clone()));
        }
        if pvc_annotation(pvc, ANN_CURRENT_CHECKPOINT).is_some() {
            annotations.insert(ANN_CURRENT_POD_ID.to_string(), Some(pod_name));
        }
        if !annotations.is_empty() {
            let namespace = pvc.namespace().unwrap_or_default();
            self.controller_client
                .merge_pvc_annotations(&pvc.name(), &namespace, &annotations)
                .await?;
        }
        Ok(())
    }

    async fn mirror_pod_state(
        &self,
        pvc: &PersistentVolumeClaim,
        pod: &Pod,
    ) -> Result<(), Error> {
        let desired = annotations_from_pod(pod);
        let current = pvc.metadata.annotations.clone().unwrap_or_default();
        let mut patch: BTreeMap<String, Option<String>> = BTreeMap::new();
        for (key, value) in desired {
            if current.get(&key) != Some(&value) {
                patch.insert(key, Some(value));
            }
        }
        if !patch.is_empty() {
            let namespace = pvc.namespace().unwrap_or_default();
            self.controller_client
                .merge_pvc_annotations(&pvc.name(), &namespace, &patch)
                .await?;
        }

        let retain = pvc_annotation(pvc, ANN_POD_RETAIN_AFTER_COMPLETION) == Some("true");
        if pod_phase(pod) == POD_SUCCEEDED && !retain {
            let namespace = pvc.namespace().unwrap_or_default();
            info!("deleting completed worker pod {}", pod.name());
            self.controller_client.delete_pod(&pod.name(), &namespace).await?;
        }
        Ok(())
    }
}

/// Find the worker pod of a PVC: owner-referenced by it, or labeled with
/// the PVC-UID-keyed clone id. Completed pods of a retained multi-stage
/// import are not considered current.
pub async fn get_pod_from_pvc(
    client: &Client,
    namespace: &str,
    pvc: &PersistentVolumeClaim,
) -> Result<Pod, Error> {
    let pod_api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default()
        .labels(&format!("{}={}", PROMETHEUS_LABEL_KEY, PROMETHEUS_LABEL_VALUE));
    let pods = pod_api.list(&lp).await?;
    let pvc_uid = pvc.metadata.uid.clone().unwrap_or_default();
    for pod in pods.items {
        if !pod_matches_pvc(&pod, &pvc_uid) {
            continue;
        }
        if ignore_completed_checkpoint_pod(pvc, &pod) {
            continue;
        }
        return Ok(pod);
    }
    Err(Error::PodNotFound { uid: pvc_uid, namespace: namespace.to_string() })
}

pub async fn reconcile<T: ApplyApi>(
    pvc: PersistentVolumeClaim,
    ctx: Context<PvcPodController<T>>,
) -> Result<ReconcilerAction, Error> {
    let controller = ctx.get_ref();
    let kind = match requested_pod_kind(&pvc) {
        Some(kind) => kind,
        None => return Ok(NO_REQUEUE),
    };
    let namespace = pvc.namespace().ok_or(Error::MissingObjectKey {
        resource: "pvc".to_string(),
        value: "namespace".to_string(),
    })?;
    let phase = pvc.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_default();
    if phase != CLAIM_BOUND {
        debug!("PVC {} not bound yet", pvc.name());
        return Ok(REQUEUE_NORMAL);
    }

    match controller.get_pod_from_pvc(&namespace, &pvc).await {
        Ok(pod) => {
            controller.mirror_pod_state(&pvc, &pod).await?;
        }
        Err(Error::PodNotFound { .. }) => {
            if should_create_pod(&pvc) {
                controller.create_worker_pod(&pvc, kind).await?;
            }
        }
        Err(err) => return Err(err),
    }
    Ok(REQUEUE_NORMAL)
}

pub fn error_policy<T: ApplyApi>(
    error: &Error,
    _ctx: Context<PvcPodController<T>>,
) -> ReconcilerAction {
    error!("worker pod reconciliation error: {}", error);
    REQUEUE_ERROR
}

/// A worker pod is started for a fresh request, and again for each
/// checkpoint of a multi-stage import that has no pod id recorded yet.
pub fn should_create_pod(pvc: &PersistentVolumeClaim) -> bool {
    match pvc_annotation(pvc, ANN_POD_PHASE) {
        None => true,
        Some(POD_SUCCEEDED) => {
            pvc_annotation(pvc, ANN_CURRENT_CHECKPOINT).is_some()
                && pvc_annotation(pvc, ANN_CURRENT_POD_ID).is_none()
        }
        Some(POD_FAILED) => false,
        Some(_) => false,
    }
}

fn pvc_annotation<'a>(pvc: &'a PersistentVolumeClaim, key: &str) -> Option<&'a str> {
    pvc.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or_default()
}

fn pod_matches_pvc(pod: &Pod, pvc_uid: &str) -> bool {
    let owned = pod
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == pvc_uid))
        .unwrap_or(false);
    if owned {
        return true;
    }
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(CLONE_UNIQUE_ID_LABEL))
        .map(|id| id == &format!("{}{}", pvc_uid, CLONE_SOURCE_POD_SUFFIX))
        .unwrap_or(false)
}

fn ignore_completed_checkpoint_pod(pvc: &PersistentVolumeClaim, pod: &Pod) -> bool {
    pod_phase(pod) == POD_SUCCEEDED
        && pvc_annotation(pvc, ANN_CURRENT_CHECKPOINT).is_some()
        && pvc_annotation(pvc, ANN_POD_RETAIN_AFTER_COMPLETION) == Some("true")
}

/// PVC annotations mirroring the observed pod state.
pub fn annotations_from_pod(pod: &Pod) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    let phase = pod_phase(pod);
    if !phase.is_empty() {
        annotations.insert(ANN_POD_PHASE.to_string(), phase.to_string());
    }

    let status = pod.status.as_ref();
    let container_status =
        status.and_then(|s| s.container_statuses.as_ref()).and_then(|cs| cs.first());
    let restarts = container_status.map(|cs| cs.restart_count).unwrap_or(0);
    annotations.insert(ANN_POD_RESTARTS.to_string(), restarts.to_string());

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);
    annotations.insert(ANN_POD_READY.to_string(), ready.to_string());

    if let Some(cs) = container_status {
        if let Some(state) = &cs.state {
            if state.running.is_some() {
                annotations.insert(ANN_RUNNING_CONDITION.to_string(), "true".to_string());
                annotations
                    .insert(ANN_RUNNING_CONDITION_REASON.to_string(), "Pod is running".to_string());
            } else if let Some(terminated) = &state.terminated {
                annotations.insert(ANN_RUNNING_CONDITION.to_string(), "false".to_string());
                let message = terminated.message.clone().unwrap_or_default();
                annotations.insert(ANN_RUNNING_CONDITION_MESSAGE.to_string(), message.clone());
                annotations.insert(
                    ANN_RUNNING_CONDITION_REASON.to_string(),
                    terminated.reason.clone().unwrap_or_default(),
                );
                if message.contains(PREALLOCATION_APPLIED_MESSAGE) {
                    annotations.insert(ANN_PREALLOCATION_APPLIED.to_string(), "true".to_string());
                }
            } else if let Some(waiting) = &state.waiting {
                annotations.insert(ANN_RUNNING_CONDITION.to_string(), "false".to_string());
                annotations.insert(
                    ANN_RUNNING_CONDITION_MESSAGE.to_string(),
                    waiting.message.clone().unwrap_or_default(),
                );
                annotations.insert(
                    ANN_RUNNING_CONDITION_REASON.to_string(),
                    waiting.reason.clone().unwrap_or_default(),
                );
            }
        }
    }
    annotations
}

fn pvc_owner_reference(pvc: &PersistentVolumeClaim) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "PersistentVolumeClaim".to_string(),
        name: pvc.metadata.name.clone().unwrap_or_default(),
        uid: pvc.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn worker_pod_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(CDI_LABEL_KEY.to_string(), CDI_LABEL_VALUE.to_string());
    labels.insert(PROMETHEUS_LABEL_KEY.to_string(), PROMETHEUS_LABEL_VALUE.to_string());
    labels
}

fn owner_uid(pvc: &PersistentVolumeClaim) -> String {
    pvc.metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
        .map(|r| r.uid.clone())
        .unwrap_or_default()
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.to_string()), value_from: None }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..EnvVarSource::default()
        }),
    }
}

/// Proxy settings flow from the resolved CDIConfig into every worker pod.
pub fn proxy_env_vars(config: &CDIConfig) -> Vec<EnvVar> {
    let mut vars = Vec::new();
    for (name, field) in [
        (HTTP_PROXY, ImportProxyField::Http),
        (HTTPS_PROXY, ImportProxyField::Https),
        (NO_PROXY, ImportProxyField::NoProxy),
    ] {
        if let Ok(value) = get_import_proxy_config(config, field) {
            if !value.is_empty() {
                vars.push(env(name, &value));
            }
        }
    }
    vars
}

/// The importer pod template for one PVC, honoring the source, content
/// type, checkpoint and credential annotations.
pub fn make_importer_pod(
    pvc: &PersistentVolumeClaim,
    image: &str,
    config: &CDIConfig,
) -> Pod {
    let pvc_name = pvc.metadata.name.clone().unwrap_or_default();
    let mut pod_name = format!("{}-{}", IMPORTER_POD_NAME_PREFIX, pvc_name);
    if let Some(checkpoint) = pvc_annotation(pvc, ANN_CURRENT_CHECKPOINT) {
        pod_name = format!("{}-checkpoint-{}", pod_name, checkpoint);
    }

    let mut env_vars = vec![
        env(OWNER_UID, &owner_uid(pvc)),
        env(IMPORTER_SOURCE, pvc_annotation(pvc, ANN_SOURCE).unwrap_or_default()),
        env(IMPORTER_ENDPOINT, pvc_annotation(pvc, ANN_ENDPOINT).unwrap_or_default()),
        env(
            IMPORTER_CONTENT_TYPE,
            pvc_annotation(pvc, ANN_CONTENT_TYPE).unwrap_or(CONTENT_TYPE_KUBEVIRT),
        ),
        env(IMPORTER_IMAGE_SIZE, &get_requested_image_size(pvc).unwrap_or_default()),
        env(
            IMPORTER_PREALLOCATION,
            pvc_annotation(pvc, ANN_PREALLOCATION_REQUESTED).unwrap_or("false"),
        ),
    ];
    if let Some(secret) = pvc_annotation(pvc, ANN_SECRET) {
        env_vars.push(secret_env(IMPORTER_ACCESS_KEY_ID, secret, "accessKeyId"));
        env_vars.push(secret_env(IMPORTER_SECRET_KEY, secret, "secretKey"));
    }
    for (name, ann) in [
        (IMPORTER_PREVIOUS_CHECKPOINT, ANN_PREVIOUS_CHECKPOINT),
        (IMPORTER_CURRENT_CHECKPOINT, ANN_CURRENT_CHECKPOINT),
        (IMPORTER_FINAL_CHECKPOINT, ANN_FINAL_CHECKPOINT),
    ] {
        if let Some(value) = pvc_annotation(pvc, ann) {
            env_vars.push(env(name, value));
        }
    }
    env_vars.extend(proxy_env_vars(config));

    let mut volumes = vec![Volume {
        name: "cdi-data-vol".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: pvc_name.clone(),
            read_only: None,
        }),
        ..Volume::default()
    }];
    let mut volume_mounts = Vec::new();
    let mut volume_devices = Vec::new();
    let volume_mode =
        resolve_volume_mode(pvc.spec.as_ref().and_then(|s| s.volume_mode.as_ref()));
    if volume_mode == VOLUME_MODE_BLOCK {
        volume_devices.push(VolumeDevice {
            name: "cdi-data-vol".to_string(),
            device_path: IMPORTER_WRITE_BLOCK_PATH.to_string(),
        });
    } else {
        volume_mounts.push(VolumeMount {
            name: "cdi-data-vol".to_string(),
            mount_path: IMPORTER_DATA_DIR.to_string(),
            ..VolumeMount::default()
        });
    }
    if let Some(cert_config_map) = pvc_annotation(pvc, ANN_CERT_CONFIG_MAP) {
        env_vars.push(env(IMPORTER_CERT_DIR, IMPORTER_CERT_MOUNT_PATH));
        volumes.push(Volume {
            name: "cdi-cert-vol".to_string(),
            config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                name: Some(cert_config_map.to_string()),
                ..Default::default()
            }),
            ..Volume::default()
        });
        volume_mounts.push(VolumeMount {
            name: "cdi-cert-vol".to_string(),
            mount_path: IMPORTER_CERT_MOUNT_PATH.to_string(),
            ..VolumeMount::default()
        });
    }

    let container = Container {
        name: "importer".to_string(),
        image: Some(image.to_string()),
        args: Some(vec!["-v=1".to_string()]),
        env: Some(env_vars),
        ports: Some(vec![ContainerPort {
            name: Some(IMPORTER_METRICS_PORT_NAME.to_string()),
            container_port: IMPORTER_METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        volume_mounts: if volume_mounts.is_empty() { None } else { Some(volume_mounts) },
        volume_devices: if volume_devices.is_empty() { None } else { Some(volume_devices) },
        ..Container::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: pvc.metadata.namespace.clone(),
            labels: Some(worker_pod_labels()),
            owner_references: Some(vec![pvc_owner_reference(pvc)]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("OnFailure".to_string()),
            priority_class_name: pvc_annotation(pvc, ANN_PRIORITY_CLASS_NAME)
                .map(|s| s.to_string()),
            volumes: Some(volumes),
            ..PodSpec::default()
        }),
        status: None,
    }
}

/// Host-assisted clone pod, mounting source and target volumes for the
/// byte copy. Only same-namespace clones can be host-assisted this way.
pub fn make_clone_pod(pvc: &PersistentVolumeClaim, image: &str) -> Option<Pod> {
    let clone_request = pvc_annotation(pvc, ANN_CLONE_REQUEST)?;
    let (source_namespace, source_name) = clone_request.split_once('/')?;
    let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
    if source_namespace != namespace {
        return None;
    }
    let pvc_name = pvc.metadata.name.clone().unwrap_or_default();
    let pvc_uid = pvc.metadata.uid.clone().unwrap_or_default();

    let mut labels = worker_pod_labels();
    labels
        .insert(CLONE_UNIQUE_ID_LABEL.to_string(), format!("{}{}", pvc_uid, CLONE_SOURCE_POD_SUFFIX));

    let container = Container {
        name: "cdi-clone".to_string(),
        image: Some(image.to_string()),
        args: Some(vec!["--clone".to_string()]),
        env: Some(vec![env(OWNER_UID, &owner_uid(pvc))]),
        ports: Some(vec![ContainerPort {
            name: Some(IMPORTER_METRICS_PORT_NAME.to_string()),
            container_port: IMPORTER_METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "cdi-clone-source".to_string(),
                mount_path: "/source".to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: "cdi-clone-target".to_string(),
                mount_path: "/target".to_string(),
                ..VolumeMount::default()
            },
        ]),
        ..Container::default()
    };

    Some(Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}{}", pvc_uid, CLONE_SOURCE_POD_SUFFIX)),
            namespace: pvc.metadata.namespace.clone(),
            labels: Some(labels),
            owner_references: Some(vec![pvc_owner_reference(pvc)]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("OnFailure".to_string()),
            priority_class_name: pvc_annotation(pvc, ANN_PRIORITY_CLASS_NAME)
                .map(|s| s.to_string()),
            volumes: Some(vec![
                Volume {
                    name: "cdi-clone-source".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: source_name.to_string(),
                        read_only: Some(true),
                    }),
                    ..Volume::default()
                },
                Volume {
                    name: "cdi-clone-target".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: pvc_name,
                        read_only: None,
                    }),
                    ..Volume::default()
                },
            ]),
            ..PodSpec::default()
        }),
        status: None,
    })
}

/// The upload server pod a client streams into.
pub fn make_upload_pod(pvc: &PersistentVolumeClaim, image: &str) -> Pod {
    let pvc_name = pvc.metadata.name.clone().unwrap_or_default();
    let container = Container {
        name: "uploadserver".to_string(),
        image: Some(image.to_string()),
        env: Some(vec![env(OWNER_UID, &owner_uid(pvc))]),
        ports: Some(vec![ContainerPort {
            name: Some(IMPORTER_METRICS_PORT_NAME.to_string()),
            container_port: IMPORTER_METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "cdi-data-vol".to_string(),
            mount_path: IMPORTER_DATA_DIR.to_string(),
            ..VolumeMount::default()
        }]),
        ..Container::default()
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", UPLOAD_POD_NAME_PREFIX, pvc_name)),
            namespace: pvc.metadata.namespace.clone(),
            labels: Some(worker_pod_labels()),
            owner_references: Some(vec![pvc_owner_reference(pvc)]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("OnFailure".to_string()),
            volumes: Some(vec![Volume {
                name: "cdi-data-vol".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name,
                    read_only: None,
                }),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        status: None,
    }
}

/// Extract the progress value for the owner from a metrics exposition.
pub fn extract_progress(body: &str, metric: &str, owner_uid: &str) -> Option<f64> {
    let pattern = format!(
        "(?m)^{}\\{{ownerUID=\"{}\"\\}} ([0-9.]+)$",
        regex::escape(metric),
        regex::escape(owner_uid)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(body).and_then(|caps| caps.get(1)).and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Scrape the worker pod metrics endpoint and record the owner's progress
/// on the DataVolume status. A missing metrics port is an error; an
/// unreachable endpoint or unmatched owner leaves the progress untouched.
pub async fn update_progress_using_pod(
    status: &mut common::crd::DataVolumeStatus,
    owner_uid: &str,
    pod: &Pod,
    metric: &str,
) -> Result<(), Error> {
    let port = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.container_port)
        .ok_or(Error::MetricsPortNotFound)?;
    let pod_ip = match pod.status.as_ref().and_then(|s| s.pod_ip.clone()) {
        Some(ip) if !ip.is_empty() => ip,
        _ => return Ok(()),
    };

    let url = format!("https://{}:{}/metrics", pod_ip, port);
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(std::time::Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(_) => return Ok(()),
    };
    let body = match client.get(&url).send().await {
        Ok(response) => response.text().await.unwrap_or_default(),
        // endpoint not up yet; keep whatever progress we had
        Err(_) => return Ok(()),
    };
    if let Some(value) = extract_progress(&body, metric, owner_uid) {
        status.progress = format!("{:.2}%", value);
    }
    Ok(())
}

pub mod pod_error {
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

        #[error("Unable to find pod owned by UID: {uid}, in namespace: {namespace}")]
        PodNotFound { uid: String, namespace: String },

        #[error("Metrics port not found in pod")]
        MetricsPortNotFound,
    }
}
