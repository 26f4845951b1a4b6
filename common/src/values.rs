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

//! The curated registry of every annotation, label and constant the
//! controllers and the importer agree on. All reads and writes of PVC/DV
//! annotations go through these keys.

use kube::runtime::controller::ReconcilerAction;
use std::time::Duration;

pub const REQUEUE_NORMAL: ReconcilerAction =
    ReconcilerAction { requeue_after: Some(Duration::from_secs(15)) };

pub const REQUEUE_ERROR: ReconcilerAction =
    ReconcilerAction { requeue_after: Some(Duration::from_secs(1)) };

pub const NO_REQUEUE: ReconcilerAction = ReconcilerAction { requeue_after: None };

pub const CDI_ANN_PREFIX: &str = "cdi.kubevirt.io";
pub const CDI_STORAGE_ANN_PREFIX: &str = "cdi.kubevirt.io/storage";

pub const ANN_ENDPOINT: &str = "cdi.kubevirt.io/storage.import.endpoint";
pub const ANN_SOURCE: &str = "cdi.kubevirt.io/storage.import.source";
pub const ANN_SECRET: &str = "cdi.kubevirt.io/storage.import.secretName";
pub const ANN_CERT_CONFIG_MAP: &str = "cdi.kubevirt.io/storage.import.certConfigMap";
pub const ANN_REGISTRY_IMPORT_METHOD: &str = "cdi.kubevirt.io/storage.import.registryImportMethod";
pub const ANN_DISK_ID: &str = "cdi.kubevirt.io/storage.import.diskId";
pub const ANN_BACKING_FILE: &str = "cdi.kubevirt.io/storage.import.backingFile";
pub const ANN_UUID: &str = "cdi.kubevirt.io/storage.import.uuid";
pub const ANN_THUMBPRINT: &str = "cdi.kubevirt.io/storage.import.vddk.thumbprint";
pub const ANN_CONTENT_TYPE: &str = "cdi.kubevirt.io/storage.contentType";
pub const ANN_IMPORT_POD: &str = "cdi.kubevirt.io/storage.import.importPodName";
pub const ANN_UPLOAD_REQUEST: &str = "cdi.kubevirt.io/storage.upload.target";
pub const ANN_CLONE_REQUEST: &str = "k8s.io/CloneRequest";
pub const ANN_CLONE_OF: &str = "k8s.io/CloneOf";
pub const ANN_SMART_CLONE_REQUEST: &str = "k8s.io/SmartCloneRequest";
pub const ANN_CSI_CLONE_REQUEST: &str = "cdi.kubevirt.io/CSICloneRequest";
pub const ANN_CLONE_TOKEN: &str = "cdi.kubevirt.io/storage.clone.token";
pub const ANN_POD_PHASE: &str = "cdi.kubevirt.io/storage.pod.phase";
pub const ANN_POD_READY: &str = "cdi.kubevirt.io/storage.pod.ready";
pub const ANN_POD_RESTARTS: &str = "cdi.kubevirt.io/storage.pod.restarts";
pub const ANN_POPULATED_FOR: &str = "cdi.kubevirt.io/storage.populatedFor";
pub const ANN_PRE_POPULATED: &str = "cdi.kubevirt.io/storage.prePopulated";
pub const ANN_PREALLOCATION_REQUESTED: &str = "cdi.kubevirt.io/storage.preallocation.requested";
pub const ANN_PREALLOCATION_APPLIED: &str = "cdi.kubevirt.io/storage.preallocation";
pub const ANN_PRIORITY_CLASS_NAME: &str = "cdi.kubevirt.io/storage.pod.priorityclassname";
pub const ANN_PREVIOUS_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.previous";
pub const ANN_CURRENT_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.current";
pub const ANN_FINAL_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.final";
pub const ANN_CURRENT_POD_ID: &str = "cdi.kubevirt.io/storage.checkpoint.podid";
pub const ANN_CHECKPOINTS_COPIED: &str = "cdi.kubevirt.io/storage.checkpoint.copied";
pub const ANN_MULTI_STAGE_IMPORT_DONE: &str = "cdi.kubevirt.io/storage.checkpoint.done";
pub const ANN_DELETE_AFTER_COMPLETION: &str = "cdi.kubevirt.io/storage.deleteAfterCompletion";
pub const ANN_POD_RETAIN_AFTER_COMPLETION: &str = "cdi.kubevirt.io/storage.pod.retainAfterCompletion";
pub const ANN_VDDK_HOST_CONNECTION: &str = "cdi.kubevirt.io/storage.pod.vddk.host";
pub const ANN_VDDK_VERSION: &str = "cdi.kubevirt.io/storage.pod.vddk.version";
pub const ANN_VDDK_INIT_IMAGE_URL: &str = "cdi.kubevirt.io/storage.pod.vddk.initimageurl";
pub const ANN_IMMEDIATE_BINDING: &str = "cdi.kubevirt.io/storage.bind.immediate.requested";
pub const ANN_RUNNING_CONDITION: &str = "cdi.kubevirt.io/storage.condition.running";
pub const ANN_RUNNING_CONDITION_MESSAGE: &str = "cdi.kubevirt.io/storage.condition.running.message";
pub const ANN_RUNNING_CONDITION_REASON: &str = "cdi.kubevirt.io/storage.condition.running.reason";

// annotations owned by other components that the controller propagates
pub const ANN_POD_NETWORK: &str = "k8s.v1.cni.cncf.io/networks";
pub const ANN_POD_SIDECAR_INJECTION: &str = "sidecar.istio.io/inject";
pub const ANN_POD_SIDECAR_INJECTION_DEFAULT: &str = "false";
pub const ANN_DEFAULT_STORAGE_CLASS: &str = "storageclass.kubernetes.io/is-default-class";
pub const ANN_CLONE_STRATEGY: &str = "cdi.kubevirt.io/clone-strategy";

pub const SOURCE_HTTP: &str = "http";
pub const SOURCE_S3: &str = "s3";
pub const SOURCE_REGISTRY: &str = "registry";
pub const SOURCE_NONE: &str = "none";
pub const SOURCE_IMAGEIO: &str = "imageio";
pub const SOURCE_VDDK: &str = "vddk";

pub const CONTENT_TYPE_KUBEVIRT: &str = "kubevirt";
pub const CONTENT_TYPE_ARCHIVE: &str = "archive";

pub const CDI_LABEL_KEY: &str = "app";
pub const CDI_LABEL_VALUE: &str = "containerized-data-importer";
pub const CDI_COMPONENT_LABEL: &str = "cdi.kubevirt.io";
pub const APP_KUBERNETES_PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const APP_KUBERNETES_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const APP_KUBERNETES_COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const APP_KUBERNETES_VERSION_LABEL: &str = "app.kubernetes.io/version";
pub const PROMETHEUS_LABEL_KEY: &str = "prometheus.cdi.kubevirt.io";
pub const PROMETHEUS_LABEL_VALUE: &str = "true";
pub const CLONE_UNIQUE_ID_LABEL: &str = "cdi.kubevirt.io/cloneUniqueId";
pub const PV_FILLING_UP_SUPPRESS_LABEL_KEY: &str = "alerts.k8s.io/KubePersistentVolumeFillingUp";
pub const PV_FILLING_UP_SUPPRESS_LABEL_VALUE: &str = "disabled";

pub const CONFIG_NAME: &str = "config";
pub const CDI_CR_NAME: &str = "cdi";
pub const CLUSTER_WIDE_PROXY_NAME: &str = "cluster";
pub const DATA_VOLUME_FINALIZER: &str = "cdi.kubevirt.io/dataVolumeFinalizer";
pub const OBJECT_TRANSFER_PREFIX: &str = "cdi-tmp";

pub const DATA_VOLUME_API_VERSION: &str = "cdi.kubevirt.io/v1beta1";
pub const DATA_VOLUME_KIND: &str = "DataVolume";
pub const CDI_CONFIG_KIND: &str = "CDIConfig";
pub const STORAGE_PROFILE_KIND: &str = "StorageProfile";

// feature gates carried in CDIConfig.spec.featureGates
pub const HONOR_WAIT_FOR_FIRST_CONSUMER: &str = "HonorWaitForFirstConsumer";

// worker pod environment contract
pub const OWNER_UID: &str = "OWNER_UID";
pub const IMPORTER_ENDPOINT: &str = "IMPORTER_ENDPOINT";
pub const IMPORTER_SOURCE: &str = "IMPORTER_SOURCE";
pub const IMPORTER_CONTENT_TYPE: &str = "IMPORTER_CONTENT_TYPE";
pub const IMPORTER_IMAGE_SIZE: &str = "IMPORTER_IMAGE_SIZE";
pub const IMPORTER_ACCESS_KEY_ID: &str = "IMPORTER_ACCESS_KEY_ID";
pub const IMPORTER_SECRET_KEY: &str = "IMPORTER_SECRET_KEY";
pub const IMPORTER_CERT_DIR: &str = "IMPORTER_CERT_DIR";
pub const IMPORTER_PREALLOCATION: &str = "IMPORTER_PREALLOCATION";
pub const IMPORTER_PREVIOUS_CHECKPOINT: &str = "IMPORTER_PREVIOUS_CHECKPOINT";
pub const IMPORTER_CURRENT_CHECKPOINT: &str = "IMPORTER_CURRENT_CHECKPOINT";
pub const IMPORTER_FINAL_CHECKPOINT: &str = "IMPORTER_FINAL_CHECKPOINT";
pub const HTTP_PROXY: &str = "HTTP_PROXY";
pub const HTTPS_PROXY: &str = "HTTPS_PROXY";
pub const NO_PROXY: &str = "NO_PROXY";

pub const IMPORTER_POD_NAME_PREFIX: &str = "importer";
pub const UPLOAD_POD_NAME_PREFIX: &str = "cdi-upload";
pub const CLONE_SOURCE_POD_SUFFIX: &str = "-source-pod";
pub const IMPORTER_DATA_DIR: &str = "/data";
pub const IMPORTER_WRITE_BLOCK_PATH: &str = "/dev/cdi-block-volume";
pub const IMPORTER_CERT_MOUNT_PATH: &str = "/certs";
pub const IMPORTER_METRICS_PORT: i32 = 8443;
pub const IMPORTER_METRICS_PORT_NAME: &str = "metrics";
pub const POD_TERMINATION_MESSAGE_FILE: &str = "/dev/termination-log";
pub const PREALLOCATION_APPLIED_MESSAGE: &str = "Preallocation applied";

pub const IMPORT_PROGRESS_METRIC: &str = "import_progress";
pub const CLONE_PROGRESS_METRIC: &str = "clone_progress";

// event reasons
pub const REASON_ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
pub const REASON_ERR_CLAIM_NOT_VALID: &str = "ErrClaimNotValid";
pub const REASON_ERR_CLAIM_LOST: &str = "ErrClaimLost";
pub const REASON_IMPORT_SCHEDULED: &str = "ImportScheduled";
pub const REASON_IMPORT_IN_PROGRESS: &str = "ImportInProgress";
pub const REASON_IMPORT_FAILED: &str = "ImportFailed";
pub const REASON_IMPORT_SUCCEEDED: &str = "ImportSucceeded";
pub const REASON_IMPORT_PAUSED: &str = "ImportPaused";
pub const REASON_CLONE_SCHEDULED: &str = "CloneScheduled";
pub const REASON_CLONE_IN_PROGRESS: &str = "CloneInProgress";
pub const REASON_CLONE_FAILED: &str = "CloneFailed";
pub const REASON_CLONE_SUCCEEDED: &str = "CloneSucceeded";
pub const REASON_UPLOAD_SCHEDULED: &str = "UploadScheduled";
pub const REASON_UPLOAD_READY: &str = "UploadReady";
pub const REASON_UPLOAD_FAILED: &str = "UploadFailed";
pub const REASON_UPLOAD_SUCCEEDED: &str = "UploadSucceeded";
pub const REASON_BOUND: &str = "Bound";
pub const REASON_PENDING: &str = "Pending";
pub const REASON_NOT_FOUND: &str = "NotFound";
pub const REASON_SMART_CLONE_SOURCE_IN_USE: &str = "SmartCloneSourceInUse";
pub const REASON_SNAPSHOT_FOR_SMART_CLONE_IN_PROGRESS: &str = "SnapshotForSmartCloneInProgress";
pub const REASON_EXPANSION_IN_PROGRESS: &str = "ExpansionInProgress";
pub const REASON_NAMESPACE_TRANSFER_IN_PROGRESS: &str = "NamespaceTransferInProgress";
pub const REASON_CSI_CLONE_IN_PROGRESS: &str = "CSICloneInProgress";
pub const REASON_DELETE_AFTER_COMPLETION_CONFLICT: &str = "DeleteAfterCompletionConflict";

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

pub const MESSAGE_RESOURCE_EXISTS: &str = "Resource \"%s\" already exists and is not managed by DataVolume";
pub const MESSAGE_ERR_STORAGE_CLASS: &str = "missing storage class";
pub const MESSAGE_ERR_STORAGE_SIZE: &str = "missing storage size";
pub const MESSAGE_ERR_ARCHIVE_BLOCK: &str =
    "DataVolume with ContentType Archive cannot have block volumeMode";

pub const PROGRESS_NOT_AVAILABLE: &str = "N/A";
