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

//! Mock API server driving whole DataVolume reconcile passes. Each test
//! case scripts the exact request sequence the reconciler performs and
//! asserts the request bodies on the way through.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::{Request, Response};
use hyper::{body::to_bytes, Body};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Volume,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::Client as KubeClient;
use serde_json::json;

use common::apiclient::ControllerClient;
use common::crd::{
    DataVolume, DataVolumeSource, DataVolumeSourceHttp, DataVolumeSourcePvc, DataVolumeSpec,
};
use common::values::*;

use self::mock_error::Error;
use super::datavolume::DataVolumeController;
use super::token::SignedToken;

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

pub enum Testcases {
    HttpImportCreatesPvc,
    HttpImportScheduled(PersistentVolumeClaim),
    HttpImportInProgress(PersistentVolumeClaim),
    HttpImportSucceeded(PersistentVolumeClaim),
    PrePopulatedAdoption(PersistentVolumeClaim),
    OwnershipConflict(PersistentVolumeClaim),
    CheckpointAdvance(PersistentVolumeClaim),
    CheckpointPauseNoRewrite(PersistentVolumeClaim),
    SmartCloneSourceInUse(PersistentVolumeClaim),
    SmartCloneCreatesSnapshot(PersistentVolumeClaim),
}

pub async fn timeout_after_5s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

impl ApiServerVerifier {
    pub fn run(self, cases: Testcases) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match cases {
                Testcases::HttpImportCreatesPvc => {
                    self.handle_pvc_get_not_found()
                        .await
                        .unwrap()
                        .handle_pvc_creation()
                        .await
                        .unwrap()
                        .handle_dv_status_patch("")
                        .await
                }
                Testcases::HttpImportScheduled(pvc) => {
                    self.handle_pvc_get(pvc)
                        .await
                        .unwrap()
                        .handle_dv_status_patch("ImportScheduled")
                        .await
                        .unwrap()
                        .handle_event("PVC test-dv Bound")
                        .await
                        .unwrap()
                        .handle_event("Import into test-dv scheduled")
                        .await
                }
                Testcases::HttpImportInProgress(pvc) => {
                    self.handle_pvc_get(pvc)
                        .await
                        .unwrap()
                        .handle_pod_list(Vec::new())
                        .await
                        .unwrap()
                        .handle_dv_status_patch("ImportInProgress")
                        .await
                        .unwrap()
                        .handle_event("PVC test-dv Bound")
                        .await
                        .unwrap()
                        .handle_event("Import into test-dv in progress")
                        .await
                }
                Testcases::HttpImportSucceeded(pvc) => {
                    self.handle_pvc_get(pvc)
                        .await
                        .unwrap()
                        .handle_dv_status_patch("Succeeded")
                        .await
                        .unwrap()
                        .handle_event("PVC test-dv Bound")
                        .await
                        .unwrap()
                        .handle_event("Successfully imported into PVC test-dv")
                        .await
                }
                Testcases::PrePopulatedAdoption(pvc) => {
                    self.handle_pvc_get(pvc)
                        .await
                        .unwrap()
                        .handle_pvc_replace_with_owner()
                        .await
                        .unwrap()
                        .handle_dv_annotation_patch(ANN_PRE_POPULATED, "test-dv")
                        .await
                        .unwrap()
                        .handle_dv_status_patch_with_progress("Succeeded", "N/A")
                        .await
                        .unwrap()
                        .handle_event("PVC test-dv Bound")
                        .await
                        .unwrap()
                        .handle_event("Successfully imported into PVC test-dv")
                        .await
                }
                Testcases::OwnershipConflict(pvc) => {
                    self.handle_pvc_get(pvc)
                        .await
                        .unwrap()
                        .handle_event(
                            "Resource \"test-dv\" already exists and is not managed by DataVolume",
                        )
                        .await
                }
                Testcases::CheckpointAdvance(pvc) => {
                    self.handle_pvc_get(pvc)
                        .await
                        .unwrap()
                        .handle_pvc_annotation_patch(|annotations| {
                            assert_eq!(
                                annotations.get(ANN_CURRENT_CHECKPOINT),
                                Some(&json!("current"))
                            );
                            assert_eq!(
                                annotations.get(ANN_PREVIOUS_CHECKPOINT),
                                Some(&json!("previous"))
                            );
                            assert_eq!(annotations.get(ANN_CURRENT_POD_ID), Some(&json!(null)));
                            assert_eq!(
                                annotations
                                    .get(&format!("{}.{}", ANN_CHECKPOINTS_COPIED, "previous")),
                                Some(&json!("1234567"))
                            );
                        })
                        .await
                        .unwrap()
                        .handle_dv_status_patch("Paused")
                        .await
                        .unwrap()
                        .handle_event("PVC test-dv Bound")
                        .await
                        .unwrap()
                        .handle_event("Multistage import into PVC test-dv is paused")
                        .await
                }
                Testcases::CheckpointPauseNoRewrite(pvc) => {
                    // everything already recorded: no PVC write may happen
                    self.handle_pvc_get(pvc)
                        .await
                        .unwrap()
                        .handle_dv_status_patch("Paused")
                        .await
                        .unwrap()
                        .handle_event("PVC test-dv Bound")
                        .await
                        .unwrap()
                        .handle_event("Multistage import into PVC test-dv is paused")
                        .await
                }
                Testcases::SmartCloneSourceInUse(pvc) => {
                    self.handle_pvc_get_not_found()
                        .await
                        .unwrap()
                        .handle_cdi_get()
                        .await
                        .unwrap()
                        .handle_storage_profile_get("testsc")
                        .await
                        .unwrap()
                        .handle_storage_class_get("testsc", "csi-plugin")
                        .await
                        .unwrap()
                        .handle_snapshot_class_list("csi-plugin")
                        .await
                        .unwrap()
                        .handle_source_pvc_get(pvc)
                        .await
                        .unwrap()
                        .handle_pod_list(vec![pod_using_pvc("test", "default")])
                        .await
                        .unwrap()
                        .handle_event("is using PersistentVolumeClaim default/test")
                        .await
                }
                Testcases::SmartCloneCreatesSnapshot(pvc) => {
                    self.handle_pvc_get_not_found()
                        .await
                        .unwrap()
                        .handle_cdi_get()
                        .await
                        .unwrap()
                        .handle_storage_profile_get("testsc")
                        .await
                        .unwrap()
                        .handle_storage_class_get("testsc", "csi-plugin")
                        .await
                        .unwrap()
                        .handle_snapshot_class_list("csi-plugin")
                        .await
                        .unwrap()
                        .handle_source_pvc_get(pvc)
                        .await
                        .unwrap()
                        .handle_pod_list(Vec::new())
                        .await
                        .unwrap()
                        .handle_snapshot_get_not_found()
                        .await
                        .unwrap()
                        .handle_snapshot_creation()
                        .await
                        .unwrap()
                        .handle_dv_status_patch("SnapshotForSmartCloneInProgress")
                        .await
                        .unwrap()
                        .handle_event("Creating snapshot for smart-clone is in progress")
                        .await
                }
            }
            .expect("case completed without errors");
        })
    }

    async fn next(&mut self) -> (Request<Body>, tower_test::mock::SendResponse<Response<Body>>) {
        self.0.next_request().await.expect("service not called")
    }

    async fn handle_pvc_get_not_found(mut self) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/default/persistentvolumeclaims/test-dv"
        );
        send.send_response(not_found("persistentvolumeclaims", "test-dv"));
        Ok(self)
    }

    async fn handle_pvc_get(mut self, pvc: PersistentVolumeClaim) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/default/persistentvolumeclaims/test-dv"
        );
        send.send_response(ok_json(&pvc));
        Ok(self)
    }

    async fn handle_source_pvc_get(mut self, pvc: PersistentVolumeClaim) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/default/persistentvolumeclaims/test"
        );
        send.send_response(ok_json(&pvc));
        Ok(self)
    }

    async fn handle_pvc_creation(mut self) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/default/persistentvolumeclaims");
        let body = to_bytes(request.into_body()).await.unwrap();
        let created: PersistentVolumeClaim =
            serde_json::from_slice(&body).expect("valid pvc from reconciler");
        let annotations = created.metadata.annotations.clone().unwrap_or_default();
        assert_eq!(annotations.get(ANN_SOURCE).map(String::as_str), Some(SOURCE_HTTP));
        assert_eq!(
            annotations.get(ANN_ENDPOINT).map(String::as_str),
            Some("http://example.com/data")
        );
        assert_eq!(annotations.get(ANN_PRIORITY_CLASS_NAME).map(String::as_str), Some("p0"));
        let labels = created.metadata.labels.clone().unwrap_or_default();
        assert_eq!(
            labels.get(PV_FILLING_UP_SUPPRESS_LABEL_KEY).map(String::as_str),
            Some(PV_FILLING_UP_SUPPRESS_LABEL_VALUE)
        );
        assert_eq!(labels.get(CDI_LABEL_KEY).map(String::as_str), Some(CDI_LABEL_VALUE));
        let owner = &created.metadata.owner_references.clone().unwrap()[0];
        assert_eq!(owner.kind, "DataVolume");
        assert_eq!(owner.name, "test-dv");
        send.send_response(ok_json(&created));
        Ok(self)
    }

    async fn handle_pvc_replace_with_owner(mut self) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/default/persistentvolumeclaims/test-dv"
        );
        let body = to_bytes(request.into_body()).await.unwrap();
        let replaced: PersistentVolumeClaim = serde_json::from_slice(&body).expect("valid pvc");
        let owners = replaced.metadata.owner_references.clone().unwrap_or_default();
        assert!(owners.iter().any(|o| o.kind == "DataVolume" && o.name == "test-dv"));
        send.send_response(ok_json(&replaced));
        Ok(self)
    }

    async fn handle_pvc_annotation_patch(
        mut self,
        verify: impl FnOnce(&serde_json::Map<String, serde_json::Value>),
    ) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/default/persistentvolumeclaims/test-dv"
        );
        let body = to_bytes(request.into_body()).await.unwrap();
        let patch: serde_json::Value = serde_json::from_slice(&body).expect("valid patch");
        let annotations = patch
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.as_object())
            .expect("annotation patch");
        verify(annotations);
        let response = json!({ "metadata": { "name": "test-dv", "namespace": "default" } });
        send.send_response(ok_json(&response));
        Ok(self)
    }

    async fn handle_dv_status_patch(self, expected_phase: &str) -> Result<Self, Error> {
        self.handle_dv_status_patch_with_progress(expected_phase, "").await
    }

    async fn handle_dv_status_patch_with_progress(
        mut self,
        expected_phase: &str,
        expected_progress: &str,
    ) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            "/apis/cdi.kubevirt.io/v1beta1/namespaces/default/datavolumes/test-dv/status"
        );
        let body = to_bytes(request.into_body()).await.unwrap();
        let patch: serde_json::Value = serde_json::from_slice(&body).expect("valid status patch");
        let status = patch.get("status").expect("status object");
        assert_eq!(
            status.get("phase").and_then(|p| p.as_str()).unwrap_or_default(),
            expected_phase
        );
        if !expected_progress.is_empty() {
            assert_eq!(
                status.get("progress").and_then(|p| p.as_str()).unwrap_or_default(),
                expected_progress
            );
        }
        let response = json!({
            "apiVersion": "cdi.kubevirt.io/v1beta1",
            "kind": "DataVolume",
            "metadata": { "name": "test-dv", "namespace": "default" },
            "spec": {},
            "status": status
        });
        send.send_response(ok_json(&response));
        Ok(self)
    }

    async fn handle_dv_annotation_patch(mut self, key: &str, value: &str) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            "/apis/cdi.kubevirt.io/v1beta1/namespaces/default/datavolumes/test-dv"
        );
        let body = to_bytes(request.into_body()).await.unwrap();
        let patch: serde_json::Value = serde_json::from_slice(&body).expect("valid patch");
        assert_eq!(
            patch.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)),
            Some(&json!(value))
        );
        let response = json!({
            "apiVersion": "cdi.kubevirt.io/v1beta1",
            "kind": "DataVolume",
            "metadata": { "name": "test-dv", "namespace": "default" },
            "spec": {}
        });
        send.send_response(ok_json(&response));
        Ok(self)
    }

    async fn handle_event(mut self, message_part: &str) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/default/events");
        let body = to_bytes(request.into_body()).await.unwrap();
        let event: serde_json::Value = serde_json::from_slice(&body).expect("valid event");
        let message = event.get("message").and_then(|m| m.as_str()).unwrap_or_default();
        assert!(
            message.contains(message_part),
            "event message {:?} does not contain {:?}",
            message,
            message_part
        );
        send.send_response(ok_json(&event));
        Ok(self)
    }

    async fn handle_pod_list(mut self, pods: Vec<Pod>) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/default/pods");
        let response = json!({ "metadata": {}, "items": pods });
        send.send_response(ok_json(&response));
        Ok(self)
    }

    async fn handle_cdi_get(mut self) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/apis/cdi.kubevirt.io/v1beta1/cdis/cdi");
        let response = json!({
            "apiVersion": "cdi.kubevirt.io/v1beta1",
            "kind": "CDI",
            "metadata": { "name": "cdi" },
            "spec": {}
        });
        send.send_response(ok_json(&response));
        Ok(self)
    }

    async fn handle_storage_profile_get(mut self, name: &str) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            format!("/apis/cdi.kubevirt.io/v1beta1/storageprofiles/{}", name)
        );
        let response = json!({
            "apiVersion": "cdi.kubevirt.io/v1beta1",
            "kind": "StorageProfile",
            "metadata": { "name": name },
            "spec": {},
            "status": {
                "storageClass": name,
                "provisioner": "csi-plugin",
                "claimPropertySets": [
                    { "accessModes": ["ReadOnlyMany"], "volumeMode": "Block" }
                ]
            }
        });
        send.send_response(ok_json(&response));
        Ok(self)
    }

    async fn handle_storage_class_get(
        mut self,
        name: &str,
        provisioner: &str,
    ) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), format!("/apis/storage.k8s.io/v1/storageclasses/{}", name));
        let sc = StorageClass {
            metadata: ObjectMeta { name: Some(name.to_string()), ..ObjectMeta::default() },
            provisioner: provisioner.to_string(),
            ..StorageClass::default()
        };
        send.send_response(ok_json(&sc));
        Ok(self)
    }

    async fn handle_snapshot_class_list(mut self, driver: &str) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/apis/snapshot.storage.k8s.io/v1/volumesnapshotclasses");
        let response = json!({
            "metadata": {},
            "items": [
                { "metadata": { "name": "snap-class" }, "driver": driver }
            ]
        });
        send.send_response(ok_json(&response));
        Ok(self)
    }

    async fn handle_snapshot_get_not_found(mut self) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/apis/snapshot.storage.k8s.io/v1/namespaces/default/volumesnapshots/test-dv"
        );
        send.send_response(not_found("volumesnapshots.snapshot.storage.k8s.io", "test-dv"));
        Ok(self)
    }

    async fn handle_snapshot_creation(mut self) -> Result<Self, Error> {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.uri().path(),
            "/apis/snapshot.storage.k8s.io/v1/namespaces/default/volumesnapshots"
        );
        let body = to_bytes(request.into_body()).await.unwrap();
        let snapshot: serde_json::Value = serde_json::from_slice(&body).expect("valid snapshot");
        assert_eq!(
            snapshot.get("metadata").and_then(|m| m.get("name")),
            Some(&json!("test-dv"))
        );
        assert_eq!(
            snapshot
                .get("metadata")
                .and_then(|m| m.get("labels"))
                .and_then(|l| l.get(APP_KUBERNETES_PART_OF_LABEL)),
            Some(&json!(CDI_LABEL_VALUE))
        );
        assert_eq!(
            snapshot
                .get("spec")
                .and_then(|s| s.get("source"))
                .and_then(|s| s.get("persistentVolumeClaimName")),
            Some(&json!("test"))
        );
        send.send_response(ok_json(&snapshot));
        Ok(self)
    }
}

fn ok_json<T: serde::Serialize>(value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap();
    Response::builder().body(Body::from(body)).unwrap()
}

fn not_found(resource: &str, name: &str) -> Response<Body> {
    let response = json!({
        "status": "Failure",
        "message": format!("{} \"{}\" not found", resource, name),
        "reason": "NotFound",
        "code": 404
    });
    Response::builder().status(404).body(Body::from(serde_json::to_vec(&response).unwrap())).unwrap()
}

impl<T: common::apiclient::ApplyApi> DataVolumeController<T> {
    pub fn test() -> (DataVolumeController<ControllerClient>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_k8s_client = KubeClient::new(mock_service, "default");
        let mock_api_client = ControllerClient::new(mock_k8s_client.clone());
        let mut installer_labels = BTreeMap::new();
        installer_labels.insert(APP_KUBERNETES_PART_OF_LABEL.to_string(), "testing".to_string());
        let controller = DataVolumeController::new(
            mock_k8s_client,
            mock_api_client,
            Arc::new(SignedToken::new(b"test-signing-key".to_vec())),
            installer_labels,
        );
        (controller, ApiServerVerifier(handle))
    }
}

// fixtures

pub fn http_import_dv(name: &str) -> DataVolume {
    let mut dv = DataVolume::new(
        name,
        DataVolumeSpec {
            source: Some(DataVolumeSource {
                http: Some(DataVolumeSourceHttp {
                    url: "http://example.com/data".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            pvc: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(ResourceRequirements {
                    requests: Some(storage_request("1G")),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            priority_class_name: "p0".to_string(),
            ..Default::default()
        },
    );
    dv.metadata.namespace = Some("default".to_string());
    dv.metadata.uid = Some(format!("default-{}", name));
    dv
}

pub fn clone_dv(name: &str) -> DataVolume {
    let sc_name = "testsc".to_string();
    let mut dv = DataVolume::new(
        name,
        DataVolumeSpec {
            source: Some(DataVolumeSource {
                pvc: Some(DataVolumeSourcePvc {
                    namespace: "default".to_string(),
                    name: "test".to_string(),
                }),
                ..Default::default()
            }),
            pvc: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some(sc_name),
                resources: Some(ResourceRequirements {
                    requests: Some(storage_request("1G")),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            priority_class_name: "p0-clone".to_string(),
            ..Default::default()
        },
    );
    dv.metadata.namespace = Some("default".to_string());
    dv.metadata.uid = Some("uid".to_string());
    dv
}

pub fn checkpointed_dv(name: &str, final_checkpoint: bool) -> DataVolume {
    let mut dv = http_import_dv(name);
    dv.spec.checkpoints = vec![
        common::crd::DataVolumeCheckpoint { previous: "".into(), current: "first".into() },
        common::crd::DataVolumeCheckpoint { previous: "first".into(), current: "second".into() },
        common::crd::DataVolumeCheckpoint { previous: "second".into(), current: "previous".into() },
        common::crd::DataVolumeCheckpoint { previous: "previous".into(), current: "current".into() },
    ];
    dv.spec.final_checkpoint = final_checkpoint;
    dv
}

pub fn storage_request(size: &str) -> std::collections::BTreeMap<String, Quantity> {
    let mut requests = std::collections::BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.to_string()));
    requests
}

pub fn test_pvc(
    name: &str,
    phase: &str,
    annotations: &[(&str, &str)],
    owned_by: Option<&DataVolume>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("default-{}", name)),
            annotations: Some(
                annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ),
            owner_references: owned_by.map(|dv| {
                vec![OwnerReference {
                    api_version: DATA_VOLUME_API_VERSION.to_string(),
                    kind: DATA_VOLUME_KIND.to_string(),
                    name: dv.metadata.name.clone().unwrap_or_default(),
                    uid: dv.metadata.uid.clone().unwrap_or_default(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]
            }),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some("testsc".to_string()),
            resources: Some(ResourceRequirements {
                requests: Some(storage_request("1G")),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some(phase.to_string()),
            capacity: Some(storage_request("1G")),
            ..Default::default()
        }),
    }
}

pub fn pod_using_pvc(claim_name: &str, namespace: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-pod", claim_name)),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: Vec::new(),
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.to_string(),
                    read_only: Some(false),
                }),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        status: None,
    }
}

pub mod mock_error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Kubernetes reported error: {source}")]
        KubeError {
            #[from]
            source: kube::Error,
        },
    }
}
