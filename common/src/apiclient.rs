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

//! Write-side access to the API server. Every mutation the controllers
//! perform goes through the [`ApplyApi`] trait so reconcile logic can be
//! exercised against a mock transport.

use std::collections::BTreeMap;

use apiclient_error::Error;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, ObjectReference, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::{Deserialize, Serialize};

use crate::crd::{
    CdiConfigStatus, DataVolume, DataVolumeStatus, ObjectTransfer, StorageProfile, VolumeSnapshot,
};
use crate::values::{CDI_CONFIG_KIND, DATA_VOLUME_API_VERSION, DATA_VOLUME_KIND, STORAGE_PROFILE_KIND};

#[derive(Debug, Serialize, Deserialize)]
struct DataVolumeStatusPatch {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    status: DataVolumeStatus,
}

#[derive(Debug, Serialize, Deserialize)]
struct CdiConfigStatusPatch {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    status: CdiConfigStatus,
}

#[derive(Clone)]
pub struct ControllerClient {
    pub client: Client,
}

impl ControllerClient {
    pub fn new(client: Client) -> Self {
        ControllerClient { client }
    }
}

#[async_trait]
pub trait ApplyApi: Clone + Sized + Send + Sync {
    async fn update_data_volume_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DataVolumeStatus,
    ) -> Result<(), Error>;
    async fn merge_data_volume_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error>;
    async fn delete_data_volume(&self, name: &str, namespace: &str) -> Result<(), Error>;

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), Error>;
    async fn replace_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), Error>;
    /// Merge-patch PVC annotations; a `None` value deletes the key.
    async fn merge_pvc_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<(), Error>;
    async fn patch_pvc_requested_size(
        &self,
        name: &str,
        namespace: &str,
        size: &Quantity,
    ) -> Result<(), Error>;

    async fn create_pod(&self, pod: &Pod) -> Result<(), Error>;
    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error>;

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), Error>;
    async fn delete_volume_snapshot(&self, name: &str, namespace: &str) -> Result<(), Error>;

    async fn create_object_transfer(&self, transfer: &ObjectTransfer) -> Result<(), Error>;

    async fn create_storage_profile(&self, profile: &StorageProfile) -> Result<(), Error>;
    async fn replace_storage_profile(&self, profile: &StorageProfile) -> Result<(), Error>;
    async fn delete_storage_profile(&self, name: &str) -> Result<(), Error>;

    async fn update_cdi_config_status(
        &self,
        name: &str,
        status: &CdiConfigStatus,
    ) -> Result<(), Error>;

    async fn publish_event(
        &self,
        involved: ObjectReference,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<(), Error>;
}

#[async_trait]
impl ApplyApi for ControllerClient {
    async fn update_data_volume_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DataVolumeStatus,
    ) -> Result<(), Error> {
        let dv_api: Api<DataVolume> = Api::namespaced(self.client.clone(), namespace);
        let patch = DataVolumeStatusPatch {
            api_version: DATA_VOLUME_API_VERSION.to_string(),
            kind: DATA_VOLUME_KIND.to_string(),
            status: status.clone(),
        };
        dv_api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn merge_data_volume_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let dv_api: Api<DataVolume> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        dv_api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn delete_data_volume(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let dv_api: Api<DataVolume> = Api::namespaced(self.client.clone(), namespace);
        dv_api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), Error> {
        let namespace = pvc.metadata.namespace.as_deref().unwrap_or_default();
        let pvc_api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        pvc_api.create(&PostParams::default(), pvc).await?;
        Ok(())
    }

    async fn replace_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), Error> {
        let namespace = pvc.metadata.namespace.as_deref().unwrap_or_default();
        let name = pvc.metadata.name.as_deref().unwrap_or_default();
        let pvc_api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        pvc_api.replace(name, &PostParams::default(), pvc).await?;
        Ok(())
    }

    async fn merge_pvc_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<(), Error> {
        let pvc_api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        pvc_api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn patch_pvc_requested_size(
        &self,
        name: &str,
        namespace: &str,
        size: &Quantity,
    ) -> Result<(), Error> {
        let pvc_api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let patch =
            serde_json::json!({ "spec": { "resources": { "requests": { "storage": size } } } });
        pvc_api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), Error> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pod_api.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pod_api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), Error> {
        let namespace = snapshot.metadata.namespace.as_deref().unwrap_or_default();
        let snap_api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        snap_api.create(&PostParams::default(), snapshot).await?;
        Ok(())
    }

    async fn delete_volume_snapshot(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let snap_api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        snap_api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_object_transfer(&self, transfer: &ObjectTransfer) -> Result<(), Error> {
        let ot_api: Api<ObjectTransfer> = Api::all(self.client.clone());
        ot_api.create(&PostParams::default(), transfer).await?;
        Ok(())
    }

    async fn create_storage_profile(&self, profile: &StorageProfile) -> Result<(), Error> {
        let profile_api: Api<StorageProfile> = Api::all(self.client.clone());
        profile_api.create(&PostParams::default(), profile).await?;
        Ok(())
    }

    async fn replace_storage_profile(&self, profile: &StorageProfile) -> Result<(), Error> {
        let name = profile.metadata.name.as_deref().unwrap_or_default();
        let profile_api: Api<StorageProfile> = Api::all(self.client.clone());
        profile_api.replace(name, &PostParams::default(), profile).await?;
        Ok(())
    }

    async fn delete_storage_profile(&self, name: &str) -> Result<(), Error> {
        let profile_api: Api<StorageProfile> = Api::all(self.client.clone());
        profile_api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn update_cdi_config_status(
        &self,
        name: &str,
        status: &CdiConfigStatus,
    ) -> Result<(), Error> {
        let config_api: Api<crate::crd::CDIConfig> = Api::all(self.client.clone());
        let patch = CdiConfigStatusPatch {
            api_version: DATA_VOLUME_API_VERSION.to_string(),
            kind: CDI_CONFIG_KIND.to_string(),
            status: status.clone(),
        };
        config_api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn publish_event(
        &self,
        involved: ObjectReference,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<(), Error> {
        let namespace = involved.namespace.clone().unwrap_or_else(|| "default".to_string());
        let event_api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        let event = Event {
            metadata: ObjectMeta {
                generate_name: involved.name.clone().map(|n| format!("{}.", n)),
                namespace: Some(namespace),
                ..ObjectMeta::default()
            },
            involved_object: involved,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(event_type.to_string()),
            reporting_component: Some("cdi-controller".to_string()),
            ..Event::default()
        };
        event_api.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}

/// ObjectReference pointing at a DataVolume, used for event publishing.
pub fn data_volume_ref(dv: &DataVolume) -> ObjectReference {
    ObjectReference {
        api_version: Some(DATA_VOLUME_API_VERSION.to_string()),
        kind: Some(DATA_VOLUME_KIND.to_string()),
        name: dv.metadata.name.clone(),
        namespace: dv.metadata.namespace.clone(),
        uid: dv.metadata.uid.clone(),
        ..ObjectReference::default()
    }
}

/// ObjectReference pointing at a StorageProfile.
pub fn storage_profile_ref(profile: &StorageProfile) -> ObjectReference {
    ObjectReference {
        api_version: Some(DATA_VOLUME_API_VERSION.to_string()),
        kind: Some(STORAGE_PROFILE_KIND.to_string()),
        name: profile.metadata.name.clone(),
        namespace: Some("default".to_string()),
        ..ObjectReference::default()
    }
}

/// Controller owner reference from a DataVolume to its managed objects.
pub fn data_volume_owner_reference(
    dv: &DataVolume,
) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
        api_version: DATA_VOLUME_API_VERSION.to_string(),
        kind: DATA_VOLUME_KIND.to_string(),
        name: dv.meta().name.clone().unwrap_or_default(),
        uid: dv.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub mod apiclient_error {
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
