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

//! Default capabilities (access mode / volume mode pairs, in preference
//! order) for well known storage provisioners. Some provisioners are keyed
//! by storage class parameters, which is applied before the lookup.

use k8s_openapi::api::storage::v1::StorageClass;

use common::utils::{
    ACCESS_MODE_ROX, ACCESS_MODE_RWO, ACCESS_MODE_RWX, VOLUME_MODE_BLOCK, VOLUME_MODE_FILESYSTEM,
};

pub const NO_PROVISIONER: &str = "kubernetes.io/no-provisioner";
pub const LOCAL_STORAGE_OWNER_LABEL: &str = "local.storage.openshift.io/owner-name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageCapabilities {
    pub access_mode: &'static str,
    pub volume_mode: &'static str,
}

const RWO_FILE: StorageCapabilities =
    StorageCapabilities { access_mode: ACCESS_MODE_RWO, volume_mode: VOLUME_MODE_FILESYSTEM };
const RWO_BLOCK: StorageCapabilities =
    StorageCapabilities { access_mode: ACCESS_MODE_RWO, volume_mode: VOLUME_MODE_BLOCK };
const RWX_FILE: StorageCapabilities =
    StorageCapabilities { access_mode: ACCESS_MODE_RWX, volume_mode: VOLUME_MODE_FILESYSTEM };
const RWX_BLOCK: StorageCapabilities =
    StorageCapabilities { access_mode: ACCESS_MODE_RWX, volume_mode: VOLUME_MODE_BLOCK };

fn rbd_capabilities() -> Vec<StorageCapabilities> {
    vec![RWX_BLOCK, RWO_BLOCK, RWO_FILE]
}

/// Capabilities for a provisioner key, most preferred first.
pub fn capabilities_by_provisioner_key(key: &str) -> Option<Vec<StorageCapabilities>> {
    match key {
        // hostpath-provisioner
        "kubevirt.io.hostpath-provisioner" | "kubevirt.io/hostpath-provisioner" => {
            Some(vec![RWO_FILE])
        }
        // nfs-csi
        "nfs.csi.k8s.io" => Some(vec![RWX_FILE]),
        // ceph-rbd
        "kubernetes.io/rbd"
        | "rbd.csi.ceph.com"
        | "rook-ceph.rbd.csi.ceph.com"
        | "openshift-storage.rbd.csi.ceph.com" => Some(rbd_capabilities()),
        // ceph-fs
        "cephfs.csi.ceph.com" | "openshift-storage.cephfs.csi.ceph.com" => Some(vec![RWX_FILE]),
        // storageos
        "kubernetes.io/storageos" | "storageos" => Some(vec![RWO_FILE]),
        // AWS EBS
        "kubernetes.io/aws-ebs" | "ebs.csi.aws.com" => Some(vec![RWO_BLOCK]),
        // Azure disk
        "kubernetes.io/azure-disk" | "disk.csi.azure.com" => Some(vec![RWO_BLOCK]),
        // Azure file
        "kubernetes.io/azure-file" | "file.csi.azure.com" => Some(vec![RWX_FILE]),
        // GCE persistent disk
        "kubernetes.io/gce-pd" | "pd.csi.storage.gke.io" => Some(vec![RWO_BLOCK]),
        // portworx
        "kubernetes.io/portworx-volume/shared" | "pxd.openstorage.org/shared" => {
            Some(vec![RWX_FILE])
        }
        "kubernetes.io/portworx-volume" | "pxd.openstorage.org" => Some(vec![RWO_FILE]),
        // trident
        "csi.trident.netapp.io/ontap-nas" => Some(vec![RWX_FILE]),
        "csi.trident.netapp.io/ontap-san" => Some(vec![RWO_BLOCK]),
        _ => None,
    }
}

/// Provisioners whose capabilities depend on storage class parameters get a
/// derived key; everything else is keyed by the provisioner name itself.
pub fn storage_provisioner_key(sc: &StorageClass) -> String {
    let parameter = |name: &str| {
        sc.parameters.as_ref().and_then(|p| p.get(name)).map(String::as_str).unwrap_or_default()
    };
    match sc.provisioner.as_str() {
        "pxd.openstorage.org" => {
            if parameter("shared") == "true" {
                "pxd.openstorage.org/shared".to_string()
            } else {
                "pxd.openstorage.org".to_string()
            }
        }
        "kubernetes.io/portworx-volume" => {
            if parameter("shared") == "true" {
                "kubernetes.io/portworx-volume/shared".to_string()
            } else {
                "kubernetes.io/portworx-volume".to_string()
            }
        }
        "csi.trident.netapp.io" => match parameter("backendType") {
            "ontap-nas" => "csi.trident.netapp.io/ontap-nas".to_string(),
            "ontap-san" => "csi.trident.netapp.io/ontap-san".to_string(),
            _ => "UNKNOWN".to_string(),
        },
        other => other.to_string(),
    }
}

pub fn is_local_storage_operator(sc: &StorageClass) -> bool {
    sc.metadata
        .labels
        .as_ref()
        .map(|labels| labels.contains_key(LOCAL_STORAGE_OWNER_LABEL))
        .unwrap_or(false)
}
