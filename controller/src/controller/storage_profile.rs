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

//! One StorageProfile per StorageClass, automatically reconciled. The
//! profile's computed claim property sets and clone strategy are what the
//! DataVolume reconciler consults when the user leaves storage details
//! open.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, ObjectMeta};
use kube::core::ErrorResponse;
use kube::runtime::controller::{Context, ReconcilerAction};
use kube::{Client, ResourceExt};
use log::{debug, error, info};
use profile_error::Error;

use common::apiclient::ApplyApi;
use common::crd::{
    CdiCloneStrategy, ClaimPropertySet, StorageProfile, StorageProfileSpec, StorageProfileStatus,
};
use common::utils::{resolve_volume_mode, set_recommended_labels};
use common::values::{
    ANN_CLONE_STRATEGY, CDI_COMPONENT_LABEL, CDI_LABEL_KEY, CDI_LABEL_VALUE, REQUEUE_ERROR,
    REQUEUE_NORMAL,
};

use super::capabilities;

/// Number of profiles whose property sets lack an access mode or a volume
/// mode. Process-wide; exported by the metrics endpoint.
pub static INCOMPLETE_PROFILE_GAUGE: AtomicI64 = AtomicI64::new(0);

pub struct StorageProfileController<T: ApplyApi> {
    k8s_client: Client,
    controller_client: T,
    installer_labels: BTreeMap<String, String>,
}

impl<T: ApplyApi> StorageProfileController<T> {
    pub fn new(
        k8s_client: Client,
        controller_client: T,
        installer_labels: BTreeMap<String, String>,
    ) -> Self {
        StorageProfileController { k8s_client, controller_client, installer_labels }
    }

    async fn get_storage_profile(&self, name: &str) -> Result<Option<StorageProfile>, Error> {
        let profile_api: Api<StorageProfile> = Api::all(self.k8s_client.clone());
        match profile_api.get(name).await {
            Ok(profile) => Ok(Some(profile)),
            Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => Ok(None),
            Err(err) => Err(Error::KubeClient { source: err }),
        }
    }

    /// Capabilities for a no-provisioner class are derived from its bound
    /// PVs; only classes owned by the local-storage operator are trusted.
    async fn capabilities_for_no_provisioner(
        &self,
        sc: &StorageClass,
    ) -> Result<Vec<ClaimPropertySet>, Error> {
        if !capabilities::is_local_storage_operator(sc) {
            return Ok(Vec::new());
        }
        let pv_api: Api<PersistentVolume> = Api::all(self.k8s_client.clone());
        let pvs = pv_api.list(&ListParams::default()).await?;
        Ok(property_sets_from_pvs(&sc.name(), &pvs.items))
    }

    async fn reconcile_property_sets(
        &self,
        sc: &StorageClass,
    ) -> Result<Vec<ClaimPropertySet>, Error> {
        if sc.provisioner == capabilities::NO_PROVISIONER {
            return self.capabilities_for_no_provisioner(sc).await;
        }
        let key = capabilities::storage_provisioner_key(sc);
        let sets = capabilities::capabilities_by_provisioner_key(&key)
            .unwrap_or_default()
            .into_iter()
            .map(|cap| ClaimPropertySet {
                access_modes: vec![cap.access_mode.to_string()],
                volume_mode: Some(cap.volume_mode.to_string()),
            })
            .collect();
        Ok(sets)
    }

    async fn reconcile_storage_profile(&self, sc: &StorageClass) -> Result<(), Error> {
        let name = sc.name();
        let previous = self.get_storage_profile(&name).await?;
        let mut profile = previous.clone().unwrap_or_else(|| empty_storage_profile(&name));

        let mut labels = profile.metadata.labels.clone().unwrap_or_default();
        set_recommended_labels(&mut labels, &self.installer_labels, "cdi-controller");
        profile.metadata.labels = Some(labels);

        let claim_property_sets = if !profile.spec.claim_property_sets.is_empty() {
            for set in &profile.spec.claim_property_sets {
                if set.access_modes.is_empty() {
                    if let Some(mode) = &set.volume_mode {
                        return Err(Error::InvalidPropertySet { volume_mode: mode.clone() });
                    }
                }
            }
            profile.spec.claim_property_sets.clone()
        } else {
            self.reconcile_property_sets(sc).await?
        };

        profile.status = Some(StorageProfileStatus {
            storage_class: Some(name.clone()),
            provisioner: Some(sc.provisioner.clone()),
            clone_strategy: reconcile_clone_strategy(sc, profile.spec.clone_strategy),
            claim_property_sets,
        });

        match previous {
            None => {
                info!("creating StorageProfile for StorageClass {}", name);
                self.controller_client.create_storage_profile(&profile).await?;
            }
            Some(prev) => {
                if serde_json::to_value(&prev).ok() != serde_json::to_value(&profile).ok() {
                    info!("updating StorageProfile {}", name);
                    self.controller_client.replace_storage_profile(&profile).await?;
                }
            }
        }
        Ok(())
    }

    /// Walk every profile: delete the ones whose StorageClass is gone and
    /// refresh the incomplete-profile gauge.
    async fn sweep_profiles(&self) -> Result<(), Error> {
        let profile_api: Api<StorageProfile> = Api::all(self.k8s_client.clone());
        let sc_api: Api<StorageClass> = Api::all(self.k8s_client.clone());
        let profiles = profile_api.list(&ListParams::default()).await?;
        let classes = sc_api.list(&ListParams::default()).await?;
        let class_names: HashSet<String> = classes.items.iter().map(|sc| sc.name()).collect();

        let mut incomplete = 0;
        for profile in profiles.items {
            let name = profile.name();
            if !class_names.contains(&name) {
                info!("cleaning up StorageProfile for deleted StorageClass {}", name);
                self.controller_client.delete_storage_profile(&name).await?;
                continue;
            }
            let sets =
                profile.status.as_ref().map(|s| s.claim_property_sets.clone()).unwrap_or_default();
            if is_incomplete(&sets) {
                incomplete += 1;
            }
        }
        INCOMPLETE_PROFILE_GAUGE.store(incomplete, Ordering::Relaxed);
        Ok(())
    }
}

/// Profile spec strategy wins; the storage class may force one through its
/// clone-strategy annotation.
pub fn reconcile_clone_strategy(
    sc: &StorageClass,
    spec_strategy: Option<CdiCloneStrategy>,
) -> Option<CdiCloneStrategy> {
    if spec_strategy.is_some() {
        return spec_strategy;
    }
    let annotation = sc.metadata.annotations.as_ref().and_then(|a| a.get(ANN_CLONE_STRATEGY));
    match annotation.map(String::as_str) {
        Some("copy") => Some(CdiCloneStrategy::HostAssisted),
        Some("snapshot") => Some(CdiCloneStrategy::Snapshot),
        Some("csi-clone") => Some(CdiCloneStrategy::CsiClone),
        _ => None,
    }
}

pub fn is_incomplete(sets: &[ClaimPropertySet]) -> bool {
    if sets.is_empty() {
        return true;
    }
    sets.iter().any(|set| set.access_modes.is_empty() || set.volume_mode.is_none())
}

/// Deduplicated property sets observed on bound PVs of the class.
pub fn property_sets_from_pvs(sc_name: &str, pvs: &[PersistentVolume]) -> Vec<ClaimPropertySet> {
    let mut seen = HashSet::new();
    let mut sets = Vec::new();
    for pv in pvs {
        let spec = match &pv.spec {
            Some(spec) => spec,
            None => continue,
        };
        if spec.storage_class_name.as_deref() != Some(sc_name) {
            continue;
        }
        let volume_mode = resolve_volume_mode(spec.volume_mode.as_ref()).to_string();
        for access_mode in spec.access_modes.clone().unwrap_or_default() {
            if seen.insert((access_mode.clone(), volume_mode.clone())) {
                sets.push(ClaimPropertySet {
                    access_modes: vec![access_mode],
                    volume_mode: Some(volume_mode.clone()),
                });
            }
        }
    }
    sets
}

pub fn empty_storage_profile(name: &str) -> StorageProfile {
    let mut labels = BTreeMap::new();
    labels.insert(CDI_LABEL_KEY.to_string(), CDI_LABEL_VALUE.to_string());
    labels.insert(CDI_COMPONENT_LABEL.to_string(), String::new());
    StorageProfile {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: StorageProfileSpec::default(),
        status: None,
    }
}

pub async fn reconcile<T: ApplyApi>(
    sc: StorageClass,
    ctx: Context<StorageProfileController<T>>,
) -> Result<ReconcilerAction, Error> {
    debug!("start reconcile StorageProfile for {}", sc.name());
    let controller = ctx.get_ref();
    controller.reconcile_storage_profile(&sc).await?;
    controller.sweep_profiles().await?;
    Ok(REQUEUE_NORMAL)
}

pub fn error_policy<T: ApplyApi>(
    error: &Error,
    _ctx: Context<StorageProfileController<T>>,
) -> ReconcilerAction {
    error!("StorageProfile reconciliation error: {}", error);
    REQUEUE_ERROR
}

pub mod profile_error {
    use common::apiclient::apiclient_error;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Kubernetes reported error: {source}")]
        KubeClient {
            #[from]
            source: kube::Error,
        },

        #[error("Create/Patch StorageProfile reported error: {source}")]
        ApplyApi {
            #[from]
            source: apiclient_error::Error,
        },

        #[error("must provide access mode for volume mode: {volume_mode}")]
        InvalidPropertySet { volume_mode: String },
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PersistentVolumeSpec;

    use super::*;

    fn storage_class(name: &str, provisioner: &str, annotations: &[(&str, &str)]) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: if annotations.is_empty() {
                    None
                } else {
                    Some(
                        annotations
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    )
                },
                ..ObjectMeta::default()
            },
            provisioner: provisioner.to_string(),
            ..StorageClass::default()
        }
    }

    fn pv(sc_name: &str, access_modes: &[&str], volume_mode: Option<&str>) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta::default(),
            spec: Some(PersistentVolumeSpec {
                storage_class_name: Some(sc_name.to_string()),
                access_modes: Some(access_modes.iter().map(|m| m.to_string()).collect()),
                volume_mode: volume_mode.map(|m| m.to_string()),
                ..PersistentVolumeSpec::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_clone_strategy_resolution() {
        let sc = storage_class("plain", "csi-plugin", &[]);
        assert_eq!(reconcile_clone_strategy(&sc, None), None);
        assert_eq!(
            reconcile_clone_strategy(&sc, Some(CdiCloneStrategy::CsiClone)),
            Some(CdiCloneStrategy::CsiClone)
        );

        let annotated = storage_class("annotated", "csi-plugin", &[(ANN_CLONE_STRATEGY, "copy")]);
        assert_eq!(reconcile_clone_strategy(&annotated, None), Some(CdiCloneStrategy::HostAssisted));
        let annotated = storage_class("annotated", "csi-plugin", &[(ANN_CLONE_STRATEGY, "snapshot")]);
        assert_eq!(reconcile_clone_strategy(&annotated, None), Some(CdiCloneStrategy::Snapshot));
        let annotated =
            storage_class("annotated", "csi-plugin", &[(ANN_CLONE_STRATEGY, "csi-clone")]);
        assert_eq!(reconcile_clone_strategy(&annotated, None), Some(CdiCloneStrategy::CsiClone));
        // the spec-level strategy wins over the annotation
        let annotated = storage_class("annotated", "csi-plugin", &[(ANN_CLONE_STRATEGY, "copy")]);
        assert_eq!(
            reconcile_clone_strategy(&annotated, Some(CdiCloneStrategy::Snapshot)),
            Some(CdiCloneStrategy::Snapshot)
        );
    }

    #[test]
    fn test_is_incomplete() {
        assert!(is_incomplete(&[]));
        assert!(is_incomplete(&[ClaimPropertySet { access_modes: vec![], volume_mode: Some("Block".into()) }]));
        assert!(is_incomplete(&[ClaimPropertySet {
            access_modes: vec!["ReadWriteOnce".into()],
            volume_mode: None
        }]));
        assert!(!is_incomplete(&[ClaimPropertySet {
            access_modes: vec!["ReadWriteOnce".into()],
            volume_mode: Some("Filesystem".into())
        }]));
    }

    #[test]
    fn test_property_sets_from_pvs_dedup() {
        let pvs = vec![
            pv("local", &["ReadWriteOnce"], None),
            pv("local", &["ReadWriteOnce"], Some("Filesystem")),
            pv("local", &["ReadWriteOnce", "ReadOnlyMany"], Some("Block")),
            pv("other", &["ReadWriteMany"], Some("Filesystem")),
        ];
        let sets = property_sets_from_pvs("local", &pvs);
        assert_eq!(sets.len(), 3);
        assert!(sets.contains(&ClaimPropertySet {
            access_modes: vec!["ReadWriteOnce".into()],
            volume_mode: Some("Filesystem".into())
        }));
        assert!(sets.contains(&ClaimPropertySet {
            access_modes: vec!["ReadWriteOnce".into()],
            volume_mode: Some("Block".into())
        }));
        assert!(sets.contains(&ClaimPropertySet {
            access_modes: vec!["ReadOnlyMany".into()],
            volume_mode: Some("Block".into())
        }));
    }

    #[test]
    fn test_empty_storage_profile_labels() {
        let profile = empty_storage_profile("gold");
        let labels = profile.metadata.labels.unwrap();
        assert_eq!(labels.get(CDI_LABEL_KEY).map(String::as_str), Some(CDI_LABEL_VALUE));
        assert_eq!(profile.metadata.name.as_deref(), Some("gold"));
    }
}
