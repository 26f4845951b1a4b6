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

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;

use anyhow::Result;
use env_logger::{Builder, Env, Target};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::core::ErrorResponse;
use kube::runtime::controller::{Context, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use log::{error, info, warn};

mod controller;

use common::apiclient::ControllerClient;
use common::crd::{CDIConfig, DataVolume, Proxy, CDI};
use common::values::{
    APP_KUBERNETES_PART_OF_LABEL, APP_KUBERNETES_VERSION_LABEL, CDI_CR_NAME, CONFIG_NAME,
};
use controller::token::SignedToken;
use controller::{
    config_error_policy, datavolume_error_policy, pod_error_policy, profile_error_policy,
    reconcile_config, reconcile_datavolume, reconcile_pvc, reconcile_storage_profile,
    ConfigController, DataVolumeController, PvcPodController, StorageProfileController,
};

const CONTROLLER_VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");
const DEFAULT_IMPORTER_IMAGE: &str = "cdi-importer:latest";
const DEFAULT_UPLOADSERVER_IMAGE: &str = "cdi-uploadserver:latest";

#[tokio::main]
async fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("controller=info"))
        .target(Target::Stdout)
        .init();
    let client = Client::try_default().await?;
    info!(
        "cdi-controller version is {}, start reconcile",
        CONTROLLER_VERSION.unwrap_or("Not Found")
    );

    let installer_labels = fetch_installer_labels(client.clone()).await;
    let token_key = env::var("CLONE_TOKEN_KEY").unwrap_or_default();
    if token_key.is_empty() {
        warn!("CLONE_TOKEN_KEY not set; cross-namespace clones will be rejected");
    }
    let importer_image =
        env::var("IMPORTER_IMAGE").unwrap_or_else(|_| DEFAULT_IMPORTER_IMAGE.to_string());
    let uploadserver_image =
        env::var("UPLOADSERVER_IMAGE").unwrap_or_else(|_| DEFAULT_UPLOADSERVER_IMAGE.to_string());

    let dv_controller = DataVolumeController::new(
        client.clone(),
        ControllerClient::new(client.clone()),
        Arc::new(SignedToken::new(token_key.into_bytes())),
        installer_labels.clone(),
    );
    let datavolumes = Controller::new(Api::<DataVolume>::all(client.clone()), ListParams::default())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), ListParams::default())
        .run(reconcile_datavolume, datavolume_error_policy, Context::new(dv_controller))
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("DataVolume reconcile failed: {}", e);
            }
        });

    let pvc_controller = PvcPodController::new(
        client.clone(),
        ControllerClient::new(client.clone()),
        importer_image,
        uploadserver_image,
    );
    let pvcs = Controller::new(Api::<PersistentVolumeClaim>::all(client.clone()), ListParams::default())
        .owns(Api::<k8s_openapi::api::core::v1::Pod>::all(client.clone()), ListParams::default())
        .run(reconcile_pvc, pod_error_policy, Context::new(pvc_controller))
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("PVC reconcile failed: {}", e);
            }
        });

    let profile_controller = StorageProfileController::new(
        client.clone(),
        ControllerClient::new(client.clone()),
        installer_labels,
    );
    let profiles = Controller::new(Api::<StorageClass>::all(client.clone()), ListParams::default())
        .watches(
            Api::<PersistentVolume>::all(client.clone()),
            ListParams::default(),
            |pv: PersistentVolume| {
                pv.spec
                    .and_then(|spec| spec.storage_class_name)
                    .map(|name| ObjectRef::new(&name))
            },
        )
        .run(reconcile_storage_profile, profile_error_policy, Context::new(profile_controller))
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("StorageProfile reconcile failed: {}", e);
            }
        });

    let config_controller =
        ConfigController::new(client.clone(), ControllerClient::new(client.clone()));
    let configs = Controller::new(Api::<CDIConfig>::all(client.clone()), ListParams::default())
        .watches(Api::<Proxy>::all(client.clone()), ListParams::default(), |_proxy: Proxy| {
            Some(ObjectRef::new(CONFIG_NAME))
        })
        .run(reconcile_config, config_error_policy, Context::new(config_controller))
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("CDIConfig reconcile failed: {}", e);
            }
        });

    futures::join!(datavolumes, pvcs, profiles, configs);
    info!("cdi-controller terminated");
    Ok(())
}

/// Labels the installer stamped on the CDI resource flow onto everything
/// the controllers create.
async fn fetch_installer_labels(client: Client) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let cdi_api: Api<CDI> = Api::all(client);
    match cdi_api.get(CDI_CR_NAME).await {
        Ok(cdi) => {
            for key in [APP_KUBERNETES_PART_OF_LABEL, APP_KUBERNETES_VERSION_LABEL] {
                if let Some(value) = cdi.labels().get(key) {
                    labels.insert(key.to_string(), value.clone());
                }
            }
        }
        Err(kube::Error::Api(ErrorResponse { reason, .. })) if reason == "NotFound" => {}
        Err(e) => warn!("unable to read CDI resource for installer labels: {}", e),
    }
    labels
}
