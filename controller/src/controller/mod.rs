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

#[cfg(test)]
pub mod apiserver_mock;
pub mod capabilities;
pub mod checkpoint;
pub mod clone;
pub mod config;
pub mod datavolume;
pub mod pod;
pub mod storage_profile;
pub mod token;

pub use config::{error_policy as config_error_policy, reconcile as reconcile_config, ConfigController};
pub use datavolume::{
    error_policy as datavolume_error_policy, reconcile as reconcile_datavolume, DataVolumeController,
};
pub use pod::{error_policy as pod_error_policy, reconcile as reconcile_pvc, PvcPodController};
pub use storage_profile::{
    error_policy as profile_error_policy, reconcile as reconcile_storage_profile,
    StorageProfileController,
};
