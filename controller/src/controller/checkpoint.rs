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

//! Multi-stage (checkpointed) import protocol, carried entirely in PVC
//! annotations. The worker pod copies one delta per pod run; the engine
//! advances the current checkpoint after each completed copy and clears
//! the protocol annotations once the final delta landed.
//!
//! Checkpoint annotations that already exist are never overwritten, a
//! manual override stays authoritative.

use std::collections::BTreeMap;

use common::crd::DataVolume;
use common::utils::POD_SUCCEEDED;
use common::values::{
    ANN_CHECKPOINTS_COPIED, ANN_CURRENT_CHECKPOINT, ANN_CURRENT_POD_ID, ANN_FINAL_CHECKPOINT,
    ANN_MULTI_STAGE_IMPORT_DONE, ANN_POD_PHASE, ANN_PREVIOUS_CHECKPOINT,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointTarget {
    pub previous: String,
    pub current: String,
    pub is_final: bool,
}

fn copied_key(checkpoint: &str) -> String {
    format!("{}.{}", ANN_CHECKPOINTS_COPIED, checkpoint)
}

/// The first checkpoint of the DataVolume that has not been recorded as
/// copied yet. `extra_copied` names a checkpoint whose copy was recorded in
/// this very reconcile and is not visible in the annotations yet.
pub fn next_checkpoint(
    dv: &DataVolume,
    annotations: &BTreeMap<String, String>,
    extra_copied: Option<&str>,
) -> Option<CheckpointTarget> {
    let checkpoints = &dv.spec.checkpoints;
    for (i, checkpoint) in checkpoints.iter().enumerate() {
        let copied = annotations.contains_key(&copied_key(&checkpoint.current))
            || extra_copied == Some(checkpoint.current.as_str());
        if !copied {
            return Some(CheckpointTarget {
                previous: checkpoint.previous.clone(),
                current: checkpoint.current.clone(),
                is_final: i == checkpoints.len() - 1 && dv.spec.final_checkpoint,
            });
        }
    }
    None
}

/// Annotations to stamp on a PVC that does not carry the protocol yet.
/// Returns an empty map when there is nothing to do: no checkpoints on the
/// DataVolume, a finished import, or pre-existing checkpoint annotations.
pub fn initial_annotations(
    dv: &DataVolume,
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    if dv.spec.checkpoints.is_empty() {
        return result;
    }
    if annotations.contains_key(ANN_MULTI_STAGE_IMPORT_DONE) {
        return result;
    }
    if annotations.contains_key(ANN_PREVIOUS_CHECKPOINT)
        || annotations.contains_key(ANN_CURRENT_CHECKPOINT)
        || annotations.contains_key(ANN_FINAL_CHECKPOINT)
    {
        return result;
    }
    if let Some(target) = next_checkpoint(dv, annotations, None) {
        result.insert(ANN_PREVIOUS_CHECKPOINT.to_string(), target.previous);
        result.insert(ANN_CURRENT_CHECKPOINT.to_string(), target.current);
        result.insert(ANN_FINAL_CHECKPOINT.to_string(), target.is_final.to_string());
    }
    result
}

/// Annotation patch to apply after the worker pod finished copying the
/// current delta. Values of `None` delete the key. Returns `None` when the
/// protocol is not in the completed-delta state.
pub fn advance_on_pod_success(
    dv: &DataVolume,
    annotations: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, Option<String>>> {
    if annotations.get(ANN_POD_PHASE).map(String::as_str) != Some(POD_SUCCEEDED) {
        return None;
    }
    let current = annotations.get(ANN_CURRENT_CHECKPOINT)?.clone();
    let pod_id = annotations.get(ANN_CURRENT_POD_ID).cloned().unwrap_or_default();
    let is_final =
        annotations.get(ANN_FINAL_CHECKPOINT).map(String::as_str) == Some("true");

    let mut patch: BTreeMap<String, Option<String>> = BTreeMap::new();
    patch.insert(copied_key(&current), Some(pod_id));

    if is_final {
        patch.insert(ANN_PREVIOUS_CHECKPOINT.to_string(), None);
        patch.insert(ANN_CURRENT_CHECKPOINT.to_string(), None);
        patch.insert(ANN_FINAL_CHECKPOINT.to_string(), None);
        patch.insert(ANN_CURRENT_POD_ID.to_string(), None);
        patch.insert(copied_key(&current), None);
        patch.insert(ANN_MULTI_STAGE_IMPORT_DONE.to_string(), Some("true".to_string()));
        return Some(patch);
    }

    if let Some(target) = next_checkpoint(dv, annotations, Some(current.as_str())) {
        patch.insert(ANN_PREVIOUS_CHECKPOINT.to_string(), Some(target.previous));
        patch.insert(ANN_CURRENT_CHECKPOINT.to_string(), Some(target.current));
        patch.insert(ANN_FINAL_CHECKPOINT.to_string(), Some(target.is_final.to_string()));
        patch.insert(ANN_CURRENT_POD_ID.to_string(), None);
    }
    Some(patch)
}
