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

use anyhow::{anyhow, bail, Result};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::values::{APP_KUBERNETES_COMPONENT_LABEL, APP_KUBERNETES_MANAGED_BY_LABEL};

/// Alignment used for disk image sizing, a multiple of all known hardware
/// block sizes 512/4k/8k/32k/64k.
pub const DEFAULT_ALIGN_BLOCK_SIZE: i64 = 1024 * 1024;

pub const VOLUME_MODE_BLOCK: &str = "Block";
pub const VOLUME_MODE_FILESYSTEM: &str = "Filesystem";

pub const ACCESS_MODE_RWO: &str = "ReadWriteOnce";
pub const ACCESS_MODE_ROX: &str = "ReadOnlyMany";
pub const ACCESS_MODE_RWX: &str = "ReadWriteMany";

pub const CLAIM_PENDING: &str = "Pending";
pub const CLAIM_BOUND: &str = "Bound";
pub const CLAIM_LOST: &str = "Lost";

pub const POD_PENDING: &str = "Pending";
pub const POD_RUNNING: &str = "Running";
pub const POD_SUCCEEDED: &str = "Succeeded";
pub const POD_FAILED: &str = "Failed";

/// RoundUp returns the number rounded up to the nearest multiple.
pub fn round_up(number: i64, multiple: i64) -> i64 {
    (number + multiple - 1) / multiple * multiple
}

/// RoundDown returns the number rounded down to the nearest multiple.
pub fn round_down(number: i64, multiple: i64) -> i64 {
    number / multiple * multiple
}

/// Space the PVC must request so that the usable part after filesystem
/// overhead still fits the aligned image. The result is 1 MiB aligned.
pub fn get_required_space(filesystem_overhead: f64, requested_space: i64) -> i64 {
    let aligned_size = round_up(requested_space, DEFAULT_ALIGN_BLOCK_SIZE);
    let space_with_overhead = (aligned_size as f64 / (1.0 - filesystem_overhead)).ceil() as i64;
    round_up(space_with_overhead, DEFAULT_ALIGN_BLOCK_SIZE)
}

/// Space usable for image data on a volume of the given size, taking the
/// filesystem overhead into account. qemu-img rounds up, so the result is
/// rounded down to the 1 MiB alignment to not overshoot the validation.
pub fn get_usable_space(filesystem_overhead: f64, available_space: i64) -> i64 {
    let space_with_overhead = ((1.0 - filesystem_overhead) * available_space as f64).ceil() as i64;
    round_down(space_with_overhead, DEFAULT_ALIGN_BLOCK_SIZE)
}

/// Parse a Kubernetes resource quantity ("1G", "500Mi", "1073741824") into
/// bytes. Binary (Ki/Mi/Gi/Ti/Pi/Ei) and decimal (k/M/G/T/P/E) suffixes are
/// supported; fractional values are resolved against the suffix scale.
pub fn parse_quantity(quantity: &str) -> Result<i64> {
    let s = quantity.trim();
    if s.is_empty() {
        bail!("cannot parse empty quantity");
    }
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-').unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let value: f64 = num.parse().map_err(|_| anyhow!("cannot parse quantity {}", quantity))?;
    let scale: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "m" => 1e-3,
        _ => bail!("unrecognized quantity suffix {} in {}", suffix, quantity),
    };
    Ok((value * scale) as i64)
}

/// The requested storage size of a PVC spec, as the user wrote it.
pub fn get_requested_image_size(pvc: &PersistentVolumeClaim) -> Result<String> {
    pvc.spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.clone())
        .ok_or_else(|| anyhow!("missing storage size"))
}

/// Resolve an optional PVC volume mode, defaulting to filesystem.
pub fn resolve_volume_mode(volume_mode: Option<&String>) -> &'static str {
    match volume_mode {
        Some(mode) if mode == VOLUME_MODE_BLOCK => VOLUME_MODE_BLOCK,
        _ => VOLUME_MODE_FILESYSTEM,
    }
}

/// Add source entries to dest; source wins on conflicts.
pub fn merge_labels(src: &BTreeMap<String, String>, dest: &mut BTreeMap<String, String>) {
    for (k, v) in src {
        dest.insert(k.clone(), v.clone());
    }
}

/// Stamp the recommended `app.kubernetes.io` labels on a label map without
/// discarding what is already there; installer labels win last.
pub fn set_recommended_labels(
    labels: &mut BTreeMap<String, String>,
    installer_labels: &BTreeMap<String, String>,
    controller_name: &str,
) {
    let mut statics = BTreeMap::new();
    statics.insert(APP_KUBERNETES_MANAGED_BY_LABEL.to_string(), controller_name.to_string());
    statics.insert(APP_KUBERNETES_COMPONENT_LABEL.to_string(), "storage".to_string());
    merge_labels(&statics, labels);
    merge_labels(installer_labels, labels);
}

pub fn quantity(value: &str) -> Quantity {
    Quantity(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MI: i64 = 1024 * 1024;
    const GI: i64 = 1024 * MI;
    const NO_OVERHEAD: f64 = 0.0;
    const DEFAULT_OVERHEAD: f64 = 0.055;
    const LARGE_OVERHEAD: f64 = 0.75;

    fn assert_required_space_properties(image_size: i64, overhead: f64) {
        for tested_size in (image_size - 1024)..(image_size + 1024) {
            let aligned_image_space =
                if tested_size > image_size { image_size + MI } else { image_size };

            let actual_required_space = get_required_space(overhead, tested_size);

            let overhead_space = actual_required_space - aligned_image_space;
            let actual_overhead = overhead_space as f64 / actual_required_space as f64;
            assert!(
                (actual_overhead - overhead).abs() < 0.01,
                "size {} overhead {} got {}",
                tested_size,
                overhead,
                actual_overhead
            );
            assert_eq!(actual_required_space % DEFAULT_ALIGN_BLOCK_SIZE, 0);
        }
    }

    #[test]
    fn test_required_space_1mi() {
        assert_required_space_properties(MI, NO_OVERHEAD);
        assert_required_space_properties(MI, DEFAULT_OVERHEAD);
        assert_required_space_properties(MI, LARGE_OVERHEAD);
    }

    #[test]
    fn test_required_space_40mi() {
        assert_required_space_properties(40 * MI, NO_OVERHEAD);
        assert_required_space_properties(40 * MI, DEFAULT_OVERHEAD);
        assert_required_space_properties(40 * MI, LARGE_OVERHEAD);
    }

    #[test]
    fn test_required_space_1gi() {
        assert_required_space_properties(GI, NO_OVERHEAD);
        assert_required_space_properties(GI, DEFAULT_OVERHEAD);
        assert_required_space_properties(GI, LARGE_OVERHEAD);
    }

    #[test]
    fn test_required_space_40gi() {
        assert_required_space_properties(40 * GI, NO_OVERHEAD);
        assert_required_space_properties(40 * GI, DEFAULT_OVERHEAD);
        assert_required_space_properties(40 * GI, LARGE_OVERHEAD);
    }

    #[test]
    fn test_usable_space_alignment() {
        assert_eq!(get_usable_space(0.0, GI), GI);
        assert_eq!(get_usable_space(0.055, GI) % DEFAULT_ALIGN_BLOCK_SIZE, 0);
        assert!(get_usable_space(0.055, GI) < GI);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity("1Gi").unwrap(), GI);
        assert_eq!(parse_quantity("40Mi").unwrap(), 40 * MI);
        assert_eq!(parse_quantity("1073741824").unwrap(), GI);
        assert_eq!(parse_quantity("1.5Gi").unwrap(), GI + GI / 2);
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("1Q").is_err());
    }

    #[test]
    fn test_round_up_down() {
        assert_eq!(round_up(1, MI), MI);
        assert_eq!(round_up(MI, MI), MI);
        assert_eq!(round_up(MI + 1, MI), 2 * MI);
        assert_eq!(round_down(MI + 1, MI), MI);
        assert_eq!(round_down(MI - 1, MI), 0);
    }

    #[test]
    fn test_resolve_volume_mode() {
        assert_eq!(resolve_volume_mode(None), VOLUME_MODE_FILESYSTEM);
        assert_eq!(resolve_volume_mode(Some(&"Filesystem".to_string())), VOLUME_MODE_FILESYSTEM);
        assert_eq!(resolve_volume_mode(Some(&"Block".to_string())), VOLUME_MODE_BLOCK);
    }

    #[test]
    fn test_set_recommended_labels() {
        let mut labels = BTreeMap::new();
        labels.insert("existing".to_string(), "kept".to_string());
        let mut installer = BTreeMap::new();
        installer.insert("app.kubernetes.io/part-of".to_string(), "testing".to_string());
        set_recommended_labels(&mut labels, &installer, "cdi-controller");
        assert_eq!(labels.get("existing").map(String::as_str), Some("kept"));
        assert_eq!(labels.get("app.kubernetes.io/managed-by").map(String::as_str), Some("cdi-controller"));
        assert_eq!(labels.get("app.kubernetes.io/component").map(String::as_str), Some("storage"));
        assert_eq!(labels.get("app.kubernetes.io/part-of").map(String::as_str), Some("testing"));
    }
}
