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

//! The progress exposition contract between a worker pod and the
//! controller. The controller scrapes a single line of the form
//! `<metric>{ownerUID="<uid>"} <value>` from the pod metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Percentage of `total` read so far, clamped to [0,100].
pub fn percent_complete(counter: &Arc<AtomicU64>, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let current = counter.load(Ordering::Relaxed).min(total);
    current as f64 / total as f64 * 100.0
}

/// Render the exposition line the controller's scraper matches.
pub fn format_metric_line(metric: &str, owner_uid: &str, value: f64) -> String {
    format!("{}{{ownerUID=\"{}\"}} {:.2}", metric, owner_uid, value)
}

#[cfg(test)]
mod tests {
    use common::values::IMPORT_PROGRESS_METRIC;

    use super::*;

    #[test]
    fn test_percent_complete() {
        let counter = Arc::new(AtomicU64::new(0));
        assert_eq!(percent_complete(&counter, 0), 0.0);
        assert_eq!(percent_complete(&counter, 1000), 0.0);
        counter.store(134, Ordering::Relaxed);
        assert!((percent_complete(&counter, 1000) - 13.4).abs() < f64::EPSILON);
        counter.store(2000, Ordering::Relaxed);
        assert_eq!(percent_complete(&counter, 1000), 100.0);
    }

    #[test]
    fn test_format_metric_line() {
        let line = format_metric_line(
            IMPORT_PROGRESS_METRIC,
            "b856691e-1038-11e9-a5ab-525500d15501",
            13.45,
        );
        assert_eq!(line, "import_progress{ownerUID=\"b856691e-1038-11e9-a5ab-525500d15501\"} 13.45");
    }
}
