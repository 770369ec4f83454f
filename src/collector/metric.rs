// Copyright 2025 ix-exporter developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

/// Metric names with a collector function behind them.
pub mod names {
    pub const TEMPERATURE: &str = "ix_temperature";
    pub const FAN_SPEED: &str = "ix_fan_speed";
    pub const SM_CLOCK: &str = "ix_sm_clock";
    pub const MEM_CLOCK: &str = "ix_mem_clock";
    pub const MEM_TOTAL: &str = "ix_mem_total";
    pub const MEM_USED: &str = "ix_mem_used";
    pub const MEM_FREE: &str = "ix_mem_free";
    pub const MEM_UTILIZATION: &str = "ix_mem_utilization";
    pub const GPU_UTILIZATION: &str = "ix_gpu_utilization";
    pub const POWER_USAGE: &str = "ix_power_usage";
    pub const PROCESS_INFO: &str = "ix_process_info";
    pub const XID_ERRORS: &str = "ix_xid_errors";
    pub const ECC_SBE_VOL: &str = "ix_ecc_sbe_vol_status";
    pub const ECC_DBE_VOL: &str = "ix_ecc_dbe_vol_status";
    pub const SM_UTILIZATION: &str = "ix_sm_utilization";

    pub const ALL: &[&str] = &[
        TEMPERATURE,
        FAN_SPEED,
        SM_CLOCK,
        MEM_CLOCK,
        MEM_TOTAL,
        MEM_USED,
        MEM_FREE,
        MEM_UTILIZATION,
        GPU_UTILIZATION,
        POWER_USAGE,
        PROCESS_INFO,
        XID_ERRORS,
        ECC_SBE_VOL,
        ECC_DBE_VOL,
        SM_UTILIZATION,
    ];

    pub fn is_known(name: &str) -> bool {
        ALL.contains(&name)
    }
}

/// Label keys.
pub mod labels {
    pub const GPU: &str = "gpu";
    pub const NAME: &str = "name";
    pub const UUID: &str = "uuid";
    pub const NAMESPACE: &str = "namespace";
    pub const POD: &str = "pod";
    pub const CONTAINER: &str = "container";
    pub const NODE_NAME: &str = "node_name";
    pub const PROCESS_PID: &str = "process_pid";
    pub const PROCESS_NAME: &str = "process_name";

    pub const BASE: &[&str] = &[GPU, NAME, UUID];
    pub const KUBE: &[&str] = &[NAMESPACE, POD, CONTAINER, NODE_NAME];
    pub const PROCESS: &[&str] = &[PROCESS_PID, PROCESS_NAME];
}

pub type LabelSet = BTreeMap<String, String>;

/// One sample of one metric for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    pub labels: LabelSet,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, value: f64, labels: LabelSet) -> Self {
        Self {
            name: name.into(),
            value,
            labels,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Records produced in one pass, keyed by device UUID.
pub type DeviceMetrics = BTreeMap<String, Vec<MetricRecord>>;

/// Workload labels keyed by device UUID.
pub type LabelOverlay = BTreeMap<String, LabelSet>;

/// What one sub-collector hands back for a round.
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    Metrics(DeviceMetrics),
    Labels(LabelOverlay),
}

/// Merged per-device records for one scrape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeSnapshot {
    pub devices: BTreeMap<String, Vec<MetricRecord>>,
}

impl ScrapeSnapshot {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &MetricRecord> {
        self.devices.values().flatten()
    }

    pub fn records_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MetricRecord> {
        self.records().filter(move |r| r.name == name)
    }

    pub fn device(&self, uuid: &str) -> Option<&[MetricRecord]> {
        self.devices.get(uuid).map(Vec::as_slice)
    }
}

/// Advertised shape of one metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    /// Label keys in publication order.
    pub label_names: Vec<String>,
}

/// Labels carried by every record: base keys, plus workload keys when
/// Kubernetes correlation is on.
pub fn label_schema(with_kube: bool) -> Vec<String> {
    let mut schema: Vec<String> = labels::BASE.iter().map(|s| s.to_string()).collect();
    if with_kube {
        schema.extend(labels::KUBE.iter().map(|s| s.to_string()));
    }
    schema
}

/// Descriptor for `name` given the global schema.
pub fn descriptor_for(name: &str, help: &str, schema: &[String]) -> MetricDescriptor {
    let mut label_names = schema.to_vec();
    if name == names::PROCESS_INFO {
        label_names.extend(labels::PROCESS.iter().map(|s| s.to_string()));
    }
    MetricDescriptor {
        name: name.to_string(),
        help: help.to_string(),
        label_names,
    }
}
