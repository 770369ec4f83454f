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

//! Per-device metric sampling.
//!
//! Library calls block, so each device is read on the blocking pool. The SM
//! utilization window is the only wait spent on the async side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, error, warn};

use crate::collector::metric::{
    labels, names, Contribution, DeviceMetrics, LabelSet, MetricRecord,
};
use crate::collector::SubCollector;
use crate::common::config::{AppConfig, MetricConfig};
use crate::device::process_utils::ProcessNameResolver;
use crate::device::topology::Topology;
use crate::device::traits::{DeviceTelemetryProvider, ProviderError, ProviderResult};
use crate::device::types::{DeviceHandle, DeviceInfo, GpmSampleId};
use crate::utils::bytes_to_mib;

#[derive(Clone)]
struct LiveDevice {
    info: DeviceInfo,
    handle: DeviceHandle,
}

/// Reads the configured metric set from every discovered device.
pub struct DeviceSampler {
    provider: Arc<dyn DeviceTelemetryProvider>,
    topology: Arc<Topology>,
    metrics: Arc<[MetricConfig]>,
    /// Resolved on the first wake.
    devices: Option<Vec<LiveDevice>>,
    processes: ProcessNameResolver,
    sample_interval: Duration,
}

impl DeviceSampler {
    pub fn new(
        provider: Arc<dyn DeviceTelemetryProvider>,
        topology: Arc<Topology>,
        metrics: Vec<MetricConfig>,
    ) -> Self {
        for metric in metrics.iter().filter(|m| !names::is_known(&m.name)) {
            warn!(
                "No collector for metric '{}', it will be advertised without samples",
                metric.name
            );
        }
        Self {
            provider,
            topology,
            metrics: metrics.into(),
            devices: None,
            processes: ProcessNameResolver::detect(),
            sample_interval: Duration::from_secs(AppConfig::SM_SAMPLE_INTERVAL_SECS),
        }
    }

    /// Delay between the two SM utilization samples.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_process_resolver(mut self, resolver: ProcessNameResolver) -> Self {
        self.processes = resolver;
        self
    }

    fn reader(&self, device: &LiveDevice) -> DeviceReader {
        DeviceReader {
            provider: Arc::clone(&self.provider),
            metrics: Arc::clone(&self.metrics),
            processes: self.processes.clone(),
            device: device.clone(),
        }
    }

    async fn sample_device(&self, device: &LiveDevice) -> Vec<MetricRecord> {
        let reader = self.reader(device);
        let first = reader.clone();
        let Some((mut records, pending)) = blocking(move || first.read_all()).await else {
            return Vec::new();
        };

        if let Some(pending) = pending {
            tokio::time::sleep(self.sample_interval).await;
            let slot = pending.slot.min(records.len());
            let base = base_labels(&device.info);
            if let Some(Some(value)) = blocking(move || reader.finish_sm(pending)).await {
                records.insert(slot, MetricRecord::new(names::SM_UTILIZATION, value, base));
            }
        }
        records
    }
}

#[async_trait]
impl SubCollector for DeviceSampler {
    fn name(&self) -> &str {
        "gpu"
    }

    async fn collect(&mut self) -> Contribution {
        if self.devices.is_none() {
            let provider = Arc::clone(&self.provider);
            let topology = Arc::clone(&self.topology);
            self.devices = blocking(move || resolve_devices(provider.as_ref(), &topology)).await;
        }
        let devices = self.devices.as_deref().unwrap_or(&[]);

        // One blocking pass per device, all in flight together.
        let passes = join_all(devices.iter().map(|d| self.sample_device(d))).await;

        let mut metrics = DeviceMetrics::new();
        for (device, records) in devices.iter().zip(passes) {
            if !records.is_empty() {
                metrics.insert(device.info.uuid.clone(), records);
            }
        }
        Contribution::Metrics(metrics)
    }
}

/// Run a library call on the blocking pool.
async fn blocking<T, F>(f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Device read task failed: {e}");
            None
        }
    }
}

fn resolve_devices(provider: &dyn DeviceTelemetryProvider, topology: &Topology) -> Vec<LiveDevice> {
    topology
        .devices_by_index()
        .into_iter()
        .filter_map(|info| match provider.device_by_uuid(&info.uuid) {
            Ok(handle) => Some(LiveDevice {
                info: info.clone(),
                handle,
            }),
            Err(e) => {
                error!("Unable to get handle for {}: {e}", info.uuid);
                None
            }
        })
        .collect()
}

/// SM sampling started by [`DeviceReader::read_all`], waiting for its
/// second sample.
struct PendingSm {
    /// Position of the record among the device's records.
    slot: usize,
    first: GpmSample,
    second: GpmSample,
}

/// Owned view of one device, movable onto the blocking pool.
#[derive(Clone)]
struct DeviceReader {
    provider: Arc<dyn DeviceTelemetryProvider>,
    metrics: Arc<[MetricConfig]>,
    processes: ProcessNameResolver,
    device: LiveDevice,
}

impl DeviceReader {
    /// Read every configured metric and take the first SM sample.
    fn read_all(&self) -> (Vec<MetricRecord>, Option<PendingSm>) {
        let base = base_labels(&self.device.info);
        let mut records = Vec::new();
        let mut pending = None;
        for metric in self.metrics.iter() {
            match metric.name.as_str() {
                names::PROCESS_INFO => records.extend(self.process_records(&base)),
                names::SM_UTILIZATION => {
                    if pending.is_none() {
                        pending = self.begin_sm(records.len());
                    }
                }
                name => {
                    if let Some(value) = self.scalar(name) {
                        records.push(MetricRecord::new(name, value, base.clone()));
                    }
                }
            }
        }
        (records, pending)
    }

    /// `None` skips the record; other read failures become zero.
    fn scalar(&self, name: &str) -> Option<f64> {
        let p = &*self.provider;
        let h = &self.device.handle;
        let value: ProviderResult<f64> = match name {
            names::TEMPERATURE => p.temperature(h).map(f64::from),
            names::FAN_SPEED => p.fan_speed(h).map(f64::from),
            names::SM_CLOCK => p.clock_info(h).map(|c| f64::from(c.sm)),
            names::MEM_CLOCK => p.clock_info(h).map(|c| f64::from(c.mem)),
            names::MEM_TOTAL => p.memory_info(h).map(|m| to_mib(m.total)),
            names::MEM_USED => p.memory_info(h).map(|m| to_mib(m.used)),
            names::MEM_FREE => p.memory_info(h).map(|m| to_mib(m.free)),
            names::MEM_UTILIZATION => p.utilization_rates(h).map(|u| f64::from(u.memory)),
            names::GPU_UTILIZATION => p.utilization_rates(h).map(|u| f64::from(u.gpu)),
            names::POWER_USAGE => p.power_usage(h).map(f64::from),
            names::XID_ERRORS => p.clocks_throttle_reasons(h).map(|r| r as f64),
            names::ECC_SBE_VOL => p.ecc_errors(h).map(|e| e.single_bit as f64),
            names::ECC_DBE_VOL => p.ecc_errors(h).map(|e| e.double_bit as f64),
            _ => return None,
        };
        let uuid = &self.device.info.uuid;
        match value {
            Ok(value) => Some(value),
            Err(ProviderError::NotSupported) => {
                debug!("{name} not supported on {uuid}");
                None
            }
            Err(e) => {
                warn!("Unable to get {name} of {uuid}: {e}");
                Some(0.0)
            }
        }
    }

    fn process_records(&self, base: &LabelSet) -> Vec<MetricRecord> {
        let processes = match self.provider.running_processes(&self.device.handle) {
            Ok(processes) => processes,
            Err(e) => {
                warn!("Unable to get processes of {}: {e}", self.device.info.uuid);
                return Vec::new();
            }
        };

        let record = |pid: String, name: String, value: f64| {
            let mut set = base.clone();
            set.insert(labels::PROCESS_PID.to_string(), pid);
            set.insert(labels::PROCESS_NAME.to_string(), name);
            MetricRecord::new(names::PROCESS_INFO, value, set)
        };

        if processes.is_empty() {
            return vec![record(String::new(), String::new(), 0.0)];
        }
        processes
            .iter()
            .map(|p| {
                record(
                    p.pid.to_string(),
                    self.processes.name(p.pid),
                    to_mib(p.used_memory),
                )
            })
            .collect()
    }

    fn begin_sm(&self, slot: usize) -> Option<PendingSm> {
        let p = &self.provider;
        let h = &self.device.handle;
        let uuid = &self.device.info.uuid;

        match p.gpm_supported(h) {
            Ok(true) => {}
            Ok(false) | Err(ProviderError::NotSupported) => return None,
            Err(e) => {
                warn!("Unable to query SM sampling support of {uuid}: {e}");
                return None;
            }
        }

        let first = GpmSample::alloc(p)
            .map_err(|e| warn!("Unable to allocate sample: {e}"))
            .ok()?;
        let second = GpmSample::alloc(p)
            .map_err(|e| warn!("Unable to allocate sample: {e}"))
            .ok()?;

        if let Err(e) = p.gpm_sample_get(h, first.id) {
            warn!("Could not take first sample of {uuid}: {e}");
            return None;
        }
        Some(PendingSm {
            slot,
            first,
            second,
        })
    }

    fn finish_sm(&self, pending: PendingSm) -> Option<f64> {
        let p = &*self.provider;
        let h = &self.device.handle;
        let uuid = &self.device.info.uuid;

        if let Err(e) = p.gpm_sample_get(h, pending.second.id) {
            warn!("Could not take second sample of {uuid}: {e}");
            return None;
        }
        p.gpm_sm_utilization(h, pending.first.id, pending.second.id)
            .map_err(|e| warn!("Unable to compute SM utilization of {uuid}: {e}"))
            .ok()
    }
}

/// A provider sample slot, released when dropped.
struct GpmSample {
    provider: Arc<dyn DeviceTelemetryProvider>,
    id: GpmSampleId,
}

impl GpmSample {
    fn alloc(provider: &Arc<dyn DeviceTelemetryProvider>) -> ProviderResult<Self> {
        let id = provider.gpm_sample_alloc()?;
        Ok(Self {
            provider: Arc::clone(provider),
            id,
        })
    }
}

impl Drop for GpmSample {
    fn drop(&mut self) {
        self.provider.gpm_sample_free(self.id);
    }
}

fn base_labels(info: &DeviceInfo) -> LabelSet {
    let mut set = LabelSet::new();
    set.insert(labels::GPU.to_string(), info.index.to_string());
    set.insert(labels::NAME.to_string(), info.name.clone());
    set.insert(labels::UUID.to_string(), info.uuid.clone());
    set
}

fn to_mib(bytes: u64) -> f64 {
    bytes_to_mib(bytes) as f64
}
