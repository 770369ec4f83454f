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

//! Device telemetry through the IXML management library.
//!
//! IXML exports the NVML ABI, so it is driven through `nvml-wrapper` with the
//! library path pointed at `libixml.so`. GPM queries go through [`GpmApi`],
//! resolved from the same file.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use nvml_wrapper::enum_wrappers::device::{Clock, EccCounter, MemoryError, TemperatureSensor};
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{cuda_driver_version_major, cuda_driver_version_minor, Device, Nvml};

use crate::device::gpm::{GpmApi, RawGpmSample};
use crate::device::traits::{DeviceTelemetryProvider, ProviderError, ProviderResult};
use crate::device::types::{
    ClockInfo, DeviceHandle, EccErrors, GpmSampleId, MemoryInfo, RunningProcess, Utilization,
};

impl From<NvmlError> for ProviderError {
    fn from(err: NvmlError) -> Self {
        match err {
            NvmlError::NotSupported => Self::NotSupported,
            NvmlError::NotFound => Self::NotFound("device".to_string()),
            NvmlError::Uninitialized => Self::Uninitialized,
            other => Self::Library(other.to_string()),
        }
    }
}

pub struct IxmlProvider {
    /// `None` once the library has been shut down.
    nvml: Mutex<Option<Nvml>>,
    /// `None` when the library has no GPM entry points.
    gpm: Option<GpmApi>,
    samples: Mutex<HashMap<u64, RawGpmSample>>,
    next_sample: AtomicU64,
}

impl IxmlProvider {
    /// Load and initialise the library found at `library`.
    pub fn init(library: &str) -> ProviderResult<Self> {
        let nvml = Nvml::builder().lib_path(OsStr::new(library)).init()?;
        let gpm = match GpmApi::load(library) {
            Ok(gpm) => Some(gpm),
            Err(e) => {
                tracing::info!("GPM metrics unavailable: {e}");
                None
            }
        };
        Ok(Self {
            nvml: Mutex::new(Some(nvml)),
            gpm,
            samples: Mutex::new(HashMap::new()),
            next_sample: AtomicU64::new(1),
        })
    }

    fn with_nvml<F, T>(&self, f: F) -> ProviderResult<T>
    where
        F: FnOnce(&Nvml) -> Result<T, NvmlError>,
    {
        let guard = self.nvml.lock().map_err(|_| ProviderError::Uninitialized)?;
        let nvml = guard.as_ref().ok_or(ProviderError::Uninitialized)?;
        Ok(f(nvml)?)
    }

    fn with_device<F, T>(&self, handle: &DeviceHandle, f: F) -> ProviderResult<T>
    where
        F: FnOnce(&Device<'_>) -> Result<T, NvmlError>,
    {
        self.with_nvml(|nvml| {
            let device = nvml.device_by_index(handle.index())?;
            f(&device)
        })
    }

    /// GPM symbols, usable only while the library is initialised.
    fn gpm(&self) -> ProviderResult<&GpmApi> {
        self.with_nvml(|_| Ok(()))?;
        self.gpm.as_ref().ok_or(ProviderError::NotSupported)
    }

    fn samples(&self) -> ProviderResult<MutexGuard<'_, HashMap<u64, RawGpmSample>>> {
        self.samples
            .lock()
            .map_err(|_| ProviderError::Library("sample table poisoned".to_string()))
    }
}

fn missing_sample(sample: GpmSampleId) -> ProviderError {
    ProviderError::NotFound(format!("sample {}", sample.0))
}

impl DeviceTelemetryProvider for IxmlProvider {
    fn device_count(&self) -> ProviderResult<u32> {
        self.with_nvml(|nvml| nvml.device_count())
    }

    fn driver_version(&self) -> ProviderResult<String> {
        self.with_nvml(|nvml| nvml.sys_driver_version())
    }

    fn cuda_version(&self) -> ProviderResult<String> {
        self.with_nvml(|nvml| {
            let version = nvml.sys_cuda_driver_version()?;
            Ok(format!(
                "{}.{}",
                cuda_driver_version_major(version),
                cuda_driver_version_minor(version)
            ))
        })
    }

    fn device_by_index(&self, index: u32) -> ProviderResult<DeviceHandle> {
        self.with_nvml(|nvml| nvml.device_by_index(index).map(|_| DeviceHandle::new(index)))
    }

    fn device_by_uuid(&self, uuid: &str) -> ProviderResult<DeviceHandle> {
        self.with_nvml(|nvml| {
            let device = nvml.device_by_uuid(uuid)?;
            Ok(DeviceHandle::new(device.index()?))
        })
    }

    fn name(&self, device: &DeviceHandle) -> ProviderResult<String> {
        self.with_device(device, |d| d.name())
    }

    fn uuid(&self, device: &DeviceHandle) -> ProviderResult<String> {
        self.with_device(device, |d| d.uuid())
    }

    fn temperature(&self, device: &DeviceHandle) -> ProviderResult<u32> {
        self.with_device(device, |d| d.temperature(TemperatureSensor::Gpu))
    }

    fn fan_speed(&self, device: &DeviceHandle) -> ProviderResult<u32> {
        self.with_device(device, |d| d.fan_speed(0))
    }

    fn clock_info(&self, device: &DeviceHandle) -> ProviderResult<ClockInfo> {
        self.with_device(device, |d| {
            Ok(ClockInfo {
                sm: d.clock_info(Clock::SM)?,
                mem: d.clock_info(Clock::Memory)?,
            })
        })
    }

    fn memory_info(&self, device: &DeviceHandle) -> ProviderResult<MemoryInfo> {
        self.with_device(device, |d| {
            let mem = d.memory_info()?;
            Ok(MemoryInfo {
                total: mem.total,
                used: mem.used,
                free: mem.free,
            })
        })
    }

    fn power_usage(&self, device: &DeviceHandle) -> ProviderResult<u32> {
        self.with_device(device, |d| d.power_usage())
    }

    fn utilization_rates(&self, device: &DeviceHandle) -> ProviderResult<Utilization> {
        self.with_device(device, |d| {
            let rates = d.utilization_rates()?;
            Ok(Utilization {
                gpu: rates.gpu,
                memory: rates.memory,
            })
        })
    }

    fn clocks_throttle_reasons(&self, device: &DeviceHandle) -> ProviderResult<u64> {
        self.with_device(device, |d| d.current_throttle_reasons().map(|r| r.bits()))
    }

    fn ecc_errors(&self, device: &DeviceHandle) -> ProviderResult<EccErrors> {
        self.with_device(device, |d| {
            Ok(EccErrors {
                single_bit: d.total_ecc_errors(MemoryError::Corrected, EccCounter::Volatile)?,
                double_bit: d.total_ecc_errors(MemoryError::Uncorrected, EccCounter::Volatile)?,
            })
        })
    }

    fn running_processes(&self, device: &DeviceHandle) -> ProviderResult<Vec<RunningProcess>> {
        self.with_device(device, |d| {
            let processes = d.running_compute_processes()?;
            Ok(processes
                .into_iter()
                .map(|p| RunningProcess {
                    pid: p.pid,
                    used_memory: match p.used_gpu_memory {
                        UsedGpuMemory::Used(bytes) => bytes,
                        UsedGpuMemory::Unavailable => 0,
                    },
                })
                .collect())
        })
    }

    fn board_position(&self, device: &DeviceHandle) -> ProviderResult<u32> {
        self.with_device(device, |d| d.board_id())
    }

    fn on_same_board(
        &self,
        first: &DeviceHandle,
        second: &DeviceHandle,
    ) -> ProviderResult<bool> {
        self.with_nvml(|nvml| {
            let a = nvml.device_by_index(first.index())?;
            let b = nvml.device_by_index(second.index())?;
            a.is_on_same_board_as(&b)
        })
    }

    fn gpm_supported(&self, device: &DeviceHandle) -> ProviderResult<bool> {
        match self.gpm().and_then(|gpm| gpm.supported(device.index())) {
            Err(ProviderError::NotSupported) => Ok(false),
            other => other,
        }
    }

    fn gpm_sample_alloc(&self) -> ProviderResult<GpmSampleId> {
        let sample = self.gpm()?.alloc()?;
        let id = self.next_sample.fetch_add(1, Ordering::Relaxed);
        self.samples()?.insert(id, sample);
        Ok(GpmSampleId(id))
    }

    fn gpm_sample_get(&self, device: &DeviceHandle, sample: GpmSampleId) -> ProviderResult<()> {
        let gpm = self.gpm()?;
        let samples = self.samples()?;
        let raw = samples.get(&sample.0).ok_or_else(|| missing_sample(sample))?;
        gpm.capture(device.index(), raw)
    }

    fn gpm_sm_utilization(
        &self,
        _device: &DeviceHandle,
        first: GpmSampleId,
        second: GpmSampleId,
    ) -> ProviderResult<f64> {
        let gpm = self.gpm()?;
        let samples = self.samples()?;
        let start = samples.get(&first.0).ok_or_else(|| missing_sample(first))?;
        let end = samples.get(&second.0).ok_or_else(|| missing_sample(second))?;
        gpm.sm_utilization(start, end)
    }

    fn gpm_sample_free(&self, sample: GpmSampleId) {
        let raw = match self.samples.lock() {
            Ok(mut samples) => samples.remove(&sample.0),
            Err(_) => None,
        };
        if let (Some(gpm), Some(raw)) = (self.gpm.as_ref(), raw) {
            gpm.free(raw);
        }
    }

    fn shutdown(&self) -> ProviderResult<()> {
        // Outstanding samples must go back before the library shuts down.
        if let (Some(gpm), Ok(mut samples)) = (self.gpm.as_ref(), self.samples.lock()) {
            for (_, raw) in samples.drain() {
                gpm.free(raw);
            }
        }
        let nvml = self
            .nvml
            .lock()
            .map_err(|_| ProviderError::Uninitialized)?
            .take()
            .ok_or(ProviderError::Uninitialized)?;
        nvml.shutdown()?;
        Ok(())
    }
}
