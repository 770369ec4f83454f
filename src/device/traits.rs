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

use thiserror::Error;

use crate::device::types::{
    ClockInfo, DeviceHandle, EccErrors, GpmSampleId, MemoryInfo, RunningProcess, Utilization,
};

/// Errors reported by the device management library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The device does not implement the query.
    #[error("Not supported")]
    NotSupported,

    #[error("Not found: {0}")]
    NotFound(String),

    /// The library was never initialised or has been shut down.
    #[error("Library not initialized")]
    Uninitialized,

    #[error("Library error: {0}")]
    Library(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Access to the vendor device management library.
///
/// Every getter may fail; callers treat a failure as "value unavailable this
/// cycle". Calls may block on the driver, so async callers run them on the
/// blocking pool.
pub trait DeviceTelemetryProvider: Send + Sync {
    fn device_count(&self) -> ProviderResult<u32>;
    fn driver_version(&self) -> ProviderResult<String>;
    fn cuda_version(&self) -> ProviderResult<String>;

    fn device_by_index(&self, index: u32) -> ProviderResult<DeviceHandle>;
    fn device_by_uuid(&self, uuid: &str) -> ProviderResult<DeviceHandle>;

    fn name(&self, device: &DeviceHandle) -> ProviderResult<String>;
    fn uuid(&self, device: &DeviceHandle) -> ProviderResult<String>;
    fn temperature(&self, device: &DeviceHandle) -> ProviderResult<u32>;
    fn fan_speed(&self, device: &DeviceHandle) -> ProviderResult<u32>;
    fn clock_info(&self, device: &DeviceHandle) -> ProviderResult<ClockInfo>;
    fn memory_info(&self, device: &DeviceHandle) -> ProviderResult<MemoryInfo>;
    /// Power draw in milliwatts.
    fn power_usage(&self, device: &DeviceHandle) -> ProviderResult<u32>;
    fn utilization_rates(&self, device: &DeviceHandle) -> ProviderResult<Utilization>;
    fn clocks_throttle_reasons(&self, device: &DeviceHandle) -> ProviderResult<u64>;
    fn ecc_errors(&self, device: &DeviceHandle) -> ProviderResult<EccErrors>;
    fn running_processes(&self, device: &DeviceHandle) -> ProviderResult<Vec<RunningProcess>>;

    /// Position of the die on its board. `NotSupported` means single-die.
    fn board_position(&self, device: &DeviceHandle) -> ProviderResult<u32>;
    fn on_same_board(&self, first: &DeviceHandle, second: &DeviceHandle)
        -> ProviderResult<bool>;

    /// Whether two-sample SM utilization is available for the device.
    fn gpm_supported(&self, device: &DeviceHandle) -> ProviderResult<bool>;
    fn gpm_sample_alloc(&self) -> ProviderResult<GpmSampleId>;
    fn gpm_sample_get(&self, device: &DeviceHandle, sample: GpmSampleId) -> ProviderResult<()>;
    fn gpm_sm_utilization(
        &self,
        device: &DeviceHandle,
        first: GpmSampleId,
        second: GpmSampleId,
    ) -> ProviderResult<f64>;
    fn gpm_sample_free(&self, sample: GpmSampleId);

    /// Release the library. Further calls fail with `Uninitialized`.
    fn shutdown(&self) -> ProviderResult<()>;
}
