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

//! In-memory telemetry provider for tests and the mock binary.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use crate::device::traits::{DeviceTelemetryProvider, ProviderError, ProviderResult};
use crate::device::types::{
    ClockInfo, DeviceHandle, EccErrors, GpmSampleId, MemoryInfo, RunningProcess, Utilization,
};

/// Queries that can be made to fail on a mock device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockQuery {
    Name,
    Uuid,
    Temperature,
    FanSpeed,
    Clocks,
    Memory,
    Power,
    Utilization,
    Throttle,
    Ecc,
    Processes,
    BoardPosition,
    SameBoard,
    /// Capability query for two-sample SM utilization.
    Gpm,
    /// Sample capture and the utilization computation.
    GpmSample,
}

#[derive(Debug, Clone)]
pub struct MockDevice {
    pub uuid: String,
    pub name: String,
    /// `None` reports the position query as unsupported (single-die board).
    pub board_position: Option<u32>,
    pub temperature: u32,
    pub fan_speed: u32,
    pub clocks: ClockInfo,
    pub memory: MemoryInfo,
    pub power_mw: u32,
    pub utilization: Utilization,
    pub throttle_reasons: u64,
    pub ecc: EccErrors,
    pub processes: Vec<RunningProcess>,
    pub gpm_supported: bool,
    pub sm_utilization: f64,
}

impl MockDevice {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            board_position: None,
            temperature: 40,
            fan_speed: 30,
            clocks: ClockInfo { sm: 1500, mem: 1600 },
            memory: MemoryInfo {
                total: 32 * 1024 * 1024 * 1024,
                used: 1024 * 1024 * 1024,
                free: 31 * 1024 * 1024 * 1024,
            },
            power_mw: 75_000,
            utilization: Utilization { gpu: 10, memory: 5 },
            throttle_reasons: 0,
            ecc: EccErrors::default(),
            processes: Vec::new(),
            gpm_supported: true,
            sm_utilization: 50.0,
        }
    }

    pub fn board_position(mut self, position: u32) -> Self {
        self.board_position = Some(position);
        self
    }

    pub fn temperature(mut self, celsius: u32) -> Self {
        self.temperature = celsius;
        self
    }

    pub fn processes(mut self, processes: Vec<RunningProcess>) -> Self {
        self.processes = processes;
        self
    }

    pub fn gpm(mut self, supported: bool, sm_utilization: f64) -> Self {
        self.gpm_supported = supported;
        self.sm_utilization = sm_utilization;
        self
    }
}

/// A scripted [`DeviceTelemetryProvider`].
///
/// Devices are addressed by their position in the list. Failures can be
/// injected per device and query, a query can be made to block the calling
/// thread, and allocated sample slots are tracked so tests can verify they
/// are released.
#[derive(Default)]
pub struct MockTelemetryProvider {
    devices: Mutex<Vec<MockDevice>>,
    same_board: HashSet<(u32, u32)>,
    failures: Mutex<HashMap<(u32, MockQuery), ProviderError>>,
    stalls: Mutex<HashMap<(u32, MockQuery), Duration>>,
    count_failure: Option<ProviderError>,
    live_samples: Mutex<HashSet<u64>>,
    next_sample: AtomicU64,
    jitter: bool,
    shut_down: AtomicBool,
}

impl MockTelemetryProvider {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            next_sample: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Declare devices `a` and `b` as two dies of one board.
    pub fn with_same_board(mut self, a: u32, b: u32) -> Self {
        self.same_board.insert((a, b));
        self.same_board.insert((b, a));
        self
    }

    pub fn with_failure(self, index: u32, query: MockQuery, error: ProviderError) -> Self {
        self.fail(index, query, error);
        self
    }

    /// Block the calling thread for `delay` whenever `query` hits device `index`.
    pub fn with_stall(self, index: u32, query: MockQuery, delay: Duration) -> Self {
        if let Ok(mut stalls) = self.stalls.lock() {
            stalls.insert((index, query), delay);
        }
        self
    }

    /// Make the device enumeration itself fail.
    pub fn with_count_failure(mut self, error: ProviderError) -> Self {
        self.count_failure = Some(error);
        self
    }

    /// Add small random variation to the live readings.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn fail(&self, index: u32, query: MockQuery, error: ProviderError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert((index, query), error);
        }
    }

    pub fn set_processes(&self, index: u32, processes: Vec<RunningProcess>) {
        if let Ok(mut devices) = self.devices.lock() {
            if let Some(device) = devices.get_mut(index as usize) {
                device.processes = processes;
            }
        }
    }

    /// Number of sample slots allocated and not yet freed.
    pub fn live_samples(&self) -> usize {
        self.live_samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn read<T>(
        &self,
        handle: &DeviceHandle,
        query: MockQuery,
        f: impl FnOnce(&MockDevice) -> ProviderResult<T>,
    ) -> ProviderResult<T> {
        if self.is_shut_down() {
            return Err(ProviderError::Uninitialized);
        }
        let stall = self
            .stalls
            .lock()
            .ok()
            .and_then(|stalls| stalls.get(&(handle.index(), query)).copied());
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }
        if let Ok(failures) = self.failures.lock() {
            if let Some(error) = failures.get(&(handle.index(), query)) {
                return Err(error.clone());
            }
        }
        let devices = self
            .devices
            .lock()
            .map_err(|_| ProviderError::Library("mock state poisoned".to_string()))?;
        let device = devices
            .get(handle.index() as usize)
            .ok_or_else(|| ProviderError::NotFound(format!("device {}", handle.index())))?;
        f(device)
    }

    fn vary(&self, value: u32, spread: u32) -> u32 {
        if !self.jitter || spread == 0 {
            return value;
        }
        let delta = rand::rng().random_range(0..=spread * 2);
        (value + delta).saturating_sub(spread)
    }
}

impl DeviceTelemetryProvider for MockTelemetryProvider {
    fn device_count(&self) -> ProviderResult<u32> {
        if let Some(error) = &self.count_failure {
            return Err(error.clone());
        }
        let devices = self
            .devices
            .lock()
            .map_err(|_| ProviderError::Library("mock state poisoned".to_string()))?;
        Ok(devices.len() as u32)
    }

    fn driver_version(&self) -> ProviderResult<String> {
        Ok("4.1.0".to_string())
    }

    fn cuda_version(&self) -> ProviderResult<String> {
        Ok("10.2".to_string())
    }

    fn device_by_index(&self, index: u32) -> ProviderResult<DeviceHandle> {
        let count = self.device_count()?;
        if index < count {
            Ok(DeviceHandle::new(index))
        } else {
            Err(ProviderError::NotFound(format!("device {index}")))
        }
    }

    fn device_by_uuid(&self, uuid: &str) -> ProviderResult<DeviceHandle> {
        let devices = self
            .devices
            .lock()
            .map_err(|_| ProviderError::Library("mock state poisoned".to_string()))?;
        devices
            .iter()
            .position(|d| d.uuid == uuid)
            .map(|i| DeviceHandle::new(i as u32))
            .ok_or_else(|| ProviderError::NotFound(uuid.to_string()))
    }

    fn name(&self, device: &DeviceHandle) -> ProviderResult<String> {
        self.read(device, MockQuery::Name, |d| Ok(d.name.clone()))
    }

    fn uuid(&self, device: &DeviceHandle) -> ProviderResult<String> {
        self.read(device, MockQuery::Uuid, |d| Ok(d.uuid.clone()))
    }

    fn temperature(&self, device: &DeviceHandle) -> ProviderResult<u32> {
        let value = self.read(device, MockQuery::Temperature, |d| Ok(d.temperature))?;
        Ok(self.vary(value, 3))
    }

    fn fan_speed(&self, device: &DeviceHandle) -> ProviderResult<u32> {
        self.read(device, MockQuery::FanSpeed, |d| Ok(d.fan_speed))
    }

    fn clock_info(&self, device: &DeviceHandle) -> ProviderResult<ClockInfo> {
        self.read(device, MockQuery::Clocks, |d| Ok(d.clocks))
    }

    fn memory_info(&self, device: &DeviceHandle) -> ProviderResult<MemoryInfo> {
        self.read(device, MockQuery::Memory, |d| Ok(d.memory))
    }

    fn power_usage(&self, device: &DeviceHandle) -> ProviderResult<u32> {
        let value = self.read(device, MockQuery::Power, |d| Ok(d.power_mw))?;
        Ok(self.vary(value, 5_000))
    }

    fn utilization_rates(&self, device: &DeviceHandle) -> ProviderResult<Utilization> {
        let rates = self.read(device, MockQuery::Utilization, |d| Ok(d.utilization))?;
        Ok(Utilization {
            gpu: self.vary(rates.gpu, 5).min(100),
            memory: self.vary(rates.memory, 5).min(100),
        })
    }

    fn clocks_throttle_reasons(&self, device: &DeviceHandle) -> ProviderResult<u64> {
        self.read(device, MockQuery::Throttle, |d| Ok(d.throttle_reasons))
    }

    fn ecc_errors(&self, device: &DeviceHandle) -> ProviderResult<EccErrors> {
        self.read(device, MockQuery::Ecc, |d| Ok(d.ecc))
    }

    fn running_processes(&self, device: &DeviceHandle) -> ProviderResult<Vec<RunningProcess>> {
        self.read(device, MockQuery::Processes, |d| Ok(d.processes.clone()))
    }

    fn board_position(&self, device: &DeviceHandle) -> ProviderResult<u32> {
        self.read(device, MockQuery::BoardPosition, |d| {
            d.board_position.ok_or(ProviderError::NotSupported)
        })
    }

    fn on_same_board(
        &self,
        first: &DeviceHandle,
        second: &DeviceHandle,
    ) -> ProviderResult<bool> {
        self.read(first, MockQuery::SameBoard, |_| Ok(()))?;
        self.read(second, MockQuery::SameBoard, |_| Ok(()))?;
        Ok(self.same_board.contains(&(first.index(), second.index())))
    }

    fn gpm_supported(&self, device: &DeviceHandle) -> ProviderResult<bool> {
        self.read(device, MockQuery::Gpm, |d| Ok(d.gpm_supported))
    }

    fn gpm_sample_alloc(&self) -> ProviderResult<GpmSampleId> {
        let id = self.next_sample.fetch_add(1, Ordering::SeqCst);
        self.live_samples
            .lock()
            .map_err(|_| ProviderError::Library("mock state poisoned".to_string()))?
            .insert(id);
        Ok(GpmSampleId(id))
    }

    fn gpm_sample_get(&self, device: &DeviceHandle, _sample: GpmSampleId) -> ProviderResult<()> {
        self.read(device, MockQuery::GpmSample, |_| Ok(()))
    }

    fn gpm_sm_utilization(
        &self,
        device: &DeviceHandle,
        _first: GpmSampleId,
        _second: GpmSampleId,
    ) -> ProviderResult<f64> {
        self.read(device, MockQuery::GpmSample, |d| Ok(d.sm_utilization))
    }

    fn gpm_sample_free(&self, sample: GpmSampleId) {
        if let Ok(mut samples) = self.live_samples.lock() {
            samples.remove(&sample.0);
        }
    }

    fn shutdown(&self) -> ProviderResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Err(ProviderError::Uninitialized);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_die_reports_position_unsupported() {
        let provider = MockTelemetryProvider::new(vec![MockDevice::new("GPU-a", "MR-V100")]);
        let handle = provider.device_by_index(0).unwrap();
        assert_eq!(
            provider.board_position(&handle),
            Err(ProviderError::NotSupported)
        );
    }

    #[test]
    fn test_injected_failure() {
        let provider = MockTelemetryProvider::new(vec![MockDevice::new("GPU-a", "MR-V100")])
            .with_failure(0, MockQuery::Temperature, ProviderError::Library("boom".into()));
        let handle = provider.device_by_index(0).unwrap();
        assert!(provider.temperature(&handle).is_err());
        assert_eq!(provider.fan_speed(&handle), Ok(30));
    }

    #[test]
    fn test_stalled_query_blocks_caller() {
        let provider = MockTelemetryProvider::new(vec![MockDevice::new("GPU-a", "MR-V100")])
            .with_stall(0, MockQuery::Temperature, Duration::from_millis(50));
        let handle = provider.device_by_index(0).unwrap();
        let start = std::time::Instant::now();
        assert_eq!(provider.temperature(&handle), Ok(40));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_sample_slots_are_tracked() {
        let provider = MockTelemetryProvider::new(vec![MockDevice::new("GPU-a", "MR-V100")]);
        let a = provider.gpm_sample_alloc().unwrap();
        let b = provider.gpm_sample_alloc().unwrap();
        assert_eq!(provider.live_samples(), 2);
        provider.gpm_sample_free(a);
        provider.gpm_sample_free(b);
        assert_eq!(provider.live_samples(), 0);
    }

    #[test]
    fn test_shutdown_invalidates_queries() {
        let provider = MockTelemetryProvider::new(vec![MockDevice::new("GPU-a", "MR-V100")]);
        let handle = provider.device_by_index(0).unwrap();
        provider.shutdown().unwrap();
        assert_eq!(provider.name(&handle), Err(ProviderError::Uninitialized));
        assert!(provider.shutdown().is_err());
    }
}
