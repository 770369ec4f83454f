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

/// Identity of one accelerator, fixed at topology discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub uuid: String,
    pub name: String,
    pub index: u32,
}

/// A live reference to a device inside the telemetry provider.
///
/// Handles are only meaningful to the provider that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    index: u32,
}

impl DeviceHandle {
    pub fn new(index: u32) -> Self {
        Self { index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Device memory in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Current clocks in MHz.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockInfo {
    pub sm: u32,
    pub mem: u32,
}

/// Utilization percentages over the driver's last sample period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Utilization {
    pub gpu: u32,
    pub memory: u32,
}

/// Volatile ECC error counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EccErrors {
    pub single_bit: u64,
    pub double_bit: u64,
}

/// A compute process running on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: u32,
    /// Device memory held by the process, in bytes.
    pub used_memory: u64,
}

/// Opaque id of a utilization-sample slot allocated by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpmSampleId(pub u64);
