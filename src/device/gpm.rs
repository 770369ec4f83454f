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

//! GPU performance monitoring entry points.
//!
//! `nvml-wrapper` does not wrap the GPM API, so the symbols are resolved from
//! the same management library file with `libloading`.

use std::ffi::{c_char, c_uint, c_void};
use std::ptr;

use libloading::{Library, Symbol};

use crate::device::traits::{ProviderError, ProviderResult};

const SUCCESS: c_uint = 0;
const ERROR_NOT_SUPPORTED: c_uint = 3;
const ERROR_NOT_FOUND: c_uint = 6;

const GPM_SUPPORT_VERSION: c_uint = 1;
const GPM_METRICS_GET_VERSION: c_uint = 1;
const GPM_METRIC_SM_UTIL: c_uint = 2;
const GPM_METRIC_MAX: usize = 98;

type RawDevice = *mut c_void;
type RawSample = *mut c_void;

#[repr(C)]
struct GpmSupport {
    version: c_uint,
    is_supported_device: c_uint,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct GpmMetricInfo {
    short_name: *mut c_char,
    long_name: *mut c_char,
    unit: *mut c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct GpmMetric {
    metric_id: c_uint,
    nvml_return: c_uint,
    value: f64,
    metric_info: GpmMetricInfo,
}

const EMPTY_METRIC: GpmMetric = GpmMetric {
    metric_id: 0,
    nvml_return: 0,
    value: 0.0,
    metric_info: GpmMetricInfo {
        short_name: ptr::null_mut(),
        long_name: ptr::null_mut(),
        unit: ptr::null_mut(),
    },
};

#[repr(C)]
struct GpmMetricsGet {
    version: c_uint,
    num_metrics: c_uint,
    sample1: RawSample,
    sample2: RawSample,
    metrics: [GpmMetric; GPM_METRIC_MAX],
}

type DeviceGetHandleByIndexFn = unsafe extern "C" fn(c_uint, *mut RawDevice) -> c_uint;
type GpmQueryDeviceSupportFn = unsafe extern "C" fn(RawDevice, *mut GpmSupport) -> c_uint;
type GpmSampleAllocFn = unsafe extern "C" fn(*mut RawSample) -> c_uint;
type GpmSampleFreeFn = unsafe extern "C" fn(RawSample) -> c_uint;
type GpmSampleGetFn = unsafe extern "C" fn(RawDevice, RawSample) -> c_uint;
type GpmMetricsGetFn = unsafe extern "C" fn(*mut GpmMetricsGet) -> c_uint;

/// A sample buffer owned by the library.
pub struct RawGpmSample(RawSample);

// SAFETY: the buffer is a plain heap allocation made by the library and is only
// handed back to the library's thread-safe GPM calls.
unsafe impl Send for RawGpmSample {}

/// Resolved GPM symbols. The library stays loaded as long as this value lives.
pub struct GpmApi {
    _library: Library,
    device_by_index: DeviceGetHandleByIndexFn,
    query_support: GpmQueryDeviceSupportFn,
    sample_alloc: GpmSampleAllocFn,
    sample_free: GpmSampleFreeFn,
    sample_get: GpmSampleGetFn,
    metrics_get: GpmMetricsGetFn,
}

impl GpmApi {
    /// Resolve the GPM symbols from the library at `path`.
    ///
    /// Fails when the library predates GPM; callers then report GPM as
    /// unsupported.
    pub fn load(path: &str) -> Result<Self, libloading::Error> {
        // SAFETY: the management library runs no initialisers beyond what
        // nvml-wrapper already triggered by loading the same file.
        let library = unsafe { Library::new(path) }?;

        // SAFETY: the signatures match the C declarations of these symbols.
        let (device_by_index, query_support, sample_alloc, sample_free, sample_get, metrics_get) = unsafe {
            let device_by_index: Symbol<DeviceGetHandleByIndexFn> =
                library.get(b"nvmlDeviceGetHandleByIndex_v2\0")?;
            let query_support: Symbol<GpmQueryDeviceSupportFn> =
                library.get(b"nvmlGpmQueryDeviceSupport\0")?;
            let sample_alloc: Symbol<GpmSampleAllocFn> = library.get(b"nvmlGpmSampleAlloc\0")?;
            let sample_free: Symbol<GpmSampleFreeFn> = library.get(b"nvmlGpmSampleFree\0")?;
            let sample_get: Symbol<GpmSampleGetFn> = library.get(b"nvmlGpmSampleGet\0")?;
            let metrics_get: Symbol<GpmMetricsGetFn> = library.get(b"nvmlGpmMetricsGet\0")?;
            (
                *device_by_index,
                *query_support,
                *sample_alloc,
                *sample_free,
                *sample_get,
                *metrics_get,
            )
        };

        Ok(Self {
            _library: library,
            device_by_index,
            query_support,
            sample_alloc,
            sample_free,
            sample_get,
            metrics_get,
        })
    }

    fn device(&self, index: u32) -> ProviderResult<RawDevice> {
        let mut device: RawDevice = ptr::null_mut();
        // SAFETY: `device` is a valid out-pointer for the duration of the call.
        check(unsafe { (self.device_by_index)(index, &mut device) }, "device handle")?;
        Ok(device)
    }

    pub fn supported(&self, index: u32) -> ProviderResult<bool> {
        let device = self.device(index)?;
        let mut support = GpmSupport {
            version: GPM_SUPPORT_VERSION,
            is_supported_device: 0,
        };
        // SAFETY: `device` came from the library and `support` is versioned.
        check(unsafe { (self.query_support)(device, &mut support) }, "GPM support query")?;
        Ok(support.is_supported_device != 0)
    }

    pub fn alloc(&self) -> ProviderResult<RawGpmSample> {
        let mut sample: RawSample = ptr::null_mut();
        // SAFETY: `sample` is a valid out-pointer; the buffer is released by `free`.
        check(unsafe { (self.sample_alloc)(&mut sample) }, "GPM sample alloc")?;
        Ok(RawGpmSample(sample))
    }

    pub fn free(&self, sample: RawGpmSample) {
        // SAFETY: the sample was allocated by `alloc` and is consumed here.
        let ret = unsafe { (self.sample_free)(sample.0) };
        if ret != SUCCESS {
            tracing::debug!("GPM sample free returned {ret}");
        }
    }

    pub fn capture(&self, index: u32, sample: &RawGpmSample) -> ProviderResult<()> {
        let device = self.device(index)?;
        // SAFETY: both handles came from the library and are still live.
        check(unsafe { (self.sample_get)(device, sample.0) }, "GPM sample get")
    }

    /// SM utilisation in percent between two captured samples.
    pub fn sm_utilization(&self, first: &RawGpmSample, second: &RawGpmSample) -> ProviderResult<f64> {
        let mut request = GpmMetricsGet {
            version: GPM_METRICS_GET_VERSION,
            num_metrics: 1,
            sample1: first.0,
            sample2: second.0,
            metrics: [EMPTY_METRIC; GPM_METRIC_MAX],
        };
        request.metrics[0].metric_id = GPM_METRIC_SM_UTIL;

        // SAFETY: `request` is versioned and both samples are live.
        check(unsafe { (self.metrics_get)(&mut request) }, "GPM metrics get")?;
        let metric = request.metrics[0];
        check(metric.nvml_return, "GPM SM utilization")?;
        Ok(metric.value)
    }
}

fn check(ret: c_uint, what: &str) -> ProviderResult<()> {
    match ret {
        SUCCESS => Ok(()),
        ERROR_NOT_SUPPORTED => Err(ProviderError::NotSupported),
        ERROR_NOT_FOUND => Err(ProviderError::NotFound(what.to_string())),
        code => Err(ProviderError::Library(format!("{what} failed with code {code}"))),
    }
}
