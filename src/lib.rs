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

//! Prometheus exporter for Iluvatar CoreX accelerators.
//!
//! Every scrape wakes the device and workload sub-collectors, waits for all
//! of them to publish (bounded by a timeout) and merges their output into one
//! per-device snapshot.

pub mod api;
pub mod cli;
pub mod collector;
pub mod device;
pub mod error;
pub mod kubelet;
pub mod utils;

// Re-export just the config module from common for library users
pub mod common {
    pub mod config;
}

pub use error::{Error, Result};
