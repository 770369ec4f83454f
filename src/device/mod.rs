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

pub mod gpm;
pub mod ixml;
pub mod mock;
pub mod process_utils;
pub mod topology;
pub mod traits;
pub mod types;

pub use ixml::IxmlProvider;
pub use mock::{MockDevice, MockQuery, MockTelemetryProvider};
pub use topology::{discover, DevicePairing, PairState, Topology};
pub use traits::{DeviceTelemetryProvider, ProviderError, ProviderResult};
pub use types::*;
