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

//! One-time device enumeration and dual-die board pairing.

use std::collections::{BTreeMap, HashMap};

use tracing::{error, info, warn};

use crate::device::traits::{DeviceTelemetryProvider, ProviderError};
use crate::device::types::{DeviceHandle, DeviceInfo};
use crate::error::{Error, Result};

/// Pairing state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState<'a> {
    /// Single-die board, or the board position is not reported.
    SelfPaired,
    /// The other die on the same physical board.
    Paired(&'a str),
    /// Reports a board position but no partner was found.
    Unknown,
}

/// UUID to co-package partner UUID. Self-paired devices map to themselves;
/// devices with an unknown pairing are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePairing {
    pairs: HashMap<String, String>,
}

impl DevicePairing {
    pub fn get(&self, uuid: &str) -> Option<&str> {
        self.pairs.get(uuid).map(String::as_str)
    }

    pub fn partner(&self, uuid: &str) -> PairState<'_> {
        match self.pairs.get_key_value(uuid) {
            Some((key, partner)) if key == partner => PairState::SelfPaired,
            Some((_, partner)) => PairState::Paired(partner.as_str()),
            None => PairState::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn insert_self(&mut self, uuid: &str) {
        self.pairs.insert(uuid.to_string(), uuid.to_string());
    }

    fn insert_pair(&mut self, a: &str, b: &str) {
        self.pairs.insert(a.to_string(), b.to_string());
        self.pairs.insert(b.to_string(), a.to_string());
    }
}

/// Result of topology discovery. Immutable for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Devices keyed by UUID.
    pub devices: BTreeMap<String, DeviceInfo>,
    pub pairs: DevicePairing,
    pub driver_version: String,
    pub cuda_version: String,
}

impl Topology {
    /// Devices sorted by enumeration index.
    pub fn devices_by_index(&self) -> Vec<&DeviceInfo> {
        let mut devices: Vec<&DeviceInfo> = self.devices.values().collect();
        devices.sort_by_key(|d| d.index);
        devices
    }
}

struct Candidate {
    uuid: String,
    handle: DeviceHandle,
}

/// Enumerate devices and build the pairing map.
///
/// Devices whose identity cannot be read are skipped. Returns
/// [`Error::NoDevicesFound`] when nothing usable was enumerated.
pub fn discover(provider: &dyn DeviceTelemetryProvider) -> Result<Topology> {
    let count = provider
        .device_count()
        .map_err(|e| Error::ProviderInit(format!("failed to enumerate devices: {e}")))?;

    let mut topology = Topology {
        driver_version: provider.driver_version().unwrap_or_else(|e| {
            warn!("Failed to read driver version: {e}");
            String::new()
        }),
        cuda_version: provider.cuda_version().unwrap_or_else(|e| {
            warn!("Failed to read runtime version: {e}");
            String::new()
        }),
        ..Default::default()
    };

    let mut candidates = Vec::new();
    for index in 0..count {
        let handle = match provider.device_by_index(index) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to get device {index}: {e}");
                continue;
            }
        };
        let uuid = match provider.uuid(&handle) {
            Ok(uuid) => uuid,
            Err(e) => {
                error!("Failed to get uuid of device {index}: {e}");
                continue;
            }
        };
        let name = provider.name(&handle).unwrap_or_else(|e| {
            warn!("Failed to get name of device {index}: {e}");
            String::new()
        });

        match provider.board_position(&handle) {
            Err(ProviderError::NotSupported) => topology.pairs.insert_self(&uuid),
            Ok(_) => candidates.push(Candidate {
                uuid: uuid.clone(),
                handle,
            }),
            Err(e) => warn!("Failed to get board position of device {index}: {e}"),
        }

        topology.devices.insert(uuid.clone(), DeviceInfo { uuid, name, index });
    }

    if topology.devices.is_empty() {
        return Err(Error::NoDevicesFound);
    }

    pair_candidates(provider, &candidates, &mut topology.pairs);

    info!(
        "Discovered {} device(s), {} with known pairing, driver {} runtime {}",
        topology.devices.len(),
        topology.pairs.len(),
        topology.driver_version,
        topology.cuda_version
    );
    Ok(topology)
}

fn pair_candidates(
    provider: &dyn DeviceTelemetryProvider,
    candidates: &[Candidate],
    pairs: &mut DevicePairing,
) {
    let mut resolved = vec![false; candidates.len()];
    for i in 0..candidates.len() {
        if resolved[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if resolved[j] {
                continue;
            }
            match provider.on_same_board(&candidates[i].handle, &candidates[j].handle) {
                Ok(true) => {
                    pairs.insert_pair(&candidates[i].uuid, &candidates[j].uuid);
                    resolved[i] = true;
                    resolved[j] = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "Failed to compare boards of {} and {}: {e}",
                    candidates[i].uuid, candidates[j].uuid
                ),
            }
        }
        if !resolved[i] {
            warn!(
                "Device {} reports a board position but has no partner",
                candidates[i].uuid
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, MockQuery, MockTelemetryProvider};

    fn dual_die_host() -> MockTelemetryProvider {
        MockTelemetryProvider::new(vec![
            MockDevice::new("GPU-0", "BI-V150").board_position(0),
            MockDevice::new("GPU-1", "BI-V150").board_position(1),
            MockDevice::new("GPU-2", "MR-V100"),
            MockDevice::new("GPU-3", "BI-V150").board_position(0),
            MockDevice::new("GPU-4", "BI-V150").board_position(1),
        ])
        .with_same_board(0, 1)
        .with_same_board(3, 4)
    }

    #[test]
    fn test_pairs_are_symmetric() {
        let topology = discover(&dual_die_host()).unwrap();
        assert_eq!(topology.devices.len(), 5);
        assert_eq!(topology.pairs.partner("GPU-0"), PairState::Paired("GPU-1"));
        assert_eq!(topology.pairs.partner("GPU-1"), PairState::Paired("GPU-0"));
        assert_eq!(topology.pairs.partner("GPU-2"), PairState::SelfPaired);
        assert_eq!(topology.pairs.partner("GPU-4"), PairState::Paired("GPU-3"));
        for (uuid, partner) in topology.pairs.iter() {
            assert_eq!(topology.pairs.get(partner), Some(uuid));
        }
    }

    #[test]
    fn test_unmatched_candidate_is_unknown() {
        let provider = MockTelemetryProvider::new(vec![
            MockDevice::new("GPU-0", "BI-V150").board_position(0),
            MockDevice::new("GPU-1", "MR-V100"),
        ]);
        let topology = discover(&provider).unwrap();
        assert_eq!(topology.pairs.partner("GPU-0"), PairState::Unknown);
        assert_eq!(topology.pairs.get("GPU-0"), None);
        assert!(topology.devices.contains_key("GPU-0"));
    }

    #[test]
    fn test_first_match_wins() {
        // Three dies claim one board: the third stays unresolved.
        let provider = MockTelemetryProvider::new(vec![
            MockDevice::new("GPU-0", "BI-V150").board_position(0),
            MockDevice::new("GPU-1", "BI-V150").board_position(1),
            MockDevice::new("GPU-2", "BI-V150").board_position(2),
        ])
        .with_same_board(0, 1)
        .with_same_board(0, 2)
        .with_same_board(1, 2);
        let topology = discover(&provider).unwrap();
        assert_eq!(topology.pairs.partner("GPU-0"), PairState::Paired("GPU-1"));
        assert_eq!(topology.pairs.partner("GPU-2"), PairState::Unknown);
    }

    #[test]
    fn test_uuid_failure_skips_device() {
        let provider = MockTelemetryProvider::new(vec![
            MockDevice::new("GPU-0", "MR-V100"),
            MockDevice::new("GPU-1", "MR-V100"),
        ])
        .with_failure(0, MockQuery::Uuid, ProviderError::Library("bad read".into()));
        let topology = discover(&provider).unwrap();
        assert_eq!(topology.devices.len(), 1);
        assert_eq!(topology.devices["GPU-1"].index, 1);
    }

    #[test]
    fn test_board_position_error_leaves_pairing_unknown() {
        let provider = MockTelemetryProvider::new(vec![MockDevice::new("GPU-0", "MR-V100")])
            .with_failure(
                0,
                MockQuery::BoardPosition,
                ProviderError::Library("bus error".into()),
            );
        let topology = discover(&provider).unwrap();
        assert!(topology.devices.contains_key("GPU-0"));
        assert!(topology.pairs.is_empty());
    }

    #[test]
    fn test_same_board_error_continues_scan() {
        let provider = MockTelemetryProvider::new(vec![
            MockDevice::new("GPU-0", "BI-V150").board_position(0),
            MockDevice::new("GPU-1", "BI-V150").board_position(1),
            MockDevice::new("GPU-2", "BI-V150").board_position(0),
        ])
        .with_same_board(1, 2)
        .with_failure(0, MockQuery::SameBoard, ProviderError::Library("io".into()));
        let topology = discover(&provider).unwrap();
        assert_eq!(topology.pairs.partner("GPU-1"), PairState::Paired("GPU-2"));
        assert_eq!(topology.pairs.partner("GPU-0"), PairState::Unknown);
    }

    #[test]
    fn test_zero_devices_is_an_error() {
        let provider = MockTelemetryProvider::new(Vec::new());
        assert!(matches!(discover(&provider), Err(Error::NoDevicesFound)));
    }

    #[test]
    fn test_devices_by_index_order() {
        let topology = discover(&dual_die_host()).unwrap();
        let indices: Vec<u32> = topology.devices_by_index().iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }
}
