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

//! Pod/container labels for devices assigned by the kubelet.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::collector::metric::{labels, Contribution, LabelOverlay, LabelSet};
use crate::collector::SubCollector;
use crate::common::config::{AppConfig, KubeOptions};
use crate::device::topology::{DevicePairing, PairState, Topology};
use crate::kubelet::{strip_replica_suffix, PodResources, WorkloadResourceProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connection {
    Pending,
    Connected,
    /// Connecting failed; the sampler contributes empty overlays.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Claimant<'a> {
    pod: &'a str,
    namespace: &'a str,
    container: &'a str,
}

pub struct WorkloadSampler {
    provider: Box<dyn WorkloadResourceProvider>,
    topology: Arc<Topology>,
    options: KubeOptions,
    connection: Connection,
}

impl WorkloadSampler {
    pub fn new(
        provider: Box<dyn WorkloadResourceProvider>,
        topology: Arc<Topology>,
        options: KubeOptions,
    ) -> Self {
        Self {
            provider,
            topology,
            options,
            connection: Connection::Pending,
        }
    }

    async fn ensure_connected(&mut self) -> bool {
        if self.connection == Connection::Pending {
            self.connection = match self.provider.connect().await {
                Ok(()) => Connection::Connected,
                Err(e) => {
                    error!("Kubernetes correlation disabled: {e}");
                    Connection::Unavailable
                }
            };
        }
        self.connection == Connection::Connected
    }
}

#[async_trait]
impl SubCollector for WorkloadSampler {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn collect(&mut self) -> Contribution {
        if !self.ensure_connected().await {
            return Contribution::Labels(LabelOverlay::new());
        }

        let pods = match self.provider.list_pod_resources().await {
            Ok(pods) => pods,
            Err(e) => {
                error!("Failed to list pod resources: {e}");
                return Contribution::Labels(LabelOverlay::new());
            }
        };

        let split_board = self.options.split_board.resolve();
        debug!("Split-board correlation: {split_board}");
        Contribution::Labels(correlate(
            &pods,
            &self.topology.pairs,
            &self.options.resource_name,
            split_board,
            &self.options.node_name,
        ))
    }

    async fn shutdown(&mut self) {
        if self.connection == Connection::Connected {
            self.provider.disconnect().await;
        }
        info!("Workload sampler stopped");
    }
}

/// Build the per-device workload labels from a pod-resources listing.
///
/// Without split-board correlation a die's assignment also labels its board
/// partner. Several claimants of one device are joined in discovery order.
pub fn correlate(
    pods: &[PodResources],
    pairs: &DevicePairing,
    resource_name: &str,
    split_board: bool,
    node_name: &str,
) -> LabelOverlay {
    let mut claims: BTreeMap<String, Vec<Claimant<'_>>> = BTreeMap::new();

    for pod in pods {
        for container in &pod.containers {
            for device in container
                .devices
                .iter()
                .filter(|d| d.resource_name == resource_name)
            {
                let claimant = Claimant {
                    pod: &pod.name,
                    namespace: &pod.namespace,
                    container: &container.name,
                };
                for id in &device.device_ids {
                    let uuid = strip_replica_suffix(id);
                    let mut targets = vec![uuid];
                    if !split_board {
                        if let PairState::Paired(partner) = pairs.partner(uuid) {
                            targets.push(partner);
                        }
                    }
                    for target in targets {
                        let list = claims.entry(target.to_string()).or_default();
                        if !list.contains(&claimant) {
                            list.push(claimant.clone());
                        }
                    }
                }
            }
        }
    }

    claims
        .into_iter()
        .map(|(uuid, claimants)| {
            let mut set = LabelSet::new();
            set.insert(labels::NAMESPACE.to_string(), joined(&claimants, |c| c.namespace));
            set.insert(labels::POD.to_string(), joined(&claimants, |c| c.pod));
            set.insert(labels::CONTAINER.to_string(), joined(&claimants, |c| c.container));
            set.insert(labels::NODE_NAME.to_string(), node_name.to_string());
            (uuid, set)
        })
        .collect()
}

fn joined<'a>(claimants: &[Claimant<'a>], field: impl Fn(&Claimant<'a>) -> &'a str) -> String {
    claimants
        .iter()
        .map(field)
        .collect::<Vec<_>>()
        .join(AppConfig::CLAIMANT_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::SplitBoardSetting;
    use crate::device::mock::{MockDevice, MockTelemetryProvider};
    use crate::device::topology::discover;
    use crate::error::{Error, Result};
    use crate::kubelet::{ContainerDevices, ContainerResources};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RESOURCE: &str = "iluvatar.com/gpu";

    fn topology() -> Topology {
        let provider = MockTelemetryProvider::new(vec![
            MockDevice::new("GPU-0", "BI-V150").board_position(0),
            MockDevice::new("GPU-1", "BI-V150").board_position(1),
            MockDevice::new("GPU-2", "MR-V100"),
        ])
        .with_same_board(0, 1);
        discover(&provider).unwrap()
    }

    fn pod(name: &str, namespace: &str, container: &str, ids: &[&str]) -> PodResources {
        PodResources {
            name: name.to_string(),
            namespace: namespace.to_string(),
            containers: vec![ContainerResources {
                name: container.to_string(),
                devices: vec![ContainerDevices {
                    resource_name: RESOURCE.to_string(),
                    device_ids: ids.iter().map(|s| s.to_string()).collect(),
                }],
            }],
        }
    }

    #[test]
    fn test_paired_die_labels_both_without_split_board() {
        let topology = topology();
        let pods = vec![pod("trainer", "ml", "main", &["GPU-0"])];
        let overlay = correlate(&pods, &topology.pairs, RESOURCE, false, "node-a");
        assert_eq!(overlay.len(), 2);
        assert_eq!(overlay["GPU-0"], overlay["GPU-1"]);
        assert_eq!(overlay["GPU-1"]["pod"], "trainer");
        assert_eq!(overlay["GPU-1"]["node_name"], "node-a");
    }

    #[test]
    fn test_split_board_labels_only_assigned_die() {
        let topology = topology();
        let pods = vec![pod("trainer", "ml", "main", &["GPU-0"])];
        let overlay = correlate(&pods, &topology.pairs, RESOURCE, true, "node-a");
        assert_eq!(overlay.len(), 1);
        assert!(overlay.contains_key("GPU-0"));
    }

    #[test]
    fn test_claimants_are_joined_in_order() {
        let topology = topology();
        let pods = vec![
            pod("a", "ns1", "c1", &["GPU-2::0"]),
            pod("b", "ns2", "c2", &["GPU-2::1"]),
        ];
        let overlay = correlate(&pods, &topology.pairs, RESOURCE, false, "");
        assert_eq!(overlay["GPU-2"]["pod"], "a;b");
        assert_eq!(overlay["GPU-2"]["namespace"], "ns1;ns2");
        assert_eq!(overlay["GPU-2"]["container"], "c1;c2");
    }

    #[test]
    fn test_whole_board_assignment_is_not_duplicated() {
        let topology = topology();
        let pods = vec![pod("trainer", "ml", "main", &["GPU-0", "GPU-1"])];
        let overlay = correlate(&pods, &topology.pairs, RESOURCE, false, "");
        assert_eq!(overlay["GPU-0"]["pod"], "trainer");
        assert_eq!(overlay["GPU-1"]["pod"], "trainer");
    }

    #[test]
    fn test_other_resources_are_ignored() {
        let topology = topology();
        let mut other = pod("x", "ns", "c", &["GPU-2"]);
        other.containers[0].devices[0].resource_name = "nvidia.com/gpu".to_string();
        let overlay = correlate(&[other], &topology.pairs, RESOURCE, false, "");
        assert!(overlay.is_empty());
    }

    struct Scripted {
        connect_ok: bool,
        lists: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkloadResourceProvider for Scripted {
        async fn connect(&mut self) -> Result<()> {
            if self.connect_ok {
                Ok(())
            } else {
                Err(Error::WorkloadUnavailable("no socket".to_string()))
            }
        }

        async fn list_pod_resources(&mut self) -> Result<Vec<PodResources>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(vec![pod("trainer", "ml", "main", &["GPU-2"])])
        }
    }

    fn options() -> KubeOptions {
        KubeOptions {
            node_name: "node-a".to_string(),
            split_board: SplitBoardSetting::fixed(false),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unavailable_provider_contributes_empty_overlay() {
        let lists = Arc::new(AtomicUsize::new(0));
        let mut sampler = WorkloadSampler::new(
            Box::new(Scripted {
                connect_ok: false,
                lists: lists.clone(),
            }),
            Arc::new(topology()),
            options(),
        );
        for _ in 0..2 {
            assert_eq!(
                sampler.collect().await,
                Contribution::Labels(LabelOverlay::new())
            );
        }
        assert_eq!(lists.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connected_provider_is_listed_each_cycle() {
        let lists = Arc::new(AtomicUsize::new(0));
        let mut sampler = WorkloadSampler::new(
            Box::new(Scripted {
                connect_ok: true,
                lists: lists.clone(),
            }),
            Arc::new(topology()),
            options(),
        );
        for _ in 0..3 {
            match sampler.collect().await {
                Contribution::Labels(overlay) => assert_eq!(overlay["GPU-2"]["pod"], "trainer"),
                other => panic!("unexpected contribution {other:?}"),
            }
        }
        assert_eq!(lists.load(Ordering::SeqCst), 3);
    }
}
