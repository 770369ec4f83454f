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

//! The exporter as seen by the publication layer.
//!
//! `describe` follows the register/unregister contract of a metrics registry:
//! the first call activates the exporter (context created, sub-collectors
//! running, descriptors built) and the next call tears all of it down again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::collector::context::{Scrape, ScrapeContext};
use crate::collector::gpu::DeviceSampler;
use crate::collector::kubernetes::WorkloadSampler;
use crate::collector::metric::{descriptor_for, label_schema, MetricDescriptor};
use crate::common::config::{AppConfig, KubeOptions, MetricConfig};
use crate::device::topology::Topology;
use crate::device::traits::DeviceTelemetryProvider;
use crate::kubelet::{KubeletClient, WorkloadResourceProvider};

/// Builds a fresh workload provider each time the exporter activates.
pub type WorkloadProviderFactory =
    Arc<dyn Fn() -> Box<dyn WorkloadResourceProvider> + Send + Sync>;

/// Result of a collect call: descriptors plus the merged scrape.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub descriptors: Vec<MetricDescriptor>,
    pub scrape: Scrape,
}

#[derive(Default)]
struct State {
    context: Option<Arc<ScrapeContext>>,
    descriptors: Vec<MetricDescriptor>,
}

pub struct GpuExporter {
    metrics: Vec<MetricConfig>,
    topology: Arc<Topology>,
    provider: Arc<dyn DeviceTelemetryProvider>,
    kube: Option<(KubeOptions, WorkloadProviderFactory)>,
    timeout: Duration,
    sample_interval: Duration,
    state: Mutex<State>,
}

impl GpuExporter {
    pub fn new(
        metrics: Vec<MetricConfig>,
        topology: Arc<Topology>,
        provider: Arc<dyn DeviceTelemetryProvider>,
    ) -> Self {
        Self {
            metrics,
            topology,
            provider,
            kube: None,
            timeout: Duration::from_secs(AppConfig::SCRAPE_TIMEOUT_SECS),
            sample_interval: Duration::from_secs(AppConfig::SM_SAMPLE_INTERVAL_SECS),
            state: Mutex::new(State::default()),
        }
    }

    /// Enable Kubernetes correlation through the kubelet socket.
    pub fn with_kubelet(self, options: KubeOptions) -> Self {
        let socket = options.socket.clone();
        let timeout = options.timeout;
        let factory: WorkloadProviderFactory = Arc::new(move || {
            let client = KubeletClient::new(socket.clone(), timeout);
            Box::new(client) as Box<dyn WorkloadResourceProvider>
        });
        self.with_workload_provider(options, factory)
    }

    /// Enable Kubernetes correlation with a custom workload provider.
    pub fn with_workload_provider(
        mut self,
        options: KubeOptions,
        factory: WorkloadProviderFactory,
    ) -> Self {
        self.kube = Some((options, factory));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn kube_enabled(&self) -> bool {
        self.kube.is_some()
    }

    /// Toggle registration and return the current descriptor table.
    ///
    /// Inactive -> Active returns the descriptors just registered; Active ->
    /// Inactive cancels every sub-collector and returns an empty table.
    pub async fn describe(&self) -> Vec<MetricDescriptor> {
        let mut state = self.state.lock().await;

        if let Some(context) = state.context.take() {
            context.shutdown().await;
            for descriptor in state.descriptors.drain(..) {
                info!("Unregister gpu resource '{}'", descriptor.name);
            }
            return Vec::new();
        }

        let schema = label_schema(self.kube.is_some());
        let context = ScrapeContext::new(schema.clone(), self.timeout);

        let sampler = DeviceSampler::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.topology),
            self.metrics.clone(),
        )
        .with_sample_interval(self.sample_interval);
        context.register(Box::new(sampler)).await;

        if let Some((options, factory)) = &self.kube {
            let sampler =
                WorkloadSampler::new(factory(), Arc::clone(&self.topology), options.clone());
            context.register(Box::new(sampler)).await;
        }

        state.descriptors = self
            .metrics
            .iter()
            .map(|m| {
                info!("Register gpu resource '{}'", m.name);
                descriptor_for(&m.name, &m.help, &schema)
            })
            .collect();
        state.context = Some(Arc::new(context));
        state.descriptors.clone()
    }

    /// Run one scrape round. Empty while inactive.
    ///
    /// The state lock is released before the round starts, so an unregister
    /// arriving mid-round cancels it instead of waiting for it.
    pub async fn collect(&self) -> Collected {
        let (context, descriptors) = {
            let state = self.state.lock().await;
            match &state.context {
                Some(context) => (Arc::clone(context), state.descriptors.clone()),
                None => {
                    return Collected {
                        scrape: Scrape {
                            complete: true,
                            ..Default::default()
                        },
                        ..Default::default()
                    }
                }
            }
        };
        Collected {
            descriptors,
            scrape: context.snapshot().await,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.context.is_some()
    }

    pub async fn descriptors(&self) -> Vec<MetricDescriptor> {
        self.state.lock().await.descriptors.clone()
    }

    /// Background sub-collector tasks currently alive.
    pub async fn live_tasks(&self) -> usize {
        let context = self.state.lock().await.context.clone();
        match context {
            Some(context) => context.live_tasks().await,
            None => 0,
        }
    }
}
