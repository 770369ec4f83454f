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

pub mod barrier;
pub mod context;
pub mod exporter;
pub mod gpu;
pub mod kubernetes;
pub mod metric;

use async_trait::async_trait;

pub use context::{Scrape, ScrapeContext};
pub use exporter::GpuExporter;
pub use gpu::DeviceSampler;
pub use kubernetes::WorkloadSampler;
pub use metric::{
    Contribution, DeviceMetrics, LabelOverlay, LabelSet, MetricDescriptor, MetricRecord,
    ScrapeSnapshot,
};

/// A background producer woken once per scrape round.
///
/// `collect` must absorb its own failures: whatever it returns is published
/// for the round, and an empty contribution is a valid answer.
#[async_trait]
pub trait SubCollector: Send {
    fn name(&self) -> &str;

    async fn collect(&mut self) -> Contribution;

    /// Release held resources. Called once when the task exits.
    async fn shutdown(&mut self) {}
}
