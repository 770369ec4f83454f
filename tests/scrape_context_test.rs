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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use ix_exporter::collector::metric::{
    label_schema, Contribution, DeviceMetrics, LabelOverlay, LabelSet, MetricRecord,
};
use ix_exporter::collector::{DeviceSampler, ScrapeContext, SubCollector};
use ix_exporter::common::config::MetricConfig;
use ix_exporter::device::process_utils::ProcessNameResolver;
use ix_exporter::device::{discover, MockDevice, MockQuery, MockTelemetryProvider};

fn base(uuid: &str) -> LabelSet {
    [("gpu", "0"), ("name", "BI-V150"), ("uuid", uuid)]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Publishes one temperature record whose value is the call count.
struct Counting {
    uuid: &'static str,
    calls: Arc<AtomicUsize>,
    /// Delay applied to the first call only.
    first_delay: Duration,
}

#[async_trait]
impl SubCollector for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    async fn collect(&mut self) -> Contribution {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 && !self.first_delay.is_zero() {
            tokio::time::sleep(self.first_delay).await;
        }
        let mut metrics = DeviceMetrics::new();
        metrics.insert(
            self.uuid.to_string(),
            vec![MetricRecord::new("ix_temperature", call as f64, base(self.uuid))],
        );
        Contribution::Metrics(metrics)
    }
}

/// Never finishes a poll.
struct Hung;

#[async_trait]
impl SubCollector for Hung {
    fn name(&self) -> &str {
        "hung"
    }

    async fn collect(&mut self) -> Contribution {
        std::future::pending::<()>().await;
        Contribution::Labels(LabelOverlay::new())
    }
}

struct Pods;

#[async_trait]
impl SubCollector for Pods {
    fn name(&self) -> &str {
        "pods"
    }

    async fn collect(&mut self) -> Contribution {
        let mut set = LabelSet::new();
        set.insert("pod".to_string(), "trainer".to_string());
        set.insert("namespace".to_string(), "ml".to_string());
        let mut overlay = LabelOverlay::new();
        overlay.insert("GPU-0".to_string(), set);
        Contribution::Labels(overlay)
    }
}

fn counting(uuid: &'static str, first_delay: Duration) -> (Box<Counting>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let collector = Box::new(Counting {
        uuid,
        calls: Arc::clone(&calls),
        first_delay,
    });
    (collector, calls)
}

#[tokio::test]
async fn test_no_collectors_returns_empty_snapshot() {
    let context = ScrapeContext::new(label_schema(false), Duration::from_secs(1));
    let scrape = context.snapshot().await;
    assert!(scrape.complete);
    assert!(scrape.snapshot.is_empty());
}

#[tokio::test]
async fn test_each_snapshot_polls_every_collector_once() {
    let context = ScrapeContext::new(label_schema(false), Duration::from_secs(5));
    let (collector, calls) = counting("GPU-0", Duration::ZERO);
    context.register(collector).await;

    for expected in 1..=3 {
        let scrape = context.snapshot().await;
        assert!(scrape.complete);
        let record = scrape.snapshot.records_named("ix_temperature").next().unwrap();
        assert_eq!(record.value, expected as f64);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    context.shutdown().await;
}

#[tokio::test]
async fn test_hung_collector_times_out_with_partial_data() {
    let timeout = Duration::from_millis(200);
    let context = ScrapeContext::new(label_schema(false), timeout)
        .with_grace(Duration::from_millis(200));
    let (collector, _) = counting("GPU-0", Duration::ZERO);
    context.register(collector).await;
    context.register(Box::new(Hung)).await;

    // Later rounds must time out the same way rather than deadlock.
    for _ in 0..2 {
        let started = Instant::now();
        let scrape = context.snapshot().await;
        assert!(started.elapsed() < timeout * 5);
        assert!(!scrape.complete);
        assert_eq!(scrape.missing, vec!["hung".to_string()]);
        assert_eq!(scrape.snapshot.records_named("ix_temperature").count(), 1);
    }

    tokio::time::timeout(Duration::from_secs(5), context.shutdown())
        .await
        .expect("shutdown must not hang");
    assert_eq!(context.live_tasks().await, 0);
}

#[tokio::test]
async fn test_late_contribution_does_not_leak_into_next_round() {
    let context = ScrapeContext::new(label_schema(false), Duration::from_millis(100));
    let (collector, _) = counting("GPU-0", Duration::from_millis(400));
    context.register(collector).await;

    let first = context.snapshot().await;
    assert!(!first.complete);
    assert!(first.snapshot.is_empty());

    // The first poll is still sleeping when this round starts; give the
    // collector time to finish it and answer the new round.
    let scrape = {
        let mut result = None;
        for _ in 0..10 {
            let scrape = context.snapshot().await;
            if scrape.complete {
                result = Some(scrape);
                break;
            }
        }
        result.expect("collector should catch up")
    };
    let values: Vec<f64> = scrape
        .snapshot
        .records_named("ix_temperature")
        .map(|r| r.value)
        .collect();
    assert_eq!(values.len(), 1);
    assert!(values[0] >= 2.0, "stale round-1 value leaked: {values:?}");
    context.shutdown().await;
}

#[tokio::test]
async fn test_overlay_is_merged_into_matching_device() {
    let context = ScrapeContext::new(label_schema(true), Duration::from_secs(5));
    let (gpu0, _) = counting("GPU-0", Duration::ZERO);
    let (gpu1, _) = counting("GPU-1", Duration::ZERO);
    context.register(gpu0).await;
    context.register(gpu1).await;
    context.register(Box::new(Pods)).await;

    let scrape = context.snapshot().await;
    assert!(scrape.complete);

    let labelled = &scrape.snapshot.device("GPU-0").unwrap()[0];
    assert_eq!(labelled.label("pod"), Some("trainer"));
    assert_eq!(labelled.label("namespace"), Some("ml"));
    assert_eq!(labelled.label("container"), Some(""));

    let plain = &scrape.snapshot.device("GPU-1").unwrap()[0];
    for key in ["namespace", "pod", "container", "node_name"] {
        assert_eq!(plain.label(key), Some(""));
    }
    context.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_all_tasks() {
    let context = ScrapeContext::new(label_schema(false), Duration::from_secs(1));
    let (collector, _) = counting("GPU-0", Duration::ZERO);
    context.register(collector).await;
    context.register(Box::new(Hung)).await;
    assert_eq!(context.live_tasks().await, 2);

    context.shutdown().await;
    assert_eq!(context.live_tasks().await, 0);
    assert!(context.is_cancelled());

    let scrape = context.snapshot().await;
    assert!(scrape.snapshot.is_empty());
}

#[tokio::test]
async fn test_shutdown_ends_in_flight_snapshot() {
    let context = Arc::new(ScrapeContext::new(label_schema(false), Duration::from_secs(20)));
    let (collector, _) = counting("GPU-0", Duration::ZERO);
    context.register(collector).await;
    context.register(Box::new(Hung)).await;

    let pending = tokio::spawn({
        let context = Arc::clone(&context);
        async move { context.snapshot().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    context.shutdown().await;
    let scrape = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("snapshot must end with the context")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!scrape.complete);
    assert_eq!(context.live_tasks().await, 0);
}

/// A device read that blocks its thread must not hold up the round timer or
/// shutdown, even on a single-threaded runtime.
#[tokio::test]
async fn test_stalled_device_read_respects_timeout() {
    let provider = Arc::new(
        MockTelemetryProvider::new(vec![
            MockDevice::new("GPU-0", "MR-V100"),
            MockDevice::new("GPU-1", "MR-V100"),
        ])
        .with_stall(0, MockQuery::Temperature, Duration::from_secs(2)),
    );
    let topology = Arc::new(discover(provider.as_ref()).unwrap());
    let sampler = DeviceSampler::new(
        provider,
        topology,
        vec![MetricConfig {
            name: "ix_temperature".to_string(),
            help: "Temperature".to_string(),
        }],
    )
    .with_process_resolver(ProcessNameResolver::with_root("/nonexistent"));

    let timeout = Duration::from_millis(200);
    let context = ScrapeContext::new(label_schema(false), timeout)
        .with_grace(Duration::from_millis(200));
    context.register(Box::new(sampler)).await;

    let started = Instant::now();
    let scrape = context.snapshot().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!scrape.complete);
    assert_eq!(scrape.missing, vec!["gpu".to_string()]);

    let started = Instant::now();
    context.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(context.live_tasks().await, 0);
}
