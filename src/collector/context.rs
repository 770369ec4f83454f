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

//! Scrape rounds over a set of background sub-collectors.
//!
//! A snapshot starts a round: the shared state is cleared, a fresh round is
//! broadcast on the wake channel and every registered sub-collector polls once
//! and publishes its contribution. The snapshot waits on the round's join
//! counter (or the timeout) and then merges label overlays into the metric
//! records.
//!
//! Each round carries its own id and counter. A contribution that arrives for
//! a round other than the current one is dropped, so a collector that was
//! still busy with an old round can never leak stale data into a newer
//! snapshot.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collector::barrier::JoinCounter;
use crate::collector::metric::{Contribution, DeviceMetrics, LabelOverlay, ScrapeSnapshot};
use crate::collector::SubCollector;
use crate::common::config::AppConfig;

/// One broadcast wake.
#[derive(Debug)]
pub struct Round {
    id: u64,
    barrier: JoinCounter,
}

impl Round {
    fn new(id: u64, participants: usize) -> Self {
        Self {
            id,
            barrier: JoinCounter::new(participants),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Outcome of one snapshot call.
#[derive(Debug, Clone, Default)]
pub struct Scrape {
    pub snapshot: ScrapeSnapshot,
    /// False when the round timed out or was cancelled.
    pub complete: bool,
    /// Sub-collectors that had not reported when the round ended.
    pub missing: Vec<String>,
    pub elapsed: Duration,
}

struct Registration {
    name: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    round: u64,
    metrics: DeviceMetrics,
    overlay: LabelOverlay,
    reported: HashSet<usize>,
    registry: Vec<Registration>,
}

type WakeSender = watch::Sender<Option<Arc<Round>>>;
type WakeReceiver = watch::Receiver<Option<Arc<Round>>>;

/// Registry of sub-collectors plus the wake/join protocol between them and
/// the scrape handler.
pub struct ScrapeContext {
    shared: Arc<Mutex<Shared>>,
    wake: WakeSender,
    cancel: watch::Sender<bool>,
    /// Serialises snapshot calls so rounds never overlap.
    scrape: Mutex<()>,
    schema: Vec<String>,
    timeout: Duration,
    grace: Duration,
}

impl ScrapeContext {
    /// `schema` lists the label keys every record must carry.
    pub fn new(schema: Vec<String>, timeout: Duration) -> Self {
        let (wake, _) = watch::channel(None);
        let (cancel, _) = watch::channel(false);
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            wake,
            cancel,
            scrape: Mutex::new(()),
            schema,
            timeout,
            grace: Duration::from_secs(AppConfig::SHUTDOWN_GRACE_SECS),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn schema(&self) -> &[String] {
        &self.schema
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Add a sub-collector and start its background task.
    ///
    /// A collector registered while a round is in flight joins from the next
    /// round on.
    pub async fn register(&self, collector: Box<dyn SubCollector>) {
        let mut state = self.shared.lock().await;
        if self.is_cancelled() {
            warn!(
                "Refusing to register '{}' on a cancelled context",
                collector.name()
            );
            return;
        }

        let slot = state.registry.len();
        let name = collector.name().to_string();
        let task = CollectorTask {
            slot,
            collector,
            shared: Arc::clone(&self.shared),
            wake: self.wake.subscribe(),
            cancel: self.cancel.subscribe(),
        };
        let handle = tokio::spawn(task.run());
        info!("Registered sub-collector '{name}'");
        state.registry.push(Registration { name, handle });
    }

    /// Number of registered sub-collectors whose task is still running.
    pub async fn live_tasks(&self) -> usize {
        let state = self.shared.lock().await;
        state
            .registry
            .iter()
            .filter(|r| !r.handle.is_finished())
            .count()
    }

    /// Poll every sub-collector once and return the merged result.
    ///
    /// Returns within the configured timeout. On timeout or cancellation the
    /// records published so far are merged and returned with
    /// `complete == false`.
    pub async fn snapshot(&self) -> Scrape {
        let _serial = self.scrape.lock().await;
        let started = Instant::now();

        let round = {
            let mut state = self.shared.lock().await;
            if state.registry.is_empty() || self.is_cancelled() {
                return Scrape {
                    complete: true,
                    ..Default::default()
                };
            }
            state.round += 1;
            state.metrics.clear();
            state.overlay.clear();
            state.reported.clear();
            let round = Arc::new(Round::new(state.round, state.registry.len()));
            // Sent under the lock: a collector registering now either sees
            // this round counted or subscribes after it.
            self.wake.send_replace(Some(Arc::clone(&round)));
            debug!(
                "Round {} started for {} sub-collector(s)",
                round.id,
                state.registry.len()
            );
            round
        };

        let mut cancel = self.cancel.subscribe();
        let complete = tokio::select! {
            _ = round.barrier.wait() => true,
            _ = tokio::time::sleep(self.timeout) => {
                error!("Collect metrics timeout after {:?}", self.timeout);
                false
            }
            _ = cancel.wait_for(|cancelled| *cancelled) => {
                warn!("Round {} cancelled", round.id);
                false
            }
        };

        let state = self.shared.lock().await;
        let missing = if complete {
            Vec::new()
        } else {
            state
                .registry
                .iter()
                .enumerate()
                .filter(|(slot, _)| !state.reported.contains(slot))
                .map(|(_, r)| r.name.clone())
                .collect()
        };
        let snapshot = merge(&state.metrics, &state.overlay, &self.schema);
        let elapsed = started.elapsed();
        info!("Collect metrics took {elapsed:?}");

        Scrape {
            snapshot,
            complete,
            missing,
            elapsed,
        }
    }

    /// Cancel every sub-collector and wait for their tasks to exit.
    ///
    /// Tasks that do not stop within the grace period are aborted.
    pub async fn shutdown(&self) {
        self.cancel.send_replace(true);

        let registry = {
            let mut state = self.shared.lock().await;
            state.metrics.clear();
            state.overlay.clear();
            state.reported.clear();
            std::mem::take(&mut state.registry)
        };

        for Registration { name, mut handle } in registry {
            match tokio::time::timeout(self.grace, &mut handle).await {
                Ok(Ok(())) => info!("Unregistered sub-collector '{name}'"),
                Ok(Err(e)) => warn!("Sub-collector '{name}' ended abnormally: {e}"),
                Err(_) => {
                    warn!("Sub-collector '{name}' did not stop in {:?}, aborting", self.grace);
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
    }
}

impl Drop for ScrapeContext {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

/// Apply each device's overlay to its records and back-fill schema labels.
pub fn merge(
    metrics: &DeviceMetrics,
    overlay: &LabelOverlay,
    schema: &[String],
) -> ScrapeSnapshot {
    let devices = metrics
        .iter()
        .map(|(uuid, records)| {
            let workload = overlay.get(uuid);
            let merged = records
                .iter()
                .map(|record| {
                    let mut record = record.clone();
                    if let Some(labels) = workload {
                        for (key, value) in labels {
                            record.labels.insert(key.clone(), value.clone());
                        }
                    }
                    for key in schema {
                        record.labels.entry(key.clone()).or_default();
                    }
                    record
                })
                .collect();
            (uuid.clone(), merged)
        })
        .collect();
    ScrapeSnapshot { devices }
}

struct CollectorTask {
    slot: usize,
    collector: Box<dyn SubCollector>,
    shared: Arc<Mutex<Shared>>,
    wake: WakeReceiver,
    cancel: watch::Receiver<bool>,
}

impl CollectorTask {
    async fn run(mut self) {
        let name = self.collector.name().to_string();
        loop {
            if *self.cancel.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.changed() => break,
                changed = self.wake.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let Some(round) = self.wake.borrow_and_update().clone() else {
                        continue;
                    };
                    debug!("'{name}' woken for round {}", round.id);
                    let contribution = tokio::select! {
                        biased;
                        _ = self.cancel.changed() => break,
                        contribution = self.collector.collect() => contribution,
                    };
                    publish(&self.shared, self.slot, &round, contribution).await;
                }
            }
        }
        self.collector.shutdown().await;
        debug!("Sub-collector '{name}' stopped");
    }
}

async fn publish(
    shared: &Mutex<Shared>,
    slot: usize,
    round: &Round,
    contribution: Contribution,
) {
    {
        let mut state = shared.lock().await;
        if state.round == round.id {
            match contribution {
                Contribution::Metrics(metrics) => {
                    for (uuid, records) in metrics {
                        state.metrics.entry(uuid).or_default().extend(records);
                    }
                }
                Contribution::Labels(overlay) => {
                    for (uuid, labels) in overlay {
                        state.overlay.entry(uuid).or_default().extend(labels);
                    }
                }
            }
            state.reported.insert(slot);
        } else {
            debug!(
                "Dropping contribution for round {} (current {})",
                round.id, state.round
            );
        }
    }
    round.barrier.arrive();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::metric::{label_schema, LabelSet, MetricRecord};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        uuid: String,
        polls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SubCollector for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn collect(&mut self) -> Contribution {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut labels = LabelSet::new();
            labels.insert("uuid".to_string(), self.uuid.clone());
            let mut metrics = DeviceMetrics::new();
            metrics.insert(
                self.uuid.clone(),
                vec![MetricRecord::new("ix_temperature", n as f64, labels)],
            );
            Contribution::Metrics(metrics)
        }
    }

    struct Overlay;

    #[async_trait]
    impl SubCollector for Overlay {
        fn name(&self) -> &str {
            "overlay"
        }

        async fn collect(&mut self) -> Contribution {
            let mut labels = LabelSet::new();
            labels.insert("pod".to_string(), "trainer".to_string());
            let mut overlay = LabelOverlay::new();
            overlay.insert("GPU-0".to_string(), labels);
            Contribution::Labels(overlay)
        }
    }

    #[tokio::test]
    async fn test_empty_context_snapshot() {
        let ctx = ScrapeContext::new(label_schema(false), Duration::from_secs(1));
        let scrape = ctx.snapshot().await;
        assert!(scrape.snapshot.is_empty());
        assert!(scrape.complete);
    }

    #[tokio::test]
    async fn test_each_snapshot_polls_again() {
        let ctx = ScrapeContext::new(label_schema(false), Duration::from_secs(5));
        let polls = Arc::new(AtomicUsize::new(0));
        ctx.register(Box::new(Fixed {
            uuid: "GPU-0".to_string(),
            polls: polls.clone(),
        }))
        .await;

        for expected in 1..=3 {
            let scrape = ctx.snapshot().await;
            assert!(scrape.complete);
            let record = &scrape.snapshot.device("GPU-0").unwrap()[0];
            assert_eq!(record.value, expected as f64);
        }
        ctx.shutdown().await;
        assert_eq!(ctx.live_tasks().await, 0);
    }

    #[tokio::test]
    async fn test_overlay_is_merged_and_schema_back_filled() {
        let ctx = ScrapeContext::new(label_schema(true), Duration::from_secs(5));
        ctx.register(Box::new(Fixed {
            uuid: "GPU-0".to_string(),
            polls: Arc::new(AtomicUsize::new(0)),
        }))
        .await;
        ctx.register(Box::new(Overlay)).await;

        let scrape = ctx.snapshot().await;
        let record = &scrape.snapshot.device("GPU-0").unwrap()[0];
        assert_eq!(record.label("pod"), Some("trainer"));
        assert_eq!(record.label("namespace"), Some(""));
        assert_eq!(record.label("gpu"), Some(""));
        ctx.shutdown().await;
    }

    #[test]
    fn test_merge_without_overlay() {
        let mut metrics = DeviceMetrics::new();
        metrics.insert(
            "GPU-1".to_string(),
            vec![MetricRecord::new("ix_fan_speed", 30.0, BTreeMap::new())],
        );
        let snapshot = merge(&metrics, &LabelOverlay::new(), &label_schema(false));
        let record = &snapshot.devices["GPU-1"][0];
        assert_eq!(record.labels.len(), 3);
        assert!(record.labels.values().all(String::is_empty));
    }

    #[tokio::test]
    async fn test_register_after_shutdown_is_ignored() {
        let ctx = ScrapeContext::new(label_schema(false), Duration::from_secs(1));
        ctx.shutdown().await;
        ctx.register(Box::new(Overlay)).await;
        assert_eq!(ctx.live_tasks().await, 0);
        assert!(ctx.snapshot().await.snapshot.is_empty());
    }
}
