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

//! Serves the full exporter on top of simulated devices.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use ix_exporter::api::{init_logging, serve};
use ix_exporter::collector::metric::names;
use ix_exporter::collector::GpuExporter;
use ix_exporter::common::config::{AppConfig, MetricConfig, MetricsConfig};
use ix_exporter::device::{
    discover, DeviceTelemetryProvider, MockDevice, MockTelemetryProvider, RunningProcess,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Metrics configuration file. Every known metric is served when omitted.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,
    #[arg(short, long, default_value_t = AppConfig::DEFAULT_PORT)]
    port: u16,
    #[arg(short, long, default_value = AppConfig::DEFAULT_METRICS_ROUTER)]
    router: String,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn simulated_host() -> MockTelemetryProvider {
    let process = |pid, mib: u64| RunningProcess {
        pid,
        used_memory: mib * AppConfig::BYTES_PER_MIB,
    };
    MockTelemetryProvider::new(vec![
        MockDevice::new("GPU-5a1e0000-0000-0000-0000-000000000000", "Iluvatar BI-V150")
            .board_position(0)
            .processes(vec![process(std::process::id(), 2048)]),
        MockDevice::new("GPU-5a1e0000-0000-0000-0000-000000000001", "Iluvatar BI-V150")
            .board_position(1),
        MockDevice::new("GPU-5a1e0000-0000-0000-0000-000000000002", "Iluvatar BI-V150")
            .board_position(0)
            .temperature(52),
        MockDevice::new("GPU-5a1e0000-0000-0000-0000-000000000003", "Iluvatar BI-V150")
            .board_position(1)
            .temperature(55),
        MockDevice::new("GPU-5a1e0000-0000-0000-0000-000000000004", "Iluvatar MR-V100")
            .gpm(false, 0.0),
    ])
    .with_same_board(0, 1)
    .with_same_board(2, 3)
    .with_jitter()
}

fn all_metrics() -> Vec<MetricConfig> {
    names::ALL
        .iter()
        .map(|name| MetricConfig {
            name: name.to_string(),
            help: format!("Simulated {name}"),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let metrics = match &args.config {
        Some(path) => MetricsConfig::load(path)
            .and_then(|c| c.metrics_for(AppConfig::VENDOR_KEY))
            .with_context(|| format!("loading {}", path.display()))?,
        None => all_metrics(),
    };

    let provider: Arc<dyn DeviceTelemetryProvider> = Arc::new(simulated_host());
    let topology = discover(provider.as_ref()).context("discovering simulated devices")?;

    let exporter = Arc::new(GpuExporter::new(
        metrics,
        Arc::new(topology),
        Arc::clone(&provider),
    ));
    exporter.describe().await;

    serve(exporter, provider, &args.address, args.port, &args.router).await?;
    Ok(())
}
