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

use std::sync::Arc;

use clap::Parser;

use ix_exporter::api::{init_logging, serve};
use ix_exporter::cli::Cli;
use ix_exporter::collector::GpuExporter;
use ix_exporter::common::config::{AppConfig, MetricsConfig};
use ix_exporter::device::{discover, DeviceTelemetryProvider, IxmlProvider, Topology};
use ix_exporter::{Error, Result};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let metrics = MetricsConfig::load(&cli.config)?.metrics_for(AppConfig::VENDOR_KEY)?;

    let provider = IxmlProvider::init(&cli.library)
        .map_err(|e| Error::ProviderInit(format!("{}: {e}", cli.library)))?;
    let provider: Arc<dyn DeviceTelemetryProvider> = Arc::new(provider);

    // Keep serving an empty snapshot when nothing was discovered.
    let topology = match discover(provider.as_ref()) {
        Ok(topology) => topology,
        Err(e) => {
            tracing::error!("Topology discovery failed: {e}");
            Topology::default()
        }
    };

    let mut exporter = GpuExporter::new(metrics, Arc::new(topology), Arc::clone(&provider))
        .with_timeout(cli.scrape_timeout());
    if cli.enable_kube {
        exporter = exporter.with_kubelet(cli.kube_options());
    }
    let exporter = Arc::new(exporter);
    exporter.describe().await;

    serve(exporter, provider, &cli.address, cli.port, &cli.router).await
}
