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

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::common::config::{validate_route, AppConfig, KubeOptions, SplitBoardSetting};
use crate::utils::get_hostname;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Metrics configuration file.
    #[arg(short, long, default_value = AppConfig::DEFAULT_METRICS_CONFIG)]
    pub config: PathBuf,
    /// Address to listen on.
    #[arg(short, long, default_value = AppConfig::DEFAULT_ADDRESS)]
    pub address: String,
    /// Port to listen on.
    #[arg(short, long, default_value_t = AppConfig::DEFAULT_PORT)]
    pub port: u16,
    /// Route serving the metrics.
    #[arg(short, long, default_value = AppConfig::DEFAULT_METRICS_ROUTER, value_parser = parse_route)]
    pub router: String,
    /// Label devices with the pods they are assigned to.
    #[arg(long)]
    pub enable_kube: bool,
    /// Treat the dies of a dual-die board as separately assignable.
    /// Overridden by the cluster config file when it exists.
    #[arg(long)]
    pub split_board: bool,
    /// Cluster config written by the device plugin.
    #[arg(long, default_value = AppConfig::CLUSTER_CONFIG)]
    pub cluster_config: PathBuf,
    /// Kubelet pod-resources socket.
    #[arg(long, default_value = AppConfig::KUBELET_SOCKET)]
    pub kubelet_socket: PathBuf,
    /// Extended resource name the device plugin advertises.
    #[arg(long, default_value = AppConfig::RESOURCE_NAME)]
    pub resource_name: String,
    /// Value of the node_name label. Defaults to $NODE_NAME, then the host name.
    #[arg(long)]
    pub node_name: Option<String>,
    /// Device management library to load.
    #[arg(long, default_value = AppConfig::DEFAULT_LIBRARY)]
    pub library: String,
    /// Seconds a scrape waits for every sub-collector.
    #[arg(long, default_value_t = AppConfig::SCRAPE_TIMEOUT_SECS)]
    pub scrape_timeout: u64,
    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn parse_route(route: &str) -> Result<String, String> {
    validate_route(route).map_err(|e| e.to_string())?;
    Ok(route.to_string())
}

impl Cli {
    pub fn node_name(&self) -> String {
        if let Some(name) = self.node_name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        match std::env::var("NODE_NAME") {
            Ok(name) if !name.is_empty() => name,
            _ => get_hostname(),
        }
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout)
    }

    pub fn kube_options(&self) -> KubeOptions {
        KubeOptions {
            socket: self.kubelet_socket.clone(),
            resource_name: self.resource_name.clone(),
            node_name: self.node_name(),
            split_board: SplitBoardSetting {
                default: self.split_board,
                cluster_config: Some(self.cluster_config.clone()),
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["ix-exporter"]);
        assert_eq!(cli.port, 32021);
        assert_eq!(cli.router, "/metrics");
        assert_eq!(cli.scrape_timeout(), Duration::from_secs(25));
        assert!(!cli.enable_kube);
    }

    #[test]
    fn test_router_must_be_an_absolute_path() {
        let cli = Cli::try_parse_from(["ix-exporter", "-r", "/ix/metrics"]).unwrap();
        assert_eq!(cli.router, "/ix/metrics");
        for bad in ["/", "metrics", "/{name}"] {
            assert!(
                Cli::try_parse_from(["ix-exporter", "--router", bad]).is_err(),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_kube_options_from_flags() {
        let cli = Cli::parse_from([
            "ix-exporter",
            "--enable-kube",
            "--split-board",
            "--node-name",
            "worker-3",
            "--resource-name",
            "example.com/gpu",
        ]);
        let options = cli.kube_options();
        assert_eq!(options.node_name, "worker-3");
        assert_eq!(options.resource_name, "example.com/gpu");
        assert!(options.split_board.default);
        assert_eq!(options.timeout, Duration::from_secs(AppConfig::KUBELET_TIMEOUT_SECS));
    }
}
