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

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Application configuration constants
pub struct AppConfig;

impl AppConfig {
    // Startup defaults
    pub const DEFAULT_METRICS_CONFIG: &'static str = "/etc/ixexporter/exporter.yaml";
    pub const DEFAULT_METRICS_ROUTER: &'static str = "/metrics";
    pub const DEFAULT_ADDRESS: &'static str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 32021;
    pub const DEFAULT_LIBRARY: &'static str = "libixml.so";
    pub const VENDOR_KEY: &'static str = "iluvatar";

    // Kubernetes correlation
    pub const KUBELET_SOCKET: &'static str = "/var/lib/kubelet/pod-resources/kubelet.sock";
    pub const RESOURCE_NAME: &'static str = "iluvatar.com/gpu";
    pub const CLUSTER_CONFIG: &'static str = "/iluvatar-config/ix-config";
    pub const KUBELET_TIMEOUT_SECS: u64 = 10;

    // Scrape rounds
    pub const SCRAPE_TIMEOUT_SECS: u64 = 25;
    pub const SM_SAMPLE_INTERVAL_SECS: u64 = 1;
    pub const SHUTDOWN_GRACE_SECS: u64 = 5;

    pub const BYTES_PER_MIB: u64 = 1024 * 1024;
    pub const CLAIMANT_SEPARATOR: &'static str = ";";
}

/// Check that `route` can serve the metrics next to the landing page at `/`.
///
/// The route must be an absolute literal path other than `/`; capture and
/// wildcard syntax is rejected.
pub fn validate_route(route: &str) -> Result<()> {
    if !route.starts_with('/') {
        return Err(Error::Config(format!(
            "metrics route '{route}' must start with '/'"
        )));
    }
    if route == "/" {
        return Err(Error::Config(
            "metrics route '/' is taken by the landing page".to_string(),
        ));
    }
    let dynamic = route.contains(['{', '}'])
        || route
            .split('/')
            .any(|segment| segment.starts_with(':') || segment.starts_with('*'));
    if dynamic {
        return Err(Error::Config(format!(
            "metrics route '{route}' must be a literal path"
        )));
    }
    Ok(())
}

/// One exposed metric: its name and the help text advertised with it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub help: String,
}

/// Per-vendor section of the metrics file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

/// The metrics file: vendor key mapped to the metrics exposed for it.
///
/// ```yaml
/// iluvatar:
///   metrics:
///     - name: ix_temperature
///       help: GPU temperature in degrees Celsius
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct MetricsConfig {
    pub vendors: HashMap<String, ExporterConfig>,
}

impl MetricsConfig {
    /// Read, parse and validate the metrics file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "metrics config not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    /// Parse and validate a metrics file from its YAML text.
    pub fn parse(data: &str) -> Result<Self> {
        let config: MetricsConfig = serde_yaml_ng::from_str(data)?;
        config.verify()?;
        Ok(config)
    }

    fn verify(&self) -> Result<()> {
        if self.vendors.is_empty() {
            return Err(Error::Config("no vendor section in config file".to_string()));
        }
        for (vendor, section) in &self.vendors {
            if vendor.is_empty() || section.metrics.is_empty() {
                return Err(Error::Config(
                    "miss field 'name' or 'metrics' in config file".to_string(),
                ));
            }
            let mut seen = HashSet::new();
            for (i, metric) in section.metrics.iter().enumerate() {
                if metric.name.is_empty() {
                    return Err(Error::Config(format!(
                        "miss field 'name' in 'metrics' configuration of metrics{i}"
                    )));
                }
                if metric.help.is_empty() {
                    return Err(Error::Config(format!(
                        "miss field 'help' in 'metrics' configuration of metrics{i}"
                    )));
                }
                if !seen.insert(metric.name.as_str()) {
                    return Err(Error::Config(format!(
                        "duplicate metric '{}' in section '{vendor}'",
                        metric.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The ordered metric set configured for `vendor`.
    pub fn metrics_for(&self, vendor: &str) -> Result<Vec<MetricConfig>> {
        self.vendors
            .get(vendor)
            .map(|section| section.metrics.clone())
            .ok_or_else(|| Error::Config(format!("{vendor} configuration not found")))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Flags {
    #[serde(default)]
    pub splitboard: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplicatedResources {
    #[serde(default)]
    pub replicas: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Sharing {
    #[serde(default, rename = "timeSlicing")]
    pub time_slicing: ReplicatedResources,
    #[serde(default)]
    pub mps: Option<ReplicatedResources>,
}

/// Cluster-wide settings published by the device plugin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default)]
    pub sharing: Sharing,
}

impl ClusterConfig {
    pub fn parse_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut data = String::new();
        reader.read_to_string(&mut data)?;
        Ok(serde_yaml_ng::from_str(&data)?)
    }
}

/// Where the split-board flag comes from.
///
/// The cluster config file wins when it can be read; the command line value is
/// the fallback.
#[derive(Debug, Clone)]
pub struct SplitBoardSetting {
    pub default: bool,
    pub cluster_config: Option<PathBuf>,
}

impl SplitBoardSetting {
    pub fn fixed(value: bool) -> Self {
        Self {
            default: value,
            cluster_config: None,
        }
    }

    /// Current value of the flag, re-reading the cluster config if configured.
    pub fn resolve(&self) -> bool {
        let Some(path) = &self.cluster_config else {
            return self.default;
        };
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!("Cluster config {} unavailable: {e}", path.display());
                return self.default;
            }
        };
        match ClusterConfig::parse_from(file) {
            Ok(config) => config.flags.splitboard,
            Err(e) => {
                tracing::error!("Error parsing cluster config {}: {e}", path.display());
                self.default
            }
        }
    }
}

/// Runtime options for the Kubernetes correlation path.
#[derive(Debug, Clone)]
pub struct KubeOptions {
    pub socket: PathBuf,
    pub resource_name: String,
    pub node_name: String,
    pub timeout: Duration,
    pub split_board: SplitBoardSetting,
}

impl Default for KubeOptions {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(AppConfig::KUBELET_SOCKET),
            resource_name: AppConfig::RESOURCE_NAME.to_string(),
            node_name: String::new(),
            timeout: Duration::from_secs(AppConfig::KUBELET_TIMEOUT_SECS),
            split_board: SplitBoardSetting::fixed(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
iluvatar:
  metrics:
    - name: ix_temperature
      help: GPU temperature
    - name: ix_process_info
      help: Processes running on the GPU
"#;

    #[test]
    fn test_parse_metrics_config() {
        let config = MetricsConfig::parse(SAMPLE).unwrap();
        let metrics = config.metrics_for(AppConfig::VENDOR_KEY).unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "ix_temperature");
        assert_eq!(metrics[1].help, "Processes running on the GPU");
    }

    #[test]
    fn test_missing_help_is_rejected() {
        let data = "iluvatar:\n  metrics:\n    - name: ix_temperature\n";
        let err = MetricsConfig::parse(data).unwrap_err();
        assert!(err.to_string().contains("miss field 'help'"));
    }

    #[test]
    fn test_empty_metrics_is_rejected() {
        let data = "iluvatar:\n  metrics: []\n";
        assert!(matches!(MetricsConfig::parse(data), Err(Error::Config(_))));
    }

    #[test]
    fn test_duplicate_metric_is_rejected() {
        let data = "iluvatar:\n  metrics:\n    - {name: a, help: x}\n    - {name: a, help: y}\n";
        let err = MetricsConfig::parse(data).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_missing_vendor_section() {
        let config = MetricsConfig::parse(SAMPLE).unwrap();
        assert!(config.metrics_for("other").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = MetricsConfig::load(Path::new("/nonexistent/exporter.yaml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = MetricsConfig::load(file.path()).unwrap();
        assert!(config.vendors.contains_key("iluvatar"));
    }

    #[test]
    fn test_cluster_config_split_board() {
        let data = "version: v1\nflags:\n  splitboard: true\nsharing:\n  timeSlicing:\n    replicas: 4\n";
        let config = ClusterConfig::parse_from(data.as_bytes()).unwrap();
        assert!(config.flags.splitboard);
        assert_eq!(config.sharing.time_slicing.replicas, 4);
        assert!(config.sharing.mps.is_none());
    }

    #[test]
    fn test_split_board_setting_falls_back() {
        let setting = SplitBoardSetting {
            default: true,
            cluster_config: Some(PathBuf::from("/nonexistent/ix-config")),
        };
        assert!(setting.resolve());
    }

    #[test]
    fn test_split_board_setting_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"flags:\n  splitboard: true\n").unwrap();
        let setting = SplitBoardSetting {
            default: false,
            cluster_config: Some(file.path().to_path_buf()),
        };
        assert!(setting.resolve());
    }

    #[test]
    fn test_validate_route() {
        assert!(validate_route("/metrics").is_ok());
        assert!(validate_route("/ix/metrics").is_ok());
        for bad in ["", "/", "metrics", "/{name}", "/:name", "/files/*rest"] {
            assert!(
                matches!(validate_route(bad), Err(Error::Config(_))),
                "accepted {bad:?}"
            );
        }
    }
}
