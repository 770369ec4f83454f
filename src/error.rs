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

//! Unified error types for the ix-exporter library.
//!
//! Only configuration errors and a total failure to initialise the device
//! library stop the process. Everything else is absorbed by the
//! sub-collectors and shows up as missing or zero values in a scrape.

use std::time::Duration;

use thiserror::Error;

/// The main error type for exporter operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device management library could not be loaded or initialised.
    #[error("Device library initialization failed: {0}")]
    ProviderInit(String),

    /// Topology discovery enumerated zero usable devices.
    ///
    /// The exporter keeps running and simply reports nothing.
    #[error("No supported devices found")]
    NoDevicesFound,

    /// The metrics configuration is missing or malformed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A configuration file could not be parsed as YAML.
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// The workload resource provider (kubelet socket) is not reachable.
    #[error("Workload resource provider unavailable: {0}")]
    WorkloadUnavailable(String),

    /// A gRPC call to the workload resource provider failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A scrape round did not complete before its deadline.
    #[error("Scrape timed out after {0:?}")]
    ScrapeTimeout(Duration),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Self::Transport(format!("{}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// A specialized Result type for exporter operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ProviderInit("libixml.so not found".to_string());
        assert_eq!(
            err.to_string(),
            "Device library initialization failed: libixml.so not found"
        );

        let err = Error::NoDevicesFound;
        assert_eq!(err.to_string(), "No supported devices found");

        let err = Error::Config("miss field 'help'".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: miss field 'help'");

        let err = Error::ScrapeTimeout(Duration::from_secs(25));
        assert_eq!(err.to_string(), "Scrape timed out after 25s");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_status() {
        let err: Error = tonic::Status::unavailable("socket closed").into();
        match err {
            Error::Transport(msg) => assert!(msg.contains("socket closed")),
            other => panic!("Expected Transport error, got: {other}"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
