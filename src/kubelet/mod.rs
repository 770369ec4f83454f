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

//! Kubelet pod-resources client.
//!
//! Talks to `v1alpha1.PodResourcesLister/List` over the kubelet's local unix
//! socket. The protobuf messages are declared here with `prost` derives, so no
//! code generation step is needed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::UnixStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, info};

use crate::error::{Error, Result};

const LIST_PATH: &str = "/v1alpha1.PodResourcesLister/List";

static REPLICA_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"::\d+$").expect("replica suffix pattern is valid"));

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListPodResourcesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListPodResourcesResponse {
    #[prost(message, repeated, tag = "1")]
    pub pod_resources: Vec<PodResources>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PodResources {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(message, repeated, tag = "3")]
    pub containers: Vec<ContainerResources>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerResources {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub devices: Vec<ContainerDevices>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerDevices {
    #[prost(string, tag = "1")]
    pub resource_name: String,
    #[prost(string, repeated, tag = "2")]
    pub device_ids: Vec<String>,
}

/// Drop the time-slicing replica suffix (`GPU-abc::3` -> `GPU-abc`).
pub fn strip_replica_suffix(device_id: &str) -> &str {
    match REPLICA_SUFFIX.find(device_id) {
        Some(m) => &device_id[..m.start()],
        None => device_id,
    }
}

/// Source of pod to device assignments on this node.
#[async_trait]
pub trait WorkloadResourceProvider: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn list_pod_resources(&mut self) -> Result<Vec<PodResources>>;

    async fn disconnect(&mut self) {}
}

pub struct KubeletClient {
    socket: PathBuf,
    timeout: Duration,
    channel: Option<Channel>,
}

impl KubeletClient {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
            channel: None,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

#[async_trait]
impl WorkloadResourceProvider for KubeletClient {
    async fn connect(&mut self) -> Result<()> {
        if !self.socket.exists() {
            return Err(Error::WorkloadUnavailable(format!(
                "failed to find '{}'",
                self.socket.display()
            )));
        }

        // The authority is ignored; every connection goes to the socket.
        let socket = self.socket.clone();
        let endpoint = Endpoint::try_from("http://[::]:50051")?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);
        let connect = endpoint.connect_with_connector(tower::service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move {
                let stream = UnixStream::connect(socket).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }));

        let channel = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| {
                Error::WorkloadUnavailable(format!(
                    "timed out connecting to '{}'",
                    self.socket.display()
                ))
            })??;

        info!("Connected to kubelet at {}", self.socket.display());
        self.channel = Some(channel);
        Ok(())
    }

    async fn list_pod_resources(&mut self) -> Result<Vec<PodResources>> {
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| Error::WorkloadUnavailable("not connected to kubelet".to_string()))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        let call = async move {
            grpc.ready()
                .await
                .map_err(|e| Error::Transport(format!("kubelet not ready: {e}")))?;
            let codec = tonic_prost::ProstCodec::default();
            let response: tonic::Response<ListPodResourcesResponse> = grpc
                .unary(
                    tonic::Request::new(ListPodResourcesRequest {}),
                    PathAndQuery::from_static(LIST_PATH),
                    codec,
                )
                .await?;
            Ok::<_, Error>(response.into_inner())
        };

        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "pod resources request timed out after {:?}",
                    self.timeout
                ))
            })??;
        debug!("Kubelet reported {} pod(s)", response.pod_resources.len());
        Ok(response.pod_resources)
    }

    async fn disconnect(&mut self) {
        if self.channel.take().is_some() {
            info!("Disconnected from kubelet");
        }
    }
}
