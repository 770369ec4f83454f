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

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::handlers::{index_handler, metrics_handler, ApiState, SharedState};
use crate::collector::GpuExporter;
use crate::common::config::validate_route;
use crate::device::DeviceTelemetryProvider;
use crate::error::Result;

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ix_exporter={level},tower_http={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Routes for the landing page and the metrics endpoint.
///
/// Fails with a configuration error when `router` cannot sit next to the
/// landing page.
pub fn build_router(exporter: Arc<GpuExporter>, router: &str) -> Result<Router> {
    validate_route(router)?;
    let state: SharedState = Arc::new(ApiState {
        exporter,
        router: router.to_string(),
    });

    Ok(Router::new()
        .route("/", get(index_handler))
        .route(router, get(metrics_handler))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http()))
}

/// Serve until SIGINT/SIGTERM, then unregister the exporter and release the
/// device library.
pub async fn serve(
    exporter: Arc<GpuExporter>,
    provider: Arc<dyn DeviceTelemetryProvider>,
    address: &str,
    port: u16,
    router: &str,
) -> Result<()> {
    let app = build_router(Arc::clone(&exporter), router)?;

    let listener = TcpListener::bind((address, port)).await?;
    match listener.local_addr() {
        Ok(addr) => tracing::info!("Serving metrics at http://{addr}{router}"),
        Err(_) => tracing::info!("Serving metrics on {address}:{port}{router}"),
    }

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        tracing::error!("HTTP server error: {e}");
    }

    // Second describe call unregisters and stops every sub-collector.
    exporter.describe().await;
    if let Err(e) = provider.shutdown() {
        tracing::warn!("Failed to shut down device library: {e}");
    }
    tracing::info!("Exporter stopped");

    served.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
