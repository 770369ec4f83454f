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

use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use std::sync::Arc;

use crate::api::metrics::{encode_scrape, CONTENT_TYPE};
use crate::collector::GpuExporter;
use crate::error::Error;

pub struct ApiState {
    pub exporter: Arc<GpuExporter>,
    pub router: String,
}

pub type SharedState = Arc<ApiState>;

pub async fn metrics_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let collected = state.exporter.collect().await;
    let scrape = &collected.scrape;

    if scrape.complete {
        tracing::debug!(
            "Scrape served {} device(s) in {:?}",
            scrape.snapshot.len(),
            scrape.elapsed
        );
    } else {
        // Partial data is still served.
        tracing::error!(
            "{}; missing sub-collectors: {}",
            Error::ScrapeTimeout(scrape.elapsed),
            scrape.missing.join(", ")
        );
    }

    (
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        encode_scrape(&collected.descriptors, &scrape.snapshot),
    )
}

pub async fn index_handler(State(state): State<SharedState>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>IX Exporter</title></head>\n<body>\n<h1>IX Exporter</h1>\n<p><a href=\"{0}\">{0}</a></p>\n</body>\n</html>\n",
        state.router
    ))
}
