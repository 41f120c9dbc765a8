// Copyright (C) 2025 Matías Salinas (support@fenden.com)
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

pub mod mino;
pub mod nerinyan;
pub mod osu_direct;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::HttpTimeouts;
use crate::resilience::MirrorHealth;

/// Builds the outbound HTTP client shared pattern for all backends:
/// service-identifying User-Agent, connect + total timeouts, redirects
/// followed (reqwest default).
pub(crate) fn build_http_client(timeouts: &HttpTimeouts) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(concat!("mirrorbolt/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(timeouts.connect_timeout_secs))
        .timeout(Duration::from_secs(timeouts.request_timeout_secs))
        .build()
}

/// Resource kinds a mirror can serve. A mirror advertises the subset it
/// supports; the registry builds one pool per kind.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MirrorResource {
    OszFile,
    Osz2File,
    BackgroundImage,
    CheesegullBeatmap,
    CheesegullBeatmapset,
}

impl MirrorResource {
    /// Stable string form, used as the `resource` column in telemetry rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorResource::OszFile => "osz_file",
            MirrorResource::Osz2File => "osz2_file",
            MirrorResource::BackgroundImage => "background_image",
            MirrorResource::CheesegullBeatmap => "cheesegull_beatmap",
            MirrorResource::CheesegullBeatmapset => "cheesegull_beatmapset",
        }
    }
}

impl std::fmt::Display for MirrorResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized result of one upstream attempt.
///
/// Invariant: `is_success == false` implies `data == None`. A successful
/// envelope with no data means the upstream authoritatively answered that
/// the resource does not exist (HTTP 404/451).
#[derive(Debug, Clone)]
pub struct MirrorResponse<T> {
    pub data: Option<T>,
    pub is_success: bool,
    pub request_url: Option<String>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl<T> MirrorResponse<T> {
    /// 2xx with a body.
    pub fn hit(data: T, request_url: String, status_code: u16) -> Self {
        Self {
            data: Some(data),
            is_success: true,
            request_url: Some(request_url),
            status_code: Some(status_code),
            error_message: None,
        }
    }

    /// Authoritative not-found (404/451). The upstream is healthy.
    pub fn absent(request_url: String, status_code: u16) -> Self {
        Self {
            data: None,
            is_success: true,
            request_url: Some(request_url),
            status_code: Some(status_code),
            error_message: None,
        }
    }

    /// Transport error, timeout, or unexpected status.
    pub fn failure(
        request_url: Option<String>,
        status_code: Option<u16>,
        error_message: String,
    ) -> Self {
        Self {
            data: None,
            is_success: false,
            request_url,
            status_code,
            error_message: Some(error_message),
        }
    }
}

/// Capability interface implemented by each concrete mirror backend.
///
/// Implementations never return an error to the caller: every outcome,
/// including transport failures, is reported through the envelope.
/// A backend only receives calls for resources it advertises in
/// `supported_resources`; unsupported operations fall back to a failure
/// envelope rather than panicking.
#[async_trait]
pub trait MirrorBackend: Send + Sync {
    /// Identifier used in telemetry rows and logs.
    fn name(&self) -> &str;

    /// Upstream root, e.g. `https://central.catboy.best`.
    fn base_url(&self) -> &str;

    /// Resource kinds this backend can serve.
    fn supported_resources(&self) -> &HashSet<MirrorResource>;

    /// Fetch a beatmapset archive (`.osz`/`.osz2` ZIP bytes).
    async fn fetch_archive(&self, beatmapset_id: u32) -> MirrorResponse<Bytes> {
        unsupported(self.base_url(), "archive", beatmapset_id)
    }

    /// Fetch a beatmap's background image bytes.
    async fn fetch_background_image(&self, beatmap_id: u32) -> MirrorResponse<Bytes> {
        unsupported(self.base_url(), "background image", beatmap_id)
    }

    /// Fetch cheesegull-shaped beatmap metadata (raw JSON bytes).
    async fn fetch_metadata_beatmap(&self, beatmap_id: u32) -> MirrorResponse<Bytes> {
        unsupported(self.base_url(), "beatmap metadata", beatmap_id)
    }

    /// Fetch cheesegull-shaped beatmapset metadata (raw JSON bytes).
    async fn fetch_metadata_beatmapset(&self, beatmapset_id: u32) -> MirrorResponse<Bytes> {
        unsupported(self.base_url(), "beatmapset metadata", beatmapset_id)
    }
}

fn unsupported(base_url: &str, what: &str, id: u32) -> MirrorResponse<Bytes> {
    MirrorResponse::failure(
        Some(base_url.to_string()),
        None,
        format!("backend does not serve {what} (id {id})"),
    )
}

/// Runtime record for one configured upstream. Created once per process at
/// startup and shared across resource pools; mutated only through
/// `record_success`, `record_failure`, and `set_weight`.
pub struct Mirror {
    backend: Box<dyn MirrorBackend>,
    enabled_resources: HashSet<MirrorResource>,
    weight: AtomicU32,
    health: Mutex<MirrorHealth>,
}

impl Mirror {
    pub fn new(backend: Box<dyn MirrorBackend>, initial_weight: u32, health: MirrorHealth) -> Self {
        let enabled_resources = backend.supported_resources().clone();
        Self {
            backend,
            enabled_resources,
            weight: AtomicU32::new(initial_weight),
            health: Mutex::new(health),
        }
    }

    /// Narrows the advertised resource set to the configured one. Kinds the
    /// backend cannot serve are ignored.
    pub fn with_resources(mut self, restrict: &HashSet<MirrorResource>) -> Self {
        self.enabled_resources = self
            .enabled_resources
            .intersection(restrict)
            .copied()
            .collect();
        self
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn base_url(&self) -> &str {
        self.backend.base_url()
    }

    pub fn supports(&self, resource: MirrorResource) -> bool {
        self.enabled_resources.contains(&resource)
    }

    /// Current selection weight. Published with relaxed ordering: readers
    /// tolerate a stale value for one selection cycle (last-writer-wins).
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    /// Consults the circuit breaker, then (if configured) the token bucket.
    /// A bucket denial does not consume the breaker's half-open probe.
    pub fn is_available(&self) -> bool {
        self.health.lock().unwrap().is_available()
    }

    pub fn record_success(&self, latency: Duration) {
        self.health
            .lock()
            .unwrap()
            .record_success(latency.as_secs_f64());
    }

    pub fn record_failure(&self) {
        self.health.lock().unwrap().record_failure();
    }

    /// Exponential moving average of successful request latency, in seconds.
    pub fn latency_ema(&self) -> f64 {
        self.health.lock().unwrap().latency_ema
    }

    /// Runs `f` with exclusive access to the health record. Test hooks and
    /// the registry use this; request paths go through the methods above.
    pub fn with_health<R>(&self, f: impl FnOnce(&mut MirrorHealth) -> R) -> R {
        f(&mut self.health.lock().unwrap())
    }

    /// Dispatches a fetch to the backend operation matching `resource`.
    pub async fn fetch(&self, resource: MirrorResource, id: u32) -> MirrorResponse<Bytes> {
        match resource {
            MirrorResource::OszFile | MirrorResource::Osz2File => {
                self.backend.fetch_archive(id).await
            }
            MirrorResource::BackgroundImage => self.backend.fetch_background_image(id).await,
            MirrorResource::CheesegullBeatmap => self.backend.fetch_metadata_beatmap(id).await,
            MirrorResource::CheesegullBeatmapset => {
                self.backend.fetch_metadata_beatmapset(id).await
            }
        }
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("name", &self.name())
            .field("base_url", &self.base_url())
            .field("weight", &self.weight())
            .finish()
    }
}
