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

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::aggregate::{AggregateError, AggregateOptions, MirrorAggregate};
use crate::config::{Config, MirrorKind};
use crate::mirrors::{
    Mirror, MirrorBackend, MirrorResource, mino::MinoMirror, nerinyan::NerinyanMirror,
    osu_direct::OsuDirectMirror,
};
use crate::resilience::{CircuitBreaker, MirrorHealth, TokenBucket};
use crate::telemetry::MirrorRequestStore;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to build mirror HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Process-wide mirror wiring, constructed once in `main` from the loaded
/// config and threaded into the HTTP surface. Holds one orchestrator pool
/// per resource kind; a mirror appears in every pool whose kind it serves.
pub struct MirrorRegistry {
    archives: Option<MirrorAggregate>,
    backgrounds: Option<MirrorAggregate>,
    beatmap_metadata: Option<MirrorAggregate>,
    beatmapset_metadata: Option<MirrorAggregate>,
}

impl MirrorRegistry {
    pub fn from_config(
        config: &Config,
        store: Arc<dyn MirrorRequestStore>,
    ) -> Result<Self, RegistryError> {
        let mut mirrors: Vec<Arc<Mirror>> = Vec::with_capacity(config.mirrors.len());

        for mirror_config in &config.mirrors {
            let backend: Box<dyn MirrorBackend> = match mirror_config.kind {
                MirrorKind::Mino => Box::new(MinoMirror::new(
                    mirror_config.base_url.clone(),
                    &config.http,
                )?),
                MirrorKind::Nerinyan => Box::new(NerinyanMirror::new(
                    mirror_config.base_url.clone(),
                    mirror_config.ratelimit_key.clone(),
                    &config.http,
                )?),
                MirrorKind::OsuDirect => Box::new(OsuDirectMirror::new(
                    mirror_config.base_url.clone(),
                    &config.http,
                )?),
            };

            let breaker = CircuitBreaker::new(
                config.circuit.failure_threshold,
                Duration::from_secs_f64(config.circuit.cooldown_seconds),
            );
            let bucket = mirror_config.requests_per_second.map(TokenBucket::new);
            let health = MirrorHealth::new(breaker, bucket);

            let mut mirror = Mirror::new(backend, config.selection.initial_weight, health);
            if let Some(restrict) = &mirror_config.supported_resources {
                mirror = mirror.with_resources(restrict);
            }

            info!(
                "🪞 Registered mirror '{}' at {} (rps limit: {:?})",
                mirror.name(),
                mirror.base_url(),
                mirror_config.requests_per_second
            );
            mirrors.push(Arc::new(mirror));
        }

        let options = AggregateOptions {
            strategy: config.selection.strategy,
            hedge_count: config.selection.hedge_count,
            min_archive_size_bytes: config.validation.min_archive_size_bytes,
        };

        // Archives are one pool: a mirror qualifies with either flavor, and
        // the pool's telemetry rows are uniformly tagged `osz_file` so
        // weight reads always match what was written.
        let archive_members: Vec<Arc<Mirror>> = mirrors
            .iter()
            .filter(|m| {
                m.supports(MirrorResource::OszFile) || m.supports(MirrorResource::Osz2File)
            })
            .cloned()
            .collect();

        Ok(Self {
            archives: build_pool(
                MirrorResource::OszFile,
                archive_members,
                &store,
                &options,
            ),
            backgrounds: build_pool(
                MirrorResource::BackgroundImage,
                members_for(&mirrors, MirrorResource::BackgroundImage),
                &store,
                &options,
            ),
            beatmap_metadata: build_pool(
                MirrorResource::CheesegullBeatmap,
                members_for(&mirrors, MirrorResource::CheesegullBeatmap),
                &store,
                &options,
            ),
            beatmapset_metadata: build_pool(
                MirrorResource::CheesegullBeatmapset,
                members_for(&mirrors, MirrorResource::CheesegullBeatmapset),
                &store,
                &options,
            ),
        })
    }

    /// Fetch a beatmapset archive (ZIP bytes). `None` maps to HTTP 404.
    pub async fn fetch_archive(
        &self,
        beatmapset_id: u32,
    ) -> Result<Option<Bytes>, AggregateError> {
        match &self.archives {
            Some(pool) => pool.fetch(beatmapset_id).await,
            None => Ok(None),
        }
    }

    /// Fetch a beatmap background image. `None` maps to HTTP 404.
    pub async fn fetch_background_image(
        &self,
        beatmap_id: u32,
    ) -> Result<Option<Bytes>, AggregateError> {
        match &self.backgrounds {
            Some(pool) => pool.fetch(beatmap_id).await,
            None => Ok(None),
        }
    }

    /// Fetch cheesegull-shaped beatmap metadata as parsed JSON.
    pub async fn fetch_metadata_beatmap(
        &self,
        beatmap_id: u32,
    ) -> Result<Option<serde_json::Value>, AggregateError> {
        parse_metadata(match &self.beatmap_metadata {
            Some(pool) => pool.fetch(beatmap_id).await?,
            None => None,
        })
    }

    /// Fetch cheesegull-shaped beatmapset metadata as parsed JSON.
    pub async fn fetch_metadata_beatmapset(
        &self,
        beatmapset_id: u32,
    ) -> Result<Option<serde_json::Value>, AggregateError> {
        parse_metadata(match &self.beatmapset_metadata {
            Some(pool) => pool.fetch(beatmapset_id).await?,
            None => None,
        })
    }
}

fn members_for(mirrors: &[Arc<Mirror>], resource: MirrorResource) -> Vec<Arc<Mirror>> {
    mirrors
        .iter()
        .filter(|m| m.supports(resource))
        .cloned()
        .collect()
}

fn build_pool(
    resource: MirrorResource,
    members: Vec<Arc<Mirror>>,
    store: &Arc<dyn MirrorRequestStore>,
    options: &AggregateOptions,
) -> Option<MirrorAggregate> {
    if members.is_empty() {
        warn!("⚠️ No configured mirror serves {resource}; those requests will 404");
        return None;
    }
    Some(MirrorAggregate::new(
        resource,
        members,
        Arc::clone(store),
        options.clone(),
    ))
}

/// The orchestrator already validated the bytes as JSON; a parse failure
/// here would be a bug, not an upstream problem.
fn parse_metadata(
    bytes: Option<Bytes>,
) -> Result<Option<serde_json::Value>, AggregateError> {
    let Some(bytes) = bytes else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            error!("❌ Validated metadata failed to re-parse: {e}");
            Ok(None)
        }
    }
}
