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
use chrono::Utc;
use metrics::{counter, histogram};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SelectionStrategy;
use crate::mirrors::{Mirror, MirrorResource};
use crate::selectors::{DynamicWeightedRoundRobin, SelectorError, hedged};
use crate::telemetry::{MirrorRequestRecord, MirrorRequestStore};

/// ZIP local-file-header signature every served archive must start with.
pub const ZIP_FILE_HEADER: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Fatal orchestrator conditions. Upstream failures never surface here;
/// they are absorbed by the retry loop and reported as `Ok(None)`.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("mirror selection failed: {0}")]
    Selector(#[from] SelectorError),
}

/// Per-pool orchestrator tuning, resolved from config at startup.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub strategy: SelectionStrategy,
    pub hedge_count: usize,
    pub min_archive_size_bytes: usize,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Dwrr,
            hedge_count: 2,
            min_archive_size_bytes: 0,
        }
    }
}

/// Judged result of a single upstream attempt, after validation and after
/// the attempt's telemetry row and health update have been applied.
enum AttemptOutcome {
    /// Valid payload; the caller serves it.
    Served(Bytes),
    /// The mirror authoritatively answered not-found (404/451).
    Absent,
    /// Transport error, bad status, or validation failure.
    Failed,
}

/// Routes fetches for one resource kind across a pool of mirrors,
/// re-weighting the pool from telemetry after every attempt.
pub struct MirrorAggregate {
    resource: MirrorResource,
    mirrors: Vec<Arc<Mirror>>,
    selector: DynamicWeightedRoundRobin,
    store: Arc<dyn MirrorRequestStore>,
    options: AggregateOptions,
}

impl MirrorAggregate {
    pub fn new(
        resource: MirrorResource,
        mirrors: Vec<Arc<Mirror>>,
        store: Arc<dyn MirrorRequestStore>,
        options: AggregateOptions,
    ) -> Self {
        let selector = DynamicWeightedRoundRobin::new(mirrors.clone(), resource);
        Self {
            resource,
            mirrors,
            selector,
            store,
            options,
        }
    }

    pub fn resource(&self) -> MirrorResource {
        self.resource
    }

    pub fn mirrors(&self) -> &[Arc<Mirror>] {
        &self.mirrors
    }

    /// Fetch the resource with the given id by any means necessary,
    /// balancing across the underlying mirrors for the best possible
    /// availability and performance.
    ///
    /// `Ok(None)` means authoritative not-found or every mirror exhausted;
    /// an `Err` is a fatal internal inconsistency, never an upstream error.
    pub async fn fetch(&self, id: u32) -> Result<Option<Bytes>, AggregateError> {
        self.selector.refresh_weights(self.store.as_ref()).await;
        match self.options.strategy {
            SelectionStrategy::Dwrr => self.fetch_round_robin(id).await,
            SelectionStrategy::Hedged => self.fetch_hedged(id).await,
        }
    }

    /// Weighted round-robin retry loop.
    ///
    /// At most one mirror is attempted per iteration; the previous mirror is
    /// not retried on consecutive iterations while an alternative remains,
    /// and the whole invocation gives up after `2 × N` attempts.
    async fn fetch_round_robin(&self, id: u32) -> Result<Option<Bytes>, AggregateError> {
        let n = self.mirrors.len();
        let max_attempts = 2 * n;
        let mut attempts = 0usize;
        let mut skipped = 0usize;
        let mut prev: Option<String> = None;
        let mut absent_on: HashSet<String> = HashSet::new();

        while attempts < max_attempts {
            let mirror = self.selector.select_mirror()?;
            let name = mirror.name().to_string();

            if n > 1 && prev.as_deref() == Some(name.as_str()) {
                let others_viable = self
                    .mirrors
                    .iter()
                    .any(|m| m.name() != name && !absent_on.contains(m.name()));
                if others_viable {
                    continue;
                }
                // No alternative left; retrying the same mirror beats
                // giving up with attempts remaining.
            }

            if absent_on.contains(&name) || !mirror.is_available() {
                skipped += 1;
                if skipped >= 2 * n {
                    warn!(
                        "⛔ No available mirror for {} {id}: breakers open or rate limits hit",
                        self.resource
                    );
                    return Ok(None);
                }
                continue;
            }
            skipped = 0;
            attempts += 1;

            let outcome = attempt_once(
                Arc::clone(&mirror),
                self.resource,
                id,
                Arc::clone(&self.store),
                self.options.min_archive_size_bytes,
            )
            .await;
            self.selector.refresh_weights(self.store.as_ref()).await;

            match outcome {
                AttemptOutcome::Served(data) => return Ok(Some(data)),
                AttemptOutcome::Absent => {
                    absent_on.insert(name);
                    if absent_on.len() == n {
                        info!(
                            "Resource {} {id} is absent on every configured mirror",
                            self.resource
                        );
                        return Ok(None);
                    }
                    // The absent set already excludes this mirror from
                    // re-selection; no thrash guard needed.
                    prev = None;
                }
                AttemptOutcome::Failed => {
                    prev = Some(name);
                }
            }
        }

        warn!(
            "⛔ Exhausted {max_attempts} attempts fetching {} {id}; giving up",
            self.resource
        );
        Ok(None)
    }

    /// Hedged race: fire the `hedge_count` lowest-latency available mirrors
    /// concurrently and serve the first valid answer, cancelling the rest.
    /// Falls back to sequential attempts over the remaining mirrors.
    async fn fetch_hedged(&self, id: u32) -> Result<Option<Bytes>, AggregateError> {
        let ranked = hedged::rank_available(&self.mirrors);
        if ranked.is_empty() {
            warn!(
                "⛔ No available mirror for hedged fetch of {} {id}",
                self.resource
            );
            return Ok(None);
        }

        let k = self.options.hedge_count.min(ranked.len());
        let (racers, rest) = ranked.split_at(k);

        let attempts: Vec<_> = racers
            .iter()
            .map(|mirror| {
                let mirror = Arc::clone(mirror);
                let store = Arc::clone(&self.store);
                let resource = self.resource;
                let min_archive_size = self.options.min_archive_size_bytes;
                async move {
                    match attempt_once(mirror, resource, id, store, min_archive_size).await {
                        AttemptOutcome::Served(data) => Some(data),
                        AttemptOutcome::Absent | AttemptOutcome::Failed => None,
                    }
                }
            })
            .collect();

        if let Some(data) = hedged::race_first_valid(attempts).await {
            self.selector.refresh_weights(self.store.as_ref()).await;
            return Ok(Some(data));
        }

        for mirror in rest {
            let outcome = attempt_once(
                Arc::clone(mirror),
                self.resource,
                id,
                Arc::clone(&self.store),
                self.options.min_archive_size_bytes,
            )
            .await;
            if let AttemptOutcome::Served(data) = outcome {
                self.selector.refresh_weights(self.store.as_ref()).await;
                return Ok(Some(data));
            }
        }

        self.selector.refresh_weights(self.store.as_ref()).await;
        warn!(
            "⛔ Hedged fetch of {} {id} found no valid answer on any mirror",
            self.resource
        );
        Ok(None)
    }
}

/// Resource-specific body-shape check. Archives must carry the ZIP magic
/// (plus the configurable size floor); metadata must parse as JSON.
fn validate_body(
    resource: MirrorResource,
    data: &Bytes,
    min_archive_size: usize,
) -> Result<(), String> {
    match resource {
        MirrorResource::OszFile | MirrorResource::Osz2File => {
            if !data.starts_with(&ZIP_FILE_HEADER) {
                return Err("archive does not start with the ZIP file header".to_string());
            }
            if data.len() < min_archive_size {
                return Err(format!(
                    "archive is {} bytes, below the {min_archive_size} byte floor",
                    data.len()
                ));
            }
            Ok(())
        }
        MirrorResource::CheesegullBeatmap | MirrorResource::CheesegullBeatmapset => {
            serde_json::from_slice::<serde_json::Value>(data)
                .map(|_| ())
                .map_err(|e| format!("metadata is not valid JSON: {e}"))
        }
        MirrorResource::BackgroundImage => Ok(()),
    }
}

/// Runs one full attempt against one mirror: fetch, judge, persist exactly
/// one telemetry row, and update the mirror's health. Shared by the
/// round-robin loop and the hedged race (where it runs inside a spawned
/// task so losers still log their outcome).
async fn attempt_once(
    mirror: Arc<Mirror>,
    resource: MirrorResource,
    id: u32,
    store: Arc<dyn MirrorRequestStore>,
    min_archive_size: usize,
) -> AttemptOutcome {
    let name = mirror.name().to_string();
    let started_at = Utc::now();
    let start = Instant::now();
    let response = mirror.fetch(resource, id).await;
    let ended_at = Utc::now();
    let latency = start.elapsed();

    let response_size = response.data.as_ref().map(|d| d.len()).unwrap_or(0) as u64;
    let request_url = response
        .request_url
        .clone()
        .unwrap_or_else(|| mirror.base_url().to_string());
    let status_code = response.status_code;

    let judged: Result<Option<Bytes>, String> = if response.is_success {
        match response.data {
            Some(data) => validate_body(resource, &data, min_archive_size).map(|_| Some(data)),
            None => Ok(None),
        }
    } else {
        Err(response
            .error_message
            .unwrap_or_else(|| "upstream request failed".to_string()))
    };

    let record = MirrorRequestRecord {
        request_url,
        api_key_id: None,
        mirror_name: name.clone(),
        resource,
        success: judged.is_ok(),
        started_at,
        ended_at,
        response_status_code: status_code,
        response_size,
        response_error: judged.as_ref().err().cloned(),
    };
    if let Err(e) = store.create(record).await {
        // Row loss degrades weighting but must not fail the client request.
        warn!("⚠️ Failed to persist mirror request row: {e}");
    }

    match judged {
        Ok(Some(data)) => {
            mirror.record_success(latency);
            counter!(
                "mirrorbolt_mirror_requests_total",
                "mirror" => name.clone(),
                "outcome" => "success"
            )
            .increment(1);
            histogram!("mirrorbolt_mirror_request_duration_seconds", "mirror" => name.clone())
                .record(latency.as_secs_f64());
            info!(
                "✅ Served {resource} {id} from mirror '{name}' ({} bytes in {}ms)",
                data.len(),
                latency.as_millis()
            );
            AttemptOutcome::Served(data)
        }
        Ok(None) => {
            mirror.record_success(latency);
            counter!(
                "mirrorbolt_mirror_requests_total",
                "mirror" => name.clone(),
                "outcome" => "absent"
            )
            .increment(1);
            info!("Resource {resource} {id} not present on mirror '{name}'");
            AttemptOutcome::Absent
        }
        Err(reason) => {
            mirror.record_failure();
            counter!(
                "mirrorbolt_mirror_requests_total",
                "mirror" => name.clone(),
                "outcome" => "failure"
            )
            .increment(1);
            warn!("⚠️ Mirror '{name}' failed for {resource} {id}: {reason}");
            AttemptOutcome::Failed
        }
    }
}
