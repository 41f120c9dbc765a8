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

pub mod memory;
pub mod mysql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::mirrors::MirrorResource;

/// One appended row per upstream attempt. Rows are never updated; they only
/// feed the sliding-window aggregations behind `mirror_weight`.
#[derive(Debug, Clone)]
pub struct MirrorRequestRecord {
    pub request_url: String,
    pub api_key_id: Option<String>,
    pub mirror_name: String,
    pub resource: MirrorResource,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub response_status_code: Option<u16>,
    pub response_size: u64,
    pub response_error: Option<String>,
}

impl MirrorRequestRecord {
    /// Attempt duration in milliseconds, as persisted.
    pub fn latency_ms(&self) -> f64 {
        (self.ended_at - self.started_at).num_microseconds().unwrap_or(0) as f64 / 1000.0
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Append-only request log with one read-side aggregation.
#[async_trait]
pub trait MirrorRequestStore: Send + Sync {
    /// Single-row insert.
    async fn create(&self, record: MirrorRequestRecord) -> Result<(), TelemetryError>;

    /// Weighting for `(mirror_name, resource)` over the sliding window,
    /// derived from p75 success latency and overall failure rate.
    async fn mirror_weight(
        &self,
        mirror_name: &str,
        resource: MirrorResource,
    ) -> Result<u32, TelemetryError>;
}

/// Maps windowed telemetry into a selection weight.
///
/// Mirrors with no successful history get `initial_weight` so they receive
/// competitive traffic until real data exists. Otherwise the p75 success
/// latency and the failure rate are pushed through exponential decays:
/// even modest failure rates are penalized heavily (F = 0.1 halves the
/// weight more than twentyfold) while latency differences stay smooth.
pub fn derive_weight(
    success_latencies_ms: &[f64],
    failure_rate: Option<f64>,
    initial_weight: u32,
) -> u32 {
    let Some(p75_ms) = percentile(success_latencies_ms, 0.75) else {
        return initial_weight;
    };
    let Some(failure_rate) = failure_rate else {
        return initial_weight;
    };

    let latency_weight = 1000.0 * (-p75_ms / 1000.0).exp();
    let failure_weight = (-30.0 * failure_rate).exp();
    ((latency_weight * failure_weight) as u32).max(1)
}

/// Linearly-interpolated percentile (`p` in `0.0..=1.0`) of an unsorted
/// sample. Returns `None` for an empty sample.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    Some(sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo]))
}
