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

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Mutex;

use crate::mirrors::MirrorResource;
use crate::telemetry::{MirrorRequestRecord, MirrorRequestStore, TelemetryError, derive_weight};

/// In-memory telemetry store for development and tests. Holds the sliding
/// window in a vec and prunes expired rows on insert; aggregation semantics
/// are identical to the MySQL store because both share `derive_weight`.
pub struct MemoryRequestStore {
    records: Mutex<Vec<MirrorRequestRecord>>,
    initial_weight: u32,
    window: Duration,
}

impl MemoryRequestStore {
    pub fn new(initial_weight: u32, window_hours: u32) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            initial_weight,
            window: Duration::hours(window_hours as i64),
        }
    }

    /// Number of rows currently retained (test observability).
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of retained rows, oldest first (test observability).
    pub fn snapshot(&self) -> Vec<MirrorRequestRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl MirrorRequestStore for MemoryRequestStore {
    async fn create(&self, record: MirrorRequestRecord) -> Result<(), TelemetryError> {
        let cutoff = Utc::now() - self.window;
        let mut records = self.records.lock().unwrap();
        records.retain(|r| r.started_at > cutoff);
        records.push(record);
        Ok(())
    }

    async fn mirror_weight(
        &self,
        mirror_name: &str,
        resource: MirrorResource,
    ) -> Result<u32, TelemetryError> {
        let cutoff = Utc::now() - self.window;
        let records = self.records.lock().unwrap();

        let mut success_latencies_ms = Vec::new();
        let mut total = 0usize;
        let mut failed = 0usize;
        for record in records.iter() {
            if record.started_at <= cutoff
                || record.mirror_name != mirror_name
                || record.resource != resource
            {
                continue;
            }
            total += 1;
            if record.success {
                success_latencies_ms.push(record.latency_ms());
            } else {
                failed += 1;
            }
        }

        let failure_rate = (total > 0).then(|| failed as f64 / total as f64);
        Ok(derive_weight(
            &success_latencies_ms,
            failure_rate,
            self.initial_weight,
        ))
    }
}
