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
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use tracing::info;

use crate::mirrors::MirrorResource;
use crate::telemetry::{MirrorRequestRecord, MirrorRequestStore, TelemetryError, derive_weight};

/// MySQL-backed telemetry store. Multiple gateway instances pointed at the
/// same database share telemetry, so weight refreshes learn from each
/// other's traffic.
///
/// Success latencies are fetched and the percentile is computed client-side
/// (`derive_weight`), keeping the MySQL and in-memory stores bit-identical
/// in their weighting.
pub struct MySqlRequestStore {
    pool: MySqlPool,
    initial_weight: u32,
    window: Duration,
}

impl MySqlRequestStore {
    pub async fn connect(
        dsn: &str,
        initial_weight: u32,
        window_hours: u32,
    ) -> Result<Self, TelemetryError> {
        let pool = MySqlPoolOptions::new().connect(dsn).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        info!("✅ Telemetry store connected (MySQL)");
        Ok(Self::with_pool(pool, initial_weight, window_hours))
    }

    pub fn with_pool(pool: MySqlPool, initial_weight: u32, window_hours: u32) -> Self {
        Self {
            pool,
            initial_weight,
            window: Duration::hours(window_hours as i64),
        }
    }
}

#[async_trait]
impl MirrorRequestStore for MySqlRequestStore {
    async fn create(&self, record: MirrorRequestRecord) -> Result<(), TelemetryError> {
        sqlx::query(
            r#"
            INSERT INTO beatmap_mirror_requests (
                request_url, api_key_id, mirror_name, resource, success,
                started_at, ended_at, response_status_code, response_size,
                response_error
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.request_url)
        .bind(&record.api_key_id)
        .bind(&record.mirror_name)
        .bind(record.resource.as_str())
        .bind(record.success)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.response_status_code.map(|c| c as i32))
        .bind(record.response_size as i64)
        .bind(&record.response_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mirror_weight(
        &self,
        mirror_name: &str,
        resource: MirrorResource,
    ) -> Result<u32, TelemetryError> {
        let cutoff = Utc::now() - self.window;

        let success_latencies_ms: Vec<f64> = sqlx::query_scalar(
            r#"
            SELECT CAST(TIMESTAMPDIFF(MICROSECOND, started_at, ended_at) / 1000.0 AS DOUBLE)
            FROM beatmap_mirror_requests
            WHERE started_at > ?
              AND mirror_name = ?
              AND resource = ?
              AND success = 1
            "#,
        )
        .bind(cutoff)
        .bind(mirror_name)
        .bind(resource.as_str())
        .fetch_all(&self.pool)
        .await?;

        let failure_rate: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT CAST(AVG(success = 0) AS DOUBLE)
            FROM beatmap_mirror_requests
            WHERE started_at > ?
              AND mirror_name = ?
              AND resource = ?
            "#,
        )
        .bind(cutoff)
        .bind(mirror_name)
        .bind(resource.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(derive_weight(
            &success_latencies_ms,
            failure_rate,
            self.initial_weight,
        ))
    }
}
