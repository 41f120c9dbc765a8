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

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use mirrorbolt::mirrors::MirrorResource;
    use mirrorbolt::telemetry::{
        MirrorRequestRecord, MirrorRequestStore, derive_weight, memory::MemoryRequestStore,
        percentile,
    };

    fn record(
        mirror_name: &str,
        resource: MirrorResource,
        success: bool,
        latency_ms: i64,
        age: Duration,
    ) -> MirrorRequestRecord {
        let started_at = Utc::now() - age;
        MirrorRequestRecord {
            request_url: format!("http://mirror.test/d/42?via={mirror_name}"),
            api_key_id: None,
            mirror_name: mirror_name.to_string(),
            resource,
            success,
            started_at,
            ended_at: started_at + Duration::milliseconds(latency_ms),
            response_status_code: if success { Some(200) } else { None },
            response_size: if success { 30_000 } else { 0 },
            response_error: (!success).then(|| "connect timeout".to_string()),
        }
    }

    #[test]
    fn test_percentile_interpolates_between_samples() {
        assert_eq!(percentile(&[100.0, 200.0, 300.0], 0.75), Some(250.0));
        assert_eq!(percentile(&[300.0, 100.0, 200.0], 0.5), Some(200.0));
        assert_eq!(percentile(&[42.0], 0.75), Some(42.0));
        assert_eq!(percentile(&[], 0.75), None);
    }

    #[test]
    fn test_derive_weight_latency_only() {
        // p75 of {100, 200, 300} = 250; 1000 * exp(-0.25) = 778.8 -> 778.
        let weight = derive_weight(&[100.0, 200.0, 300.0], Some(0.0), 100);
        assert_eq!(weight, 778);
    }

    #[test]
    fn test_derive_weight_penalizes_failure_rate_heavily() {
        let healthy = derive_weight(&[100.0], Some(0.0), 100);
        let flaky = derive_weight(&[100.0], Some(0.1), 100);
        // exp(-30 * 0.1) ≈ 0.0498: a 10% failure rate costs ~95% of the weight.
        assert!(flaky < healthy / 15, "flaky={flaky}, healthy={healthy}");

        let broken = derive_weight(&[100.0], Some(1.0), 100);
        assert_eq!(broken, 1, "weight is floored at 1, never 0");
    }

    #[test]
    fn test_derive_weight_without_history_uses_initial() {
        assert_eq!(derive_weight(&[], Some(0.5), 100), 100);
        assert_eq!(derive_weight(&[100.0], None, 100), 100);
        assert_eq!(derive_weight(&[], None, 250), 250);
    }

    #[tokio::test]
    async fn test_memory_store_round_trip_weight() {
        let store = MemoryRequestStore::new(100, 4);
        for latency_ms in [100, 200, 300] {
            store
                .create(record(
                    "mino",
                    MirrorResource::OszFile,
                    true,
                    latency_ms,
                    Duration::minutes(10),
                ))
                .await
                .unwrap();
        }

        let weight = store
            .mirror_weight("mino", MirrorResource::OszFile)
            .await
            .unwrap();
        assert_eq!(weight, 778);
    }

    #[tokio::test]
    async fn test_memory_store_empty_window_returns_initial_weight() {
        let store = MemoryRequestStore::new(100, 4);
        let weight = store
            .mirror_weight("mino", MirrorResource::OszFile)
            .await
            .unwrap();
        assert_eq!(weight, 100);
    }

    #[tokio::test]
    async fn test_failure_only_history_returns_initial_weight() {
        // No successful rows means no latency sample; a brand-new mirror and
        // a fully-failing one both get the initial weight (the breaker, not
        // the weighting, is what shields a fully-failing mirror).
        let store = MemoryRequestStore::new(100, 4);
        for _ in 0..5 {
            store
                .create(record(
                    "mino",
                    MirrorResource::OszFile,
                    false,
                    0,
                    Duration::minutes(1),
                ))
                .await
                .unwrap();
        }
        let weight = store
            .mirror_weight("mino", MirrorResource::OszFile)
            .await
            .unwrap();
        assert_eq!(weight, 100);
    }

    #[tokio::test]
    async fn test_mixed_history_applies_failure_rate() {
        let store = MemoryRequestStore::new(100, 4);
        // Two successes at 100ms, two failures: F = 0.5.
        for success in [true, true, false, false] {
            store
                .create(record(
                    "mino",
                    MirrorResource::OszFile,
                    success,
                    100,
                    Duration::minutes(1),
                ))
                .await
                .unwrap();
        }

        let weight = store
            .mirror_weight("mino", MirrorResource::OszFile)
            .await
            .unwrap();
        // 1000 * exp(-0.1) * exp(-15) ≈ 0.0003 -> floored to 1.
        assert_eq!(weight, 1);
    }

    #[tokio::test]
    async fn test_weights_are_scoped_per_resource() {
        let store = MemoryRequestStore::new(100, 4);
        store
            .create(record(
                "mino",
                MirrorResource::OszFile,
                true,
                100,
                Duration::minutes(1),
            ))
            .await
            .unwrap();

        let archive_weight = store
            .mirror_weight("mino", MirrorResource::OszFile)
            .await
            .unwrap();
        let background_weight = store
            .mirror_weight("mino", MirrorResource::BackgroundImage)
            .await
            .unwrap();

        assert_eq!(archive_weight, 904); // 1000 * exp(-0.1)
        assert_eq!(background_weight, 100, "other resources see no history");
    }

    #[tokio::test]
    async fn test_rows_outside_the_window_are_ignored_and_pruned() {
        let store = MemoryRequestStore::new(100, 4);
        store
            .create(record(
                "mino",
                MirrorResource::OszFile,
                true,
                5000,
                Duration::hours(5),
            ))
            .await
            .unwrap();

        let weight = store
            .mirror_weight("mino", MirrorResource::OszFile)
            .await
            .unwrap();
        assert_eq!(weight, 100, "expired rows must not influence the weight");

        // The next insert prunes the expired row.
        store
            .create(record(
                "mino",
                MirrorResource::OszFile,
                true,
                100,
                Duration::minutes(1),
            ))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }
}
