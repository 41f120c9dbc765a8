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
    use async_trait::async_trait;
    use bytes::Bytes;
    use mirrorbolt::aggregate::{AggregateOptions, MirrorAggregate};
    use mirrorbolt::config::SelectionStrategy;
    use mirrorbolt::mirrors::{Mirror, MirrorBackend, MirrorResource, MirrorResponse};
    use mirrorbolt::resilience::{CircuitBreaker, CircuitState, MirrorHealth};
    use mirrorbolt::selectors::hedged::race_first_valid;
    use mirrorbolt::telemetry::{
        MirrorRequestRecord, MirrorRequestStore, TelemetryError, memory::MemoryRequestStore,
    };
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::time::sleep;

    /// One scripted upstream reaction per attempt; the fallback repeats
    /// once the queue drains.
    #[derive(Clone)]
    enum Script {
        Serve(Vec<u8>),
        ServeAfter(u64, Vec<u8>),
        Absent,
        Fail,
    }

    /// Mirror backend driven by a script instead of a network. Every
    /// attempt is appended to a log shared across backends so tests can
    /// assert the exact attempt order.
    struct ScriptedBackend {
        name: String,
        base_url: String,
        supported: HashSet<MirrorResource>,
        script: Mutex<VecDeque<Script>>,
        fallback: Script,
        attempt_log: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedBackend {
        fn next(&self) -> Script {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    #[async_trait]
    impl MirrorBackend for ScriptedBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn base_url(&self) -> &str {
            &self.base_url
        }

        fn supported_resources(&self) -> &HashSet<MirrorResource> {
            &self.supported
        }

        async fn fetch_archive(&self, beatmapset_id: u32) -> MirrorResponse<Bytes> {
            self.attempt_log.lock().unwrap().push(self.name.clone());
            let url = format!("{}/d/{beatmapset_id}", self.base_url);
            match self.next() {
                Script::Serve(bytes) => MirrorResponse::hit(Bytes::from(bytes), url, 200),
                Script::ServeAfter(delay_ms, bytes) => {
                    sleep(Duration::from_millis(delay_ms)).await;
                    MirrorResponse::hit(Bytes::from(bytes), url, 200)
                }
                Script::Absent => MirrorResponse::absent(url, 404),
                Script::Fail => {
                    MirrorResponse::failure(Some(url), None, "connect timeout".to_string())
                }
            }
        }
    }

    /// Telemetry stub with pinned weights, for scenarios that need an exact
    /// selection distribution regardless of history.
    struct FixedWeightStore {
        weights: HashMap<String, u32>,
        rows: Mutex<Vec<MirrorRequestRecord>>,
    }

    impl FixedWeightStore {
        fn new(weights: &[(&str, u32)]) -> Self {
            Self {
                weights: weights
                    .iter()
                    .map(|(name, w)| (name.to_string(), *w))
                    .collect(),
                rows: Mutex::new(Vec::new()),
            }
        }

        fn rows(&self) -> Vec<MirrorRequestRecord> {
            self.rows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MirrorRequestStore for FixedWeightStore {
        async fn create(&self, record: MirrorRequestRecord) -> Result<(), TelemetryError> {
            self.rows.lock().unwrap().push(record);
            Ok(())
        }

        async fn mirror_weight(
            &self,
            mirror_name: &str,
            _resource: MirrorResource,
        ) -> Result<u32, TelemetryError> {
            Ok(self.weights.get(mirror_name).copied().unwrap_or(100))
        }
    }

    fn zip_bytes(len: usize) -> Vec<u8> {
        let mut bytes = vec![0x50, 0x4B, 0x03, 0x04];
        bytes.resize(len.max(4), 0xAA);
        bytes
    }

    fn scripted_mirror(
        name: &str,
        script: Vec<Script>,
        fallback: Script,
        attempt_log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<Mirror> {
        let backend = ScriptedBackend {
            name: name.to_string(),
            base_url: format!("http://{name}.test"),
            supported: HashSet::from([MirrorResource::OszFile]),
            script: Mutex::new(script.into()),
            fallback,
            attempt_log: Arc::clone(attempt_log),
        };
        let health = MirrorHealth::new(CircuitBreaker::new(3, Duration::from_secs(30)), None);
        Arc::new(Mirror::new(Box::new(backend), 100, health))
    }

    fn archive_pool(
        mirrors: Vec<Arc<Mirror>>,
        store: Arc<dyn MirrorRequestStore>,
        options: AggregateOptions,
    ) -> MirrorAggregate {
        MirrorAggregate::new(MirrorResource::OszFile, mirrors, store, options)
    }

    #[tokio::test]
    async fn test_weighted_distribution_over_eight_fetches() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let payload = zip_bytes(30_000);
        let m1 = scripted_mirror("m1", vec![], Script::Serve(payload.clone()), &log);
        let m2 = scripted_mirror("m2", vec![], Script::Serve(payload.clone()), &log);

        let store = Arc::new(FixedWeightStore::new(&[("m1", 3), ("m2", 1)]));
        let pool = archive_pool(
            vec![m1, m2],
            Arc::clone(&store) as Arc<dyn MirrorRequestStore>,
            AggregateOptions::default(),
        );

        for _ in 0..8 {
            let data = pool.fetch(123).await.unwrap().expect("archive served");
            assert_eq!(&data[..], &payload[..]);
        }

        let attempts = log.lock().unwrap().clone();
        let m1_count = attempts.iter().filter(|n| n.as_str() == "m1").count();
        let m2_count = attempts.iter().filter(|n| n.as_str() == "m2").count();
        assert_eq!((m1_count, m2_count), (6, 2), "attempts: {attempts:?}");

        let rows = store.rows();
        assert_eq!(rows.len(), 8);
        assert!(rows.iter().all(|r| r.success));
        assert!(rows.iter().all(|r| r.response_size == 30_000));
    }

    #[tokio::test]
    async fn test_failed_mirror_is_not_retried_consecutively() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m1 = scripted_mirror(
            "m1",
            vec![Script::Fail],
            Script::Serve(zip_bytes(30_000)),
            &log,
        );
        let m2 = scripted_mirror("m2", vec![], Script::Serve(zip_bytes(30_000)), &log);

        let store = Arc::new(MemoryRequestStore::new(100, 4));
        let pool = archive_pool(
            vec![m1, m2],
            Arc::clone(&store) as Arc<dyn MirrorRequestStore>,
            AggregateOptions::default(),
        );

        let data = pool.fetch(7).await.unwrap();
        assert!(data.is_some());

        let attempts = log.lock().unwrap().clone();
        assert_eq!(attempts, vec!["m1", "m2"], "m1 must not be retried first");
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_ceiling_with_all_mirrors_failing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m1 = scripted_mirror("m1", vec![], Script::Fail, &log);
        let m2 = scripted_mirror("m2", vec![], Script::Fail, &log);

        let store = Arc::new(MemoryRequestStore::new(100, 4));
        let pool = archive_pool(
            vec![m1, m2],
            Arc::clone(&store) as Arc<dyn MirrorRequestStore>,
            AggregateOptions::default(),
        );

        let data = pool.fetch(7).await.unwrap();
        assert!(data.is_none(), "all mirrors failing yields not-found");

        let attempts = log.lock().unwrap().len();
        assert!(attempts <= 4, "ceiling is 2N = 4, saw {attempts}");
        assert!(store.len() <= 4);
        assert!(store.snapshot().iter().all(|r| !r.success));
    }

    #[tokio::test]
    async fn test_absence_on_every_mirror_is_not_found_without_penalty() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m1 = scripted_mirror("m1", vec![], Script::Absent, &log);
        let m2 = scripted_mirror("m2", vec![], Script::Absent, &log);
        let m1_handle = Arc::clone(&m1);

        let store = Arc::new(MemoryRequestStore::new(100, 4));
        let pool = archive_pool(
            vec![m1, m2],
            Arc::clone(&store) as Arc<dyn MirrorRequestStore>,
            AggregateOptions::default(),
        );

        let data = pool.fetch(404_404).await.unwrap();
        assert!(data.is_none());

        // Exactly one attempt per mirror: an authoritative 404 is final.
        let attempts = log.lock().unwrap().clone();
        assert_eq!(attempts.len(), 2, "attempts: {attempts:?}");

        let rows = store.snapshot();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.success), "absence is not failure");
        assert!(rows.iter().all(|r| r.response_status_code == Some(404)));

        // And the breaker never moved.
        m1_handle.with_health(|health| {
            assert_eq!(health.circuit.state, CircuitState::Closed);
            assert_eq!(health.circuit.consecutive_failures, 0);
        });
    }

    #[tokio::test]
    async fn test_breaker_opens_and_bypasses_the_mirror() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m1 = scripted_mirror("m1", vec![], Script::Fail, &log);
        let m1_handle = Arc::clone(&m1);

        let store = Arc::new(MemoryRequestStore::new(100, 4));
        let pool = archive_pool(
            vec![m1],
            Arc::clone(&store) as Arc<dyn MirrorRequestStore>,
            AggregateOptions::default(),
        );

        // First invocation burns 2 attempts (the 2N ceiling for N=1), the
        // second trips the threshold on its first attempt.
        assert!(pool.fetch(1).await.unwrap().is_none());
        assert!(pool.fetch(1).await.unwrap().is_none());

        m1_handle.with_health(|health| {
            assert_eq!(health.circuit.state, CircuitState::Open);
            assert_eq!(health.circuit.consecutive_failures, 3);
        });
        assert!(!m1_handle.is_available());
        let attempts_so_far = log.lock().unwrap().len();
        assert_eq!(attempts_so_far, 3);

        // While open, invocations skip the mirror entirely: no new attempts.
        assert!(pool.fetch(1).await.unwrap().is_none());
        assert_eq!(log.lock().unwrap().len(), attempts_so_far);

        // After the cooldown, exactly one probe is admitted.
        m1_handle.with_health(|health| {
            health.circuit.opened_at = Some(Instant::now() - Duration::from_secs(31));
        });
        assert!(m1_handle.is_available(), "cooldown elapsed: probe admitted");
        assert!(!m1_handle.is_available(), "probe outcome still pending");
    }

    #[tokio::test]
    async fn test_undersized_archive_fails_validation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        // Valid magic but only 4 bytes; the stricter deployment rejects it.
        let m1 = scripted_mirror("m1", vec![], Script::Serve(zip_bytes(4)), &log);
        let m2 = scripted_mirror("m2", vec![], Script::Serve(zip_bytes(30_000)), &log);

        let store = Arc::new(MemoryRequestStore::new(100, 4));
        let pool = archive_pool(
            vec![m1, m2],
            Arc::clone(&store) as Arc<dyn MirrorRequestStore>,
            AggregateOptions {
                min_archive_size_bytes: 20_000,
                ..AggregateOptions::default()
            },
        );

        let data = pool.fetch(9).await.unwrap().expect("m2 serves the archive");
        assert_eq!(data.len(), 30_000);

        let rows = store.snapshot();
        let m1_row = rows.iter().find(|r| r.mirror_name == "m1").unwrap();
        assert!(!m1_row.success, "serving garbage counts as a failure");
        assert!(m1_row.response_error.is_some());
        let m2_row = rows.iter().find(|r| r.mirror_name == "m2").unwrap();
        assert!(m2_row.success);
    }

    #[tokio::test]
    async fn test_bad_magic_fails_validation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m1 = scripted_mirror("m1", vec![], Script::Serve(vec![0u8; 30_000]), &log);
        let m2 = scripted_mirror("m2", vec![], Script::Serve(zip_bytes(30_000)), &log);

        let store = Arc::new(MemoryRequestStore::new(100, 4));
        let pool = archive_pool(
            vec![m1, m2],
            Arc::clone(&store) as Arc<dyn MirrorRequestStore>,
            AggregateOptions::default(),
        );

        let data = pool.fetch(9).await.unwrap().expect("m2 serves the archive");
        assert!(data.starts_with(&[0x50, 0x4B, 0x03, 0x04]));

        let attempts = log.lock().unwrap().clone();
        assert_eq!(attempts, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_hedged_race_serves_the_fastest_mirror() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow_payload = zip_bytes(25_000);
        let mut fast_payload = zip_bytes(25_000);
        fast_payload[10] = 0xBB; // distinguishable winner

        let m1 = scripted_mirror(
            "m1",
            vec![],
            Script::ServeAfter(500, slow_payload),
            &log,
        );
        let m2 = scripted_mirror(
            "m2",
            vec![],
            Script::ServeAfter(50, fast_payload.clone()),
            &log,
        );

        let store = Arc::new(MemoryRequestStore::new(100, 4));
        let pool = archive_pool(
            vec![m1, m2],
            Arc::clone(&store) as Arc<dyn MirrorRequestStore>,
            AggregateOptions {
                strategy: SelectionStrategy::Hedged,
                ..AggregateOptions::default()
            },
        );

        let data = pool.fetch(55).await.unwrap().expect("winner serves");
        assert_eq!(&data[..], &fast_payload[..], "fastest valid answer wins");

        // Both racers launched; the loser was cancelled, so at most two
        // rows exist and at least the winner's.
        assert_eq!(log.lock().unwrap().len(), 2);
        let rows = store.snapshot();
        assert!(!rows.is_empty() && rows.len() <= 2, "rows: {}", rows.len());
        assert!(rows.iter().any(|r| r.mirror_name == "m2" && r.success));
    }

    #[tokio::test]
    async fn test_hedged_race_falls_back_to_remaining_mirrors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m1 = scripted_mirror("m1", vec![], Script::Fail, &log);
        let m2 = scripted_mirror("m2", vec![], Script::Fail, &log);
        let m3 = scripted_mirror("m3", vec![], Script::Serve(zip_bytes(30_000)), &log);

        let store = Arc::new(MemoryRequestStore::new(100, 4));
        let pool = archive_pool(
            vec![m1, m2, m3],
            Arc::clone(&store) as Arc<dyn MirrorRequestStore>,
            AggregateOptions {
                strategy: SelectionStrategy::Hedged,
                hedge_count: 2,
                ..AggregateOptions::default()
            },
        );

        let data = pool.fetch(77).await.unwrap();
        assert!(data.is_some(), "sequential fallback must find m3");
        assert!(log.lock().unwrap().contains(&"m3".to_string()));
    }

    #[tokio::test]
    async fn test_race_returns_first_valid_and_drops_losers() {
        type Attempt = std::pin::Pin<
            Box<dyn std::future::Future<Output = Option<&'static str>> + Send>,
        >;
        let attempts: Vec<Attempt> = vec![
            Box::pin(async {
                sleep(Duration::from_millis(200)).await;
                Some("slow")
            }),
            Box::pin(async {
                sleep(Duration::from_millis(10)).await;
                Some("fast")
            }),
        ];
        let winner = race_first_valid(attempts).await;
        assert_eq!(winner, Some("fast"));
    }

    #[tokio::test]
    async fn test_race_with_no_valid_outcome_returns_none() {
        let attempts: Vec<_> = (0..3)
            .map(|_| async { None::<&str> })
            .collect();
        let winner = race_first_valid(attempts).await;
        assert!(winner.is_none());
    }
}
