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

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::mirrors::Mirror;

/// Filters the pool down to currently-available mirrors and orders them by
/// latency EMA, fastest first. Availability consumes a rate-limit token per
/// mirror, which is the admission for the attempt about to be raced.
pub fn rank_available(mirrors: &[Arc<Mirror>]) -> Vec<Arc<Mirror>> {
    let mut available: Vec<Arc<Mirror>> = mirrors
        .iter()
        .filter(|m| m.is_available())
        .cloned()
        .collect();
    available.sort_by(|a, b| {
        a.latency_ema()
            .partial_cmp(&b.latency_ema())
            .unwrap_or(Ordering::Equal)
    });
    available
}

/// Races the given attempt futures and returns the first that resolves to
/// `Some`. The remaining siblings are aborted on the spot; any sibling that
/// completed before the winner has already had its side effects (telemetry
/// row, health update) applied inside its own future.
///
/// Returns `None` if every attempt completed without producing a winner.
pub async fn race_first_valid<T, F>(attempts: Vec<F>) -> Option<T>
where
    T: Send + 'static,
    F: Future<Output = Option<T>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for attempt in attempts {
        set.spawn(attempt);
    }

    while let Some(joined) = set.join_next().await {
        // Aborted or panicked siblings are simply losers of the race.
        if let Ok(Some(winner)) = joined {
            set.abort_all();
            return Some(winner);
        }
    }
    None
}
