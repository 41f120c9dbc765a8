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

use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::mirrors::{Mirror, MirrorResource};
use crate::selectors::SelectorError;
use crate::telemetry::MirrorRequestStore;

/// Cursor state of the weighted round-robin cycle. The weight snapshot is
/// taken at refresh time so one selection cycle is self-consistent even
/// while another pool refreshes the same mirrors concurrently.
#[derive(Debug)]
struct Cursor {
    index: i64,
    current_weight: i64,
    max_weight: u32,
    gcd_weight: u32,
    weights: Vec<u32>,
}

/// Dynamic weighted round-robin over a fixed mirror list.
///
/// The classical Nginx-style interleaving: each pass lowers the weight bar
/// by the gcd of all weights, and a mirror is picked when its weight meets
/// the bar. Over one full cycle every mirror is selected proportionally to
/// its weight, with heavier mirrors interleaved rather than clustered.
pub struct DynamicWeightedRoundRobin {
    mirrors: Vec<Arc<Mirror>>,
    resource: MirrorResource,
    cursor: Mutex<Cursor>,
}

impl DynamicWeightedRoundRobin {
    pub fn new(mirrors: Vec<Arc<Mirror>>, resource: MirrorResource) -> Self {
        let weights: Vec<u32> = mirrors.iter().map(|m| m.weight()).collect();
        let cursor = Cursor {
            index: -1,
            current_weight: 0,
            max_weight: weights.iter().copied().max().unwrap_or(0),
            gcd_weight: gcd_of(&weights),
            weights,
        };
        Self {
            mirrors,
            resource,
            cursor: Mutex::new(cursor),
        }
    }

    pub fn mirrors(&self) -> &[Arc<Mirror>] {
        &self.mirrors
    }

    pub fn num_mirrors(&self) -> usize {
        self.mirrors.len()
    }

    /// Picks the next mirror of the cycle.
    ///
    /// The loop is capped at `N × (max_weight / gcd_weight) × 2` iterations;
    /// hitting the cap is impossible for well-formed weights and treated as
    /// a fatal bug signal.
    pub fn select_mirror(&self) -> Result<Arc<Mirror>, SelectorError> {
        let mut cursor = self.cursor.lock().unwrap();
        let n = self.mirrors.len() as i64;

        let cap = self.mirrors.len()
            * (cursor.max_weight as usize / cursor.gcd_weight.max(1) as usize).max(1)
            * 2;

        for _ in 0..cap {
            cursor.index = (cursor.index + 1) % n;
            if cursor.index == 0 {
                cursor.current_weight -= cursor.gcd_weight as i64;
                if cursor.current_weight <= 0 {
                    cursor.current_weight = cursor.max_weight as i64;
                    if cursor.current_weight == 0 {
                        return Err(SelectorError::AllWeightsZero);
                    }
                }
            }

            let index = cursor.index as usize;
            if cursor.weights[index] as i64 >= cursor.current_weight {
                return Ok(Arc::clone(&self.mirrors[index]));
            }
        }

        Err(SelectorError::IterationCapExceeded { iterations: cap })
    }

    /// Re-reads every mirror's weight from the telemetry store and
    /// recomputes the cycle bounds. The cursor position is kept so the
    /// interleaving stays smooth across refreshes.
    ///
    /// A store error leaves that mirror's previous weight in place; routing
    /// on slightly stale weights beats failing the request.
    pub async fn refresh_weights(&self, store: &dyn MirrorRequestStore) {
        for mirror in &self.mirrors {
            match store.mirror_weight(mirror.name(), self.resource).await {
                Ok(weight) => {
                    debug!(
                        "Mirror {} has weight {weight} for {}",
                        mirror.name(),
                        self.resource
                    );
                    mirror.set_weight(weight);
                }
                Err(e) => {
                    warn!(
                        "⚠️ Failed to refresh weight for mirror '{}': {e}; keeping {}",
                        mirror.name(),
                        mirror.weight()
                    );
                }
            }
        }

        let weights: Vec<u32> = self.mirrors.iter().map(|m| m.weight()).collect();
        let mut cursor = self.cursor.lock().unwrap();
        cursor.max_weight = weights.iter().copied().max().unwrap_or(0);
        cursor.gcd_weight = gcd_of(&weights);
        cursor.weights = weights;
        // A refresh that lowers max_weight would strand the bar above every
        // weight for many dead passes; clamp so the next pass can select.
        if cursor.current_weight > cursor.max_weight as i64 {
            cursor.current_weight = cursor.max_weight as i64;
        }
    }
}

/// gcd over the weight list; for a single element this is the element.
fn gcd_of(weights: &[u32]) -> u32 {
    weights.iter().copied().fold(0, gcd)
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}
