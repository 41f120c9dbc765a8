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

pub mod hedged;
pub mod round_robin;

pub use round_robin::DynamicWeightedRoundRobin;

use thiserror::Error;

/// Fatal selector conditions. Neither can occur for well-formed weights;
/// both signal a bug rather than an upstream problem.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("all mirrors have 0 weight")]
    AllWeightsZero,

    #[error("selection did not terminate within {iterations} iterations")]
    IterationCapExceeded { iterations: usize },
}
