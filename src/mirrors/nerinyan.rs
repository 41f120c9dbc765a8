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
use bytes::Bytes;
use std::collections::HashSet;
use tracing::debug;

use crate::config::HttpTimeouts;
use crate::mirrors::{MirrorBackend, MirrorResource, MirrorResponse, build_http_client};

pub const DEFAULT_BASE_URL: &str = "https://api.nerinyan.moe";

/// Nerinyan — archive-only mirror. Supports an operator-issued rate-limit
/// key, injected as the `x-ratelimit-key` header when configured.
pub struct NerinyanMirror {
    http: reqwest::Client,
    base_url: String,
    ratelimit_key: Option<String>,
    supported: HashSet<MirrorResource>,
}

impl NerinyanMirror {
    pub fn new(
        base_url: Option<String>,
        ratelimit_key: Option<String>,
        timeouts: &HttpTimeouts,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: build_http_client(timeouts)?,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            ratelimit_key,
            supported: HashSet::from([MirrorResource::OszFile]),
        })
    }

    async fn get(&self, url: String) -> MirrorResponse<Bytes> {
        let mut request = self.http.get(&url);
        if let Some(key) = &self.ratelimit_key {
            request = request.header("x-ratelimit-key", key);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let final_url = response.url().to_string();
                if status.as_u16() == 404 || status.as_u16() == 451 {
                    return MirrorResponse::absent(final_url, status.as_u16());
                }
                if !status.is_success() {
                    return MirrorResponse::failure(
                        Some(final_url),
                        Some(status.as_u16()),
                        format!("unexpected upstream status {status}"),
                    );
                }
                match response.bytes().await {
                    Ok(body) => MirrorResponse::hit(body, final_url, status.as_u16()),
                    Err(e) => MirrorResponse::failure(
                        Some(final_url),
                        Some(status.as_u16()),
                        e.to_string(),
                    ),
                }
            }
            Err(e) => {
                MirrorResponse::failure(Some(url), e.status().map(|s| s.as_u16()), e.to_string())
            }
        }
    }
}

#[async_trait]
impl MirrorBackend for NerinyanMirror {
    fn name(&self) -> &str {
        "nerinyan"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn supported_resources(&self) -> &HashSet<MirrorResource> {
        &self.supported
    }

    async fn fetch_archive(&self, beatmapset_id: u32) -> MirrorResponse<Bytes> {
        debug!("Fetching beatmapset archive from nerinyan: {beatmapset_id}");
        self.get(format!("{}/d/{beatmapset_id}", self.base_url)).await
    }
}
