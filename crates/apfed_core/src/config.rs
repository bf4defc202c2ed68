/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::{path::Path, time::Duration};

/// Service configuration, loaded from a JSON file. Every optional knob has an
/// accessor that applies the default and clamps to a sane range.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FederationConfig {
    /// Local domain, e.g. `social.example`.
    pub domain: String,
    #[serde(default, alias = "base_url")]
    pub public_base_url: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub data_dir: Option<String>,

    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub http_connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub http_pool_max_idle_per_host: Option<usize>,
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
    #[serde(default)]
    pub max_date_skew_secs: Option<u64>,

    #[serde(default)]
    pub circuit_failure_threshold: Option<u32>,
    #[serde(default)]
    pub circuit_cool_off_secs: Option<u64>,
    #[serde(default)]
    pub failure_days_threshold: Option<u32>,

    #[serde(default)]
    pub distribution_batch_size: Option<usize>,
    #[serde(default)]
    pub sync_followers_threshold: Option<u64>,
    #[serde(default)]
    pub disable_followers_synchronization: bool,

    #[serde(default)]
    pub max_crawl_items: Option<usize>,
    #[serde(default)]
    pub max_thread_depth: Option<u32>,
    #[serde(default)]
    pub max_collection_pages: Option<usize>,

    #[serde(default)]
    pub worker_concurrency: Option<usize>,
    #[serde(default)]
    pub worker_tick_ms: Option<u64>,
    /// Relay inboxes that receive public activity.
    #[serde(default)]
    pub relays: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8788".to_string()
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            public_base_url: String::new(),
            bind: default_bind(),
            data_dir: None,
            http_timeout_secs: None,
            http_connect_timeout_secs: None,
            http_pool_max_idle_per_host: None,
            max_body_bytes: None,
            max_date_skew_secs: None,
            circuit_failure_threshold: None,
            circuit_cool_off_secs: None,
            failure_days_threshold: None,
            distribution_batch_size: None,
            sync_followers_threshold: None,
            disable_followers_synchronization: false,
            max_crawl_items: None,
            max_thread_depth: None,
            max_collection_pages: None,
            worker_concurrency: None,
            worker_tick_ms: None,
            relays: Vec::new(),
        }
    }
}

impl FederationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read config: {}", path.display()))?;
        let cfg: FederationConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse config json: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn base_url(&self) -> String {
        let base = self.public_base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            format!("https://{}", self.domain.trim())
        } else {
            base.to_string()
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(30).clamp(5, 120))
    }

    pub fn http_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http_connect_timeout_secs.unwrap_or(10).clamp(1, 60))
    }

    pub fn http_pool_max_idle_per_host(&self) -> usize {
        self.http_pool_max_idle_per_host.unwrap_or(16).clamp(1, 256)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
            .unwrap_or(2 * 1024 * 1024)
            .clamp(64 * 1024, 16 * 1024 * 1024)
    }

    pub fn max_date_skew(&self) -> Duration {
        Duration::from_secs(self.max_date_skew_secs.unwrap_or(3600).clamp(30, 86_400))
    }

    pub fn circuit_failure_threshold(&self) -> u32 {
        self.circuit_failure_threshold.unwrap_or(10).clamp(1, 1000)
    }

    pub fn circuit_cool_off(&self) -> Duration {
        Duration::from_secs(self.circuit_cool_off_secs.unwrap_or(60).clamp(1, 3600))
    }

    pub fn failure_days_threshold(&self) -> u32 {
        self.failure_days_threshold.unwrap_or(7).clamp(1, 365)
    }

    pub fn distribution_batch_size(&self) -> usize {
        self.distribution_batch_size.unwrap_or(1000).clamp(1, 10_000)
    }

    pub fn sync_followers_threshold(&self) -> u64 {
        self.sync_followers_threshold.unwrap_or(25_000)
    }

    pub fn max_crawl_items(&self) -> usize {
        self.max_crawl_items.unwrap_or(1000).clamp(1, 100_000)
    }

    pub fn max_thread_depth(&self) -> u32 {
        self.max_thread_depth.unwrap_or(50).clamp(1, 1000)
    }

    pub fn max_collection_pages(&self) -> usize {
        self.max_collection_pages.unwrap_or(50).clamp(1, 10_000)
    }

    pub fn worker_concurrency(&self) -> usize {
        self.worker_concurrency.unwrap_or(8).clamp(1, 256)
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms.unwrap_or(1000).clamp(50, 60_000))
    }
}
