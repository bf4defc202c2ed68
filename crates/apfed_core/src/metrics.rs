/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct FederationMetrics {
    pub deliveries_ok: AtomicU64,
    pub deliveries_unsalvageable: AtomicU64,
    pub deliveries_failed: AtomicU64,
    pub deliveries_short_circuited: AtomicU64,
    pub deliveries_skipped: AtomicU64,

    pub jobs_enqueued: AtomicU64,
    pub jobs_done: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub jobs_dead: AtomicU64,
    pub jobs_discarded: AtomicU64,

    pub inbox_accepted: AtomicU64,
    pub inbox_ghosts: AtomicU64,
    pub inbox_rejected: AtomicU64,
    pub inbox_duplicates: AtomicU64,

    pub crawl_discovered: AtomicU64,

    pub http_timeouts: AtomicU64,
    pub http_errors: AtomicU64,

    last_delivery_error: Mutex<Option<String>>,
}

impl FederationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn http_timeout(&self) {
        self.http_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_error(&self) {
        self.http_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_delivery_error(&self, err: String) {
        let mut g = self.last_delivery_error.lock().unwrap_or_else(PoisonError::into_inner);
        *g = Some(err);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let last_error = self
            .last_delivery_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "ts_ms": now_ms(),
            "delivery": {
                "ok": load(&self.deliveries_ok),
                "unsalvageable": load(&self.deliveries_unsalvageable),
                "failed": load(&self.deliveries_failed),
                "short_circuited": load(&self.deliveries_short_circuited),
                "skipped": load(&self.deliveries_skipped),
                "last_error": last_error,
            },
            "jobs": {
                "enqueued": load(&self.jobs_enqueued),
                "done": load(&self.jobs_done),
                "retried": load(&self.jobs_retried),
                "dead": load(&self.jobs_dead),
                "discarded": load(&self.jobs_discarded),
            },
            "inbox": {
                "accepted": load(&self.inbox_accepted),
                "ghosts": load(&self.inbox_ghosts),
                "rejected": load(&self.inbox_rejected),
                "duplicates": load(&self.inbox_duplicates),
            },
            "crawl": {
                "discovered": load(&self.crawl_discovered),
            },
            "errors": {
                "http_timeouts": load(&self.http_timeouts),
                "http_errors": load(&self.http_errors),
            },
        })
    }
}
