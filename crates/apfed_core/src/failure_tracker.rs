/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
};
use tracing::debug;

const DAY_MS: i64 = 86_400_000;
const SWEEP_EVERY_MS: i64 = 3_600_000;

/// Failure days older than this no longer count, and available hosts with no
/// activity for this long are forgotten. Never shorter than the threshold.
pub const RETENTION_DAYS: i64 = 30;

/// Coarse per-host availability gate consulted before any delivery attempt.
pub trait DeliveryHealth: Send + Sync {
    fn available(&self, inbox_url: &str) -> bool;
    fn track_success(&self, inbox_url: &str);
    fn track_failure(&self, inbox_url: &str);
    /// The host reached us, so it is reachable again.
    fn reset(&self, inbox_url: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct FailureRecord {
    pub consecutive_failures: u32,
    /// UTC day numbers (days since epoch) with at least one failure.
    pub failure_days: BTreeSet<i64>,
    pub last_success_ms: Option<i64>,
    pub last_failure_ms: Option<i64>,
}

/// Host of an inbox URL, lowercased. Unparseable input is used verbatim so it
/// still gets its own bucket.
pub fn host_key(inbox_url: &str) -> String {
    match reqwest::Url::parse(inbox_url.trim()) {
        Ok(u) => u
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .unwrap_or_else(|| inbox_url.trim().to_string()),
        Err(_) => inbox_url.trim().to_string(),
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A host becomes unavailable after failing on `days_threshold` distinct UTC
/// days, inside the retention window, with no success in between.
pub struct FailureTracker {
    days_threshold: u32,
    retention_days: i64,
    hosts: RwLock<HashMap<String, Arc<Mutex<FailureRecord>>>>,
    last_sweep_ms: AtomicI64,
}

fn lock(m: &Mutex<FailureRecord>) -> MutexGuard<'_, FailureRecord> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FailureTracker {
    pub fn new(days_threshold: u32) -> Self {
        let days_threshold = days_threshold.max(1);
        Self {
            days_threshold,
            retention_days: RETENTION_DAYS.max(days_threshold as i64),
            hosts: RwLock::new(HashMap::new()),
            last_sweep_ms: AtomicI64::new(0),
        }
    }

    fn is_unavailable(&self, r: &FailureRecord) -> bool {
        r.failure_days.len() as u32 >= self.days_threshold
    }

    fn get(&self, host: &str) -> Option<Arc<Mutex<FailureRecord>>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .cloned()
    }

    fn entry(&self, host: String) -> Arc<Mutex<FailureRecord>> {
        if let Some(r) = self.get(&host) {
            return r;
        }
        let mut map = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(host).or_default().clone()
    }

    pub fn track_failure_at(&self, inbox_url: &str, now_ms: i64) {
        {
            let rec = self.entry(host_key(inbox_url));
            let mut r = lock(&rec);
            let today = now_ms.div_euclid(DAY_MS);
            r.consecutive_failures = r.consecutive_failures.saturating_add(1);
            r.failure_days.insert(today);
            let oldest = today - self.retention_days + 1;
            r.failure_days.retain(|d| *d >= oldest);
            r.last_failure_ms = Some(now_ms);
        }
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms - last >= SWEEP_EVERY_MS
            && self
                .last_sweep_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.sweep_at(now_ms);
        }
    }

    /// Forgets available hosts with no success or failure inside the
    /// retention window. Unavailable hosts stay until they reach us again.
    pub fn sweep_at(&self, now_ms: i64) -> usize {
        let cutoff = now_ms - self.retention_days * DAY_MS;
        let mut map = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, rec| {
            let r = lock(rec);
            let last_seen = r.last_failure_ms.max(r.last_success_ms).unwrap_or(0);
            self.is_unavailable(&r) || last_seen >= cutoff
        });
        let removed = before - map.len();
        if removed > 0 {
            debug!("failure tracker forgot {removed} idle hosts");
        }
        removed
    }

    pub fn tracked_hosts(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn track_success_at(&self, inbox_url: &str, now_ms: i64) {
        let host = host_key(inbox_url);
        let Some(rec) = self.get(&host) else {
            // Nothing to clear; skip allocating a record for healthy hosts.
            return;
        };
        let mut r = lock(&rec);
        r.consecutive_failures = 0;
        r.failure_days.clear();
        r.last_success_ms = Some(now_ms);
    }

    pub fn snapshot(&self, inbox_url: &str) -> Option<FailureRecord> {
        self.get(&host_key(inbox_url)).map(|r| lock(&r).clone())
    }

    pub fn unavailable_hosts(&self) -> Vec<String> {
        let map = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = map
            .iter()
            .filter(|(_, r)| self.is_unavailable(&lock(r)))
            .map(|(h, _)| h.clone())
            .collect();
        out.sort();
        out
    }
}

impl DeliveryHealth for FailureTracker {
    fn available(&self, inbox_url: &str) -> bool {
        match self.get(&host_key(inbox_url)) {
            Some(r) => !self.is_unavailable(&lock(&r)),
            None => true,
        }
    }

    fn track_success(&self, inbox_url: &str) {
        self.track_success_at(inbox_url, now_ms())
    }

    fn track_failure(&self, inbox_url: &str) {
        self.track_failure_at(inbox_url, now_ms())
    }

    fn reset(&self, inbox_url: &str) {
        self.track_success_at(inbox_url, now_ms())
    }
}
